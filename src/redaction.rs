use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::io::Write;

lazy_static! {
    static ref TOKEN_REGEX: Regex = Regex::new(
        r"(?i)(sk-[A-Za-z0-9_\-]{16,}|Bearer\s+[^\s]+|x-api-key:\s*[^\s]+)"
    ).expect("Invalid redaction regex");
}

const REDACTED: &str = "[REDACTED]";

/// Scrubs well-known token shapes plus any caller-supplied literal secrets (e.g. the API key of
/// the current request).
pub fn redact_secrets(text: &str, secrets: &[&str]) -> String {
    let mut out = TOKEN_REGEX.replace_all(text, REDACTED).into_owned();
    for secret in secrets {
        // Very short values would shred ordinary text.
        if secret.len() >= 6 {
            out = out.replace(secret, REDACTED);
        }
    }
    out
}

/// Replaces credential-looking fields of a JSON payload before it is logged.
pub fn redact_value(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                let k_lower = k.to_lowercase();
                if k_lower.contains("key")
                    || k_lower.contains("token")
                    || k_lower.contains("secret")
                    || k_lower.contains("password")
                    || k_lower == "authorization"
                {
                    *val = Value::String(REDACTED.to_string());
                    continue;
                }
                redact_value(val);
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val);
            }
        }
        _ => {}
    }
}

/// Log sink wrapper that scrubs tokens from every formatted line before it reaches disk.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = TOKEN_REGEX.replace_all(&input, REDACTED);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_bearer_tokens() {
        let out = redact_secrets("Authorization: Bearer abc.def.ghi", &[]);
        assert!(!out.contains("abc.def.ghi"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn test_redacts_literal_secret() {
        let out = redact_secrets("upstream said: key chengtx809 invalid", &["chengtx809"]);
        assert_eq!(out, "upstream said: key [REDACTED] invalid");
    }

    #[test]
    fn test_short_secrets_are_ignored() {
        let out = redact_secrets("abc abc", &["abc"]);
        assert_eq!(out, "abc abc");
    }

    #[test]
    fn test_redact_value_masks_api_key_fields() {
        let mut payload = json!({
            "model": "m",
            "apiKey": "sk-secret",
            "messages": [{ "role": "user", "content": "hi" }]
        });
        redact_value(&mut payload);
        assert_eq!(payload["apiKey"], REDACTED);
        assert_eq!(payload["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_redacting_writer_scrubs_output() {
        let mut sink = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut sink);
            writer
                .write_all(b"sending Bearer sk-abcdefghijklmnopqrstu to upstream")
                .unwrap();
        }
        let written = String::from_utf8(sink).unwrap();
        assert!(!written.contains("sk-abcdefghijklmnopqrstu"));
    }
}
