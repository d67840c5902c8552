/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Short single-line preview of a payload for log lines.
pub fn log_snippet(s: &str, max_chars: usize) -> String {
    let head = prefix_chars(s, max_chars);
    let flat = head.replace(['\n', '\r'], "⏎");
    if head.len() < s.len() {
        format!("{}...", flat)
    } else {
        flat
    }
}

/// Runs of ASCII digits in order of appearance: `"2023年1月5日"` -> `["2023", "1", "5"]`.
pub fn digit_groups(s: &str) -> Vec<&str> {
    s.split(|c: char| !c.is_ascii_digit())
        .filter(|g| !g.is_empty())
        .collect()
}

/// Strips separators a model tends to leave between a label and a URL (`"Reuters - "`, `"新华社："`).
pub fn trim_label_separators(s: &str) -> &str {
    s.trim_end_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '：' | '-' | '—' | '–'))
        .trim()
}

/// Removes one layer of markdown emphasis around a short value (`**Title**` -> `Title`).
pub fn strip_emphasis(s: &str) -> &str {
    let trimmed = s.trim();
    for marker in ["**", "__", "*", "_"] {
        if let Some(inner) = trimmed
            .strip_prefix(marker)
            .and_then(|rest| rest.strip_suffix(marker))
        {
            if !inner.is_empty() {
                return inner.trim();
            }
        }
    }
    trimmed
}
