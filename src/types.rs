use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

/// --- TIMELINE MODEL ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Person {
    pub name: String,
    pub role: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// Assigned from record order in the source text, never from arrival order.
    pub id: String,
    pub date: String,
    pub title: String,
    pub description: String,
    pub people: Vec<Person>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseResult {
    pub summary: String,
    pub events: Vec<TimelineEvent>,
}

/// --- UPSTREAM WIRE TYPES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Extra client fields forwarded untouched (e.g. `max_tokens`).
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// --- CONFIGURATION ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub categories: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub time_range: Option<String>,
    #[serde(default)]
    pub engines: Option<String>,
    #[serde(default)]
    pub num_results: Option<usize>,
}

impl SearchSettings {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.url.trim().is_empty()
    }
}

/// Immutable per-request upstream configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    #[serde(default)]
    pub search: Option<SearchSettings>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field(
                "api_key",
                &if self.api_key.is_empty() { "<missing>" } else { "<configured>" },
            )
            .field("search", &self.search)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(OnelineError::Configuration("upstream endpoint is not configured".into()).into());
        }
        if self.api_key.trim().is_empty() {
            return Err(OnelineError::Configuration("upstream API key is not configured".into()).into());
        }
        Ok(())
    }

    pub fn search_settings(&self) -> Option<&SearchSettings> {
        self.search.as_ref().filter(|s| s.is_active())
    }
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum OnelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error (status {0}): {1}")]
    UpstreamHttp(axum::http::StatusCode, String),

    #[error("Network error: {message}")]
    Network { message: String, timeout: bool },

    #[error("Operation cancelled by caller")]
    Cancelled,

    #[error("Upstream failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<OnelineError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl From<reqwest::Error> for OnelineError {
    fn from(e: reqwest::Error) -> Self {
        let timeout = e.is_timeout();
        // reqwest embeds the full URL in its Display; keep only the kind of failure.
        let message = e.without_url().to_string();
        OnelineError::Network { message, timeout }
    }
}

impl OnelineError {
    pub fn timeout(message: impl Into<String>) -> Self {
        OnelineError::Network {
            message: message.into(),
            timeout: true,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        OnelineError::Network {
            message: message.into(),
            timeout: false,
        }
    }

    /// The innermost error, looking through retry exhaustion.
    pub fn root(&self) -> &OnelineError {
        match self {
            OnelineError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: OnelineError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<OnelineError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- STRUCTURED FAILURE (boundary shape) ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    UpstreamHttp,
    Network,
    Cancelled,
    Internal,
}

/// Credential-free description of a final failure. Sent as JSON at the HTTP boundary and as the
/// terminal frame of a stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub error: String,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub is_timeout: bool,
    pub attempts: u32,
}

impl FailureReport {
    pub fn from_error(err: &OnelineError, secrets: &[&str]) -> Self {
        let attempts = match err {
            OnelineError::RetriesExhausted { attempts, .. } => *attempts,
            OnelineError::Configuration(_) | OnelineError::Cancelled => 0,
            _ => 1,
        };
        let root = err.root();
        let (kind, error, status, is_timeout) = match root {
            OnelineError::Configuration(_) => {
                (FailureKind::Configuration, "Upstream configuration missing", None, false)
            }
            OnelineError::UpstreamHttp(s, _) => (
                FailureKind::UpstreamHttp,
                "Upstream request failed",
                Some(s.as_u16()),
                false,
            ),
            OnelineError::Network { timeout, .. } => (
                FailureKind::Network,
                if *timeout { "Upstream request timed out" } else { "Network error" },
                None,
                *timeout,
            ),
            OnelineError::Cancelled => (FailureKind::Cancelled, "Request cancelled", None, false),
            _ => (FailureKind::Internal, "Internal error", None, false),
        };

        let message = match root {
            OnelineError::UpstreamHttp(_, body) => {
                crate::str_utils::prefix_chars(body.trim(), 500).to_string()
            }
            other => other.to_string(),
        };

        Self {
            error: error.to_string(),
            kind,
            message: crate::redaction::redact_secrets(&message, secrets),
            status,
            is_timeout,
            attempts,
        }
    }

    pub fn http_status(&self) -> axum::http::StatusCode {
        match self.kind {
            FailureKind::Configuration => axum::http::StatusCode::BAD_REQUEST,
            _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for FailureReport {
    fn into_response(self) -> axum::response::Response {
        (self.http_status(), axum::Json(self)).into_response()
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        tracing::debug!("Responding with error. Span trace:\n{}", self.span_trace);
        FailureReport::from_error(&self.inner, &[]).into_response()
    }
}
