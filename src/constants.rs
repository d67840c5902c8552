use std::time::Duration;

/// Backoff delays applied after the 1st, 2nd and 3rd failed attempt.
pub const RETRY_DELAYS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Delay used for any attempt past the end of `RETRY_DELAYS`.
pub const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(5);

pub const MAX_ATTEMPTS: u32 = 3;

/// Per-attempt wall clock budget. The hosting platform aborts requests at ~60s.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(45);

/// Upstream SSE framing
pub const DATA_PREFIX: &str = "data:";
pub const DONE_TOKEN: &str = "[DONE]";

/// Guard against a runaway upstream that never sends a newline.
pub const MAX_PENDING_LINE_BYTES: usize = 1024 * 1024;

/// Section names, compared after trimming and uppercasing.
pub const SUMMARY_SECTION_NAMES: &[&str] = &["总结", "SUMMARY"];
pub const EVENTS_SECTION_NAMES: &[&str] = &["事件列表", "EVENTS", "EVENT LIST"];

pub const DEFAULT_PERSON_ROLE: &str = "相关方";
pub const UNSPECIFIED_SOURCE: &str = "未指明来源";
pub const FALLBACK_SOURCE_NAME: &str = "查看来源";

pub const EVENT_ID_PREFIX: &str = "event-";

/// Grounding: how many search hits are handed to the model.
pub const MAX_GROUNDING_RESULTS: usize = 20;

/// Marker a client sends in `model`, `endpoint` or `apiKey` to request the server-side configuration.
pub const ENV_CONFIG_MARKER: &str = "使用环境变量配置";

pub const ENV_API_KEY: &str = "API_KEY";
pub const ENV_API_ENDPOINT: &str = "API_ENDPOINT";
pub const ENV_API_MODEL: &str = "API_MODEL";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp-search";

pub const ENV_SEARXNG_URL: &str = "SEARXNG_URL";
pub const ENV_SEARXNG_CATEGORIES: &str = "SEARXNG_CATEGORIES";
pub const ENV_SEARXNG_LANGUAGE: &str = "SEARXNG_LANGUAGE";
pub const ENV_SEARXNG_TIME_RANGE: &str = "SEARXNG_TIME_RANGE";
pub const ENV_SEARXNG_ENGINES: &str = "SEARXNG_ENGINES";
pub const ENV_SEARXNG_NUM_RESULTS: &str = "SEARXNG_NUM_RESULTS";

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
