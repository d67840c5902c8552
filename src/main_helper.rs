use crate::constants::*;
use crate::grounding::{SearchProvider, SearxngClient};
use crate::orchestrator::Orchestrator;
use crate::relay::{DeliveryPolicy, HttpUpstream, StreamRelay, Upstream};
use crate::backoff::BackoffPolicy;
use crate::types::*;
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Streaming timeline relay", long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8787)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = MAX_ATTEMPTS)]
    pub max_attempts: u32,
    #[arg(long, default_value_t = 45)]
    pub attempt_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, value_enum, default_value_t = DeliveryPolicy::BufferUntilSuccess)]
    pub delivery: DeliveryPolicy,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    /// Generate one timeline for this query, print it and exit instead of serving.
    #[arg(long)]
    pub query: Option<String>,
    /// With --query, print events as they complete.
    #[arg(long, default_value_t = false)]
    pub stream: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: 8787,
            host: "127.0.0.1".to_string(),
            max_attempts: MAX_ATTEMPTS,
            attempt_timeout_secs: ATTEMPT_TIMEOUT.as_secs(),
            connect_timeout_secs: 10,
            max_body_size: 1024 * 1024,
            delivery: DeliveryPolicy::default(),
            log_dir: "logs".to_string(),
            query: None,
            stream: false,
        }
    }
}

/// Server-side fallback configuration read from the environment.
#[derive(Clone, Default)]
pub struct EnvConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: String,
    pub search: Option<SearchSettings>,
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<configured>"))
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("search", &self.search)
            .finish()
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let search = get(ENV_SEARXNG_URL).map(|url| SearchSettings {
            enabled: true,
            url,
            categories: get(ENV_SEARXNG_CATEGORIES),
            language: get(ENV_SEARXNG_LANGUAGE),
            time_range: get(ENV_SEARXNG_TIME_RANGE),
            engines: get(ENV_SEARXNG_ENGINES),
            num_results: get(ENV_SEARXNG_NUM_RESULTS).and_then(|n| n.parse().ok()),
        });

        Self {
            api_key: get(ENV_API_KEY),
            endpoint: get(ENV_API_ENDPOINT),
            model: get(ENV_API_MODEL).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            search,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.endpoint.is_some()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "Server-side configuration: endpoint {}, API key {}, model {}, search {}",
            if self.endpoint.is_some() { "set" } else { "not set" },
            if self.api_key.is_some() { "set" } else { "not set" },
            self.model,
            if self.search.is_some() { "enabled" } else { "disabled" }
        );
    }
}

/// Upstream settings a client may send with a request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default, rename = "searxng", alias = "search")]
    pub search: Option<SearchSettings>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ClientConfig {
    fn wants_env(&self) -> bool {
        [&self.model, &self.endpoint, &self.api_key]
            .iter()
            .any(|v| v.as_deref() == Some(ENV_CONFIG_MARKER))
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Per-request `Config`. The marker value in any of `model`, `endpoint` or `apiKey` selects the
/// server-side configuration as a whole.
pub fn resolve_config(client: &ClientConfig, env: &EnvConfig) -> Result<Config> {
    if client.wants_env() {
        let (Some(api_key), Some(endpoint)) = (env.api_key.clone(), env.endpoint.clone()) else {
            return Err(OnelineError::Configuration(
                "server-side API configuration missing; configure the API parameters manually"
                    .into(),
            )
            .into());
        };
        return Ok(Config {
            endpoint,
            model: env.model.clone(),
            api_key,
            search: client.search.clone().or_else(|| env.search.clone()),
            temperature: client.temperature,
        });
    }

    let (Some(api_key), Some(endpoint)) = (non_empty(&client.api_key), non_empty(&client.endpoint))
    else {
        return Err(OnelineError::Configuration(
            "API key or endpoint not configured in request".into(),
        )
        .into());
    };

    Ok(Config {
        endpoint,
        model: non_empty(&client.model).unwrap_or_else(|| env.model.clone()),
        api_key,
        search: client.search.clone().or_else(|| env.search.clone()),
        temperature: client.temperature,
    })
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub orchestrator: Orchestrator,
    pub env: Arc<EnvConfig>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(args: Args, client: reqwest::Client, env: EnvConfig) -> Self {
        let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(client.clone()));
        let search: Arc<dyn SearchProvider> = Arc::new(SearxngClient::new(client.clone()));
        Self::with_parts(args, client, env, upstream, search)
    }

    /// Assembles the state around explicit upstream and search implementations.
    pub fn with_parts(
        args: Args,
        client: reqwest::Client,
        env: EnvConfig,
        upstream: Arc<dyn Upstream>,
        search: Arc<dyn SearchProvider>,
    ) -> Self {
        let relay = StreamRelay::new(upstream)
            .with_policy(BackoffPolicy::new(args.max_attempts))
            .with_attempt_timeout(Duration::from_secs(args.attempt_timeout_secs))
            .with_delivery(args.delivery);
        Self {
            client,
            orchestrator: Orchestrator::new(relay, search),
            env: Arc::new(env),
            args: Arc::new(args),
        }
    }

    pub fn resolve(&self, client: &ClientConfig) -> Result<Config> {
        resolve_config(client, &self.env)
    }
}

pub fn build_http_client(args: &Args) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;
    Ok(client)
}
