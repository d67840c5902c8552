use crate::constants::DEFAULT_TEMPERATURE;
use crate::decoder::completion_content;
use crate::grounding::{grounding_context_with_progress, SearchProvider};
use crate::prompts;
use crate::relay::{ProgressStatus, RelayChunk, RelayMode, StreamRelay};
use crate::types::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point that turns a query into an upstream request and drives the relay.
#[derive(Clone)]
pub struct Orchestrator {
    relay: StreamRelay,
    search: Arc<dyn SearchProvider>,
}

impl Orchestrator {
    pub fn new(relay: StreamRelay, search: Arc<dyn SearchProvider>) -> Self {
        Self { relay, search }
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    /// System prompt, then the grounding block when search is enabled, then the user message.
    /// Search steps are reported to `progress`.
    pub async fn build_messages(
        &self,
        config: &Config,
        system_prompt: &str,
        search_query: &str,
        user_message: String,
        progress: &mut (dyn FnMut(RelayChunk) + Send),
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system_prompt)];
        if let Some(context) = grounding_context_with_progress(
            self.search.as_ref(),
            config.search_settings(),
            search_query,
            progress,
        )
        .await
        {
            messages.push(ChatMessage::system(context));
        }
        messages.push(ChatMessage::user(user_message));
        messages
    }

    pub fn upstream_request(
        config: &Config,
        messages: Vec<ChatMessage>,
        stream: bool,
    ) -> UpstreamRequest {
        UpstreamRequest {
            model: config.model.clone(),
            messages,
            stream,
            temperature: Some(config.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
            extra: serde_json::Map::new(),
        }
    }

    fn failure(config: &Config, err: &ObservedError) -> FailureReport {
        let report = FailureReport::from_error(&err.inner, &[config.api_key.as_str()]);
        if report.kind != FailureKind::Cancelled {
            tracing::error!(
                "[⚙️ ] Request failed ({:?}, attempts={}): {}",
                report.kind,
                report.attempts,
                report.message
            );
            tracing::debug!("Span trace:\n{}", err.span_trace);
        }
        report
    }

    fn checked(config: &Config) -> std::result::Result<(), FailureReport> {
        config.validate().map_err(|e| Self::failure(config, &e))
    }

    async fn timeline_request(
        &self,
        config: &Config,
        query: &str,
        stream: bool,
        progress: &mut (dyn FnMut(RelayChunk) + Send),
    ) -> UpstreamRequest {
        progress(RelayChunk::progress(
            format!("开始处理关键词：{}", query),
            ProgressStatus::Pending,
        ));
        let messages = self
            .build_messages(
                config,
                prompts::TIMELINE_SYSTEM_PROMPT,
                query,
                prompts::timeline_user_message(query),
                progress,
            )
            .await;
        progress(RelayChunk::progress(
            format!("正在使用AI助手生成时间轴，模型：{}", config.model),
            ProgressStatus::Pending,
        ));
        Self::upstream_request(config, messages, stream)
    }

    async fn details_request(
        &self,
        config: &Config,
        subject: &str,
        stream: bool,
        progress: &mut (dyn FnMut(RelayChunk) + Send),
    ) -> UpstreamRequest {
        let messages = self
            .build_messages(
                config,
                prompts::EVENT_DETAILS_SYSTEM_PROMPT,
                prompts::event_search_query(subject),
                prompts::event_details_user_message(subject),
                progress,
            )
            .await;
        progress(RelayChunk::progress(
            format!("正在使用AI助手获取事件详情，模型：{}", config.model),
            ProgressStatus::Pending,
        ));
        Self::upstream_request(config, messages, stream)
    }

    /// Buffered timeline: one upstream call, parsed as a whole.
    pub async fn fetch_timeline(
        &self,
        config: &Config,
        query: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<ParseResult, FailureReport> {
        Self::checked(config)?;
        let request = self.timeline_request(config, query, false, &mut |_| {}).await;
        let body = self
            .relay
            .complete(config, &request, cancel)
            .await
            .map_err(|e| Self::failure(config, &e))?;
        let content = completion_content(&body).unwrap_or_default();
        let result = self.relay.parser().parse(content, true);
        tracing::info!(
            "[⚙️ ] Timeline parsed: {} events, summary {} chars",
            result.events.len(),
            result.summary.chars().count()
        );
        Ok(result)
    }

    /// Streaming timeline: summary and events are handed to `on_chunk` as they close. Returns
    /// the final parse of the full text.
    pub async fn stream_timeline<F>(
        &self,
        config: &Config,
        query: &str,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> std::result::Result<ParseResult, FailureReport>
    where
        F: FnMut(RelayChunk) + Send,
    {
        if let Err(report) = Self::checked(config) {
            on_chunk(RelayChunk::Error(report.clone()));
            return Err(report);
        }
        let request = self.timeline_request(config, query, true, &mut on_chunk).await;
        let text = self
            .relay
            .stream(config, &request, RelayMode::Structured, cancel, on_chunk)
            .await
            .map_err(|e| Self::failure(config, &e))?;
        Ok(self.relay.parser().parse(&text, true))
    }

    pub async fn fetch_event_details(
        &self,
        config: &Config,
        subject: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, FailureReport> {
        Self::checked(config)?;
        let request = self.details_request(config, subject, false, &mut |_| {}).await;
        let body = self
            .relay
            .complete(config, &request, cancel)
            .await
            .map_err(|e| Self::failure(config, &e))?;
        Ok(completion_content(&body).unwrap_or_default().to_string())
    }

    pub async fn stream_event_details<F>(
        &self,
        config: &Config,
        subject: &str,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> std::result::Result<String, FailureReport>
    where
        F: FnMut(RelayChunk) + Send,
    {
        if let Err(report) = Self::checked(config) {
            on_chunk(RelayChunk::Error(report.clone()));
            return Err(report);
        }
        let request = self.details_request(config, subject, true, &mut on_chunk).await;
        self.relay
            .stream(config, &request, RelayMode::Text, cancel, on_chunk)
            .await
            .map_err(|e| Self::failure(config, &e))
    }

    /// Plain chat relay with caller-supplied messages. Returns the upstream body unchanged.
    pub async fn chat(
        &self,
        config: &Config,
        mut request: UpstreamRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, FailureReport> {
        Self::checked(config)?;
        request.stream = false;
        self.relay
            .complete(config, &request, cancel)
            .await
            .map_err(|e| Self::failure(config, &e))
    }

    pub async fn stream_chat<F>(
        &self,
        config: &Config,
        mut request: UpstreamRequest,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> std::result::Result<String, FailureReport>
    where
        F: FnMut(RelayChunk) + Send,
    {
        if let Err(report) = Self::checked(config) {
            on_chunk(RelayChunk::Error(report.clone()));
            return Err(report);
        }
        request.stream = true;
        self.relay
            .stream(config, &request, RelayMode::Text, cancel, on_chunk)
            .await
            .map_err(|e| Self::failure(config, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grounding::SearchResults;
    use crate::relay::{ByteStream, Upstream};
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;

    struct CannedSearch;

    impl SearchProvider for CannedSearch {
        fn search<'a>(
            &'a self,
            query: &'a str,
            _settings: &'a SearchSettings,
        ) -> BoxFuture<'a, Result<SearchResults>> {
            Box::pin(async move {
                Ok(SearchResults {
                    query: query.to_string(),
                    results: Vec::new(),
                })
            })
        }
    }

    /// Records the request and answers with a fixed completion.
    struct EchoUpstream {
        seen: Mutex<Vec<UpstreamRequest>>,
        reply: String,
    }

    impl Upstream for EchoUpstream {
        fn open_stream<'a>(
            &'a self,
            _config: &'a Config,
            _request: &'a UpstreamRequest,
        ) -> BoxFuture<'a, Result<ByteStream>> {
            Box::pin(async { Err(OnelineError::network("streaming not scripted").into()) })
        }

        fn fetch_json<'a>(
            &'a self,
            _config: &'a Config,
            request: &'a UpstreamRequest,
        ) -> BoxFuture<'a, Result<serde_json::Value>> {
            Box::pin(async move {
                if let Ok(mut seen) = self.seen.lock() {
                    seen.push(request.clone());
                }
                Ok(serde_json::json!({
                    "choices": [{ "message": { "content": self.reply } }]
                }))
            })
        }
    }

    fn config(search: bool) -> Config {
        Config {
            endpoint: "https://upstream.test/v1/chat/completions".into(),
            model: "test-model".into(),
            api_key: "test-key-123456".into(),
            search: search.then(|| SearchSettings {
                enabled: true,
                url: "http://search.test".into(),
                ..Default::default()
            }),
            temperature: None,
        }
    }

    fn orchestrator(reply: &str) -> (Orchestrator, Arc<EchoUpstream>) {
        let upstream = Arc::new(EchoUpstream {
            seen: Mutex::new(Vec::new()),
            reply: reply.to_string(),
        });
        let relay = StreamRelay::new(upstream.clone());
        (Orchestrator::new(relay, Arc::new(CannedSearch)), upstream)
    }

    #[tokio::test]
    async fn test_message_order_with_grounding() {
        let (orch, _) = orchestrator("");
        let mut steps = Vec::new();
        let messages = orch
            .build_messages(&config(true), "SYS", "q", "USER".into(), &mut |c| steps.push(c))
            .await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "SYS");
        assert_eq!(messages[1].role, Role::System);
        assert_eq!(messages[1].content, crate::grounding::NO_RESULTS_TEXT);
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(
            steps,
            vec![
                RelayChunk::progress("正在使用搜索引擎查询：q", ProgressStatus::Pending),
                RelayChunk::progress("搜索未返回有效结果", ProgressStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_message_order_without_grounding() {
        let (orch, _) = orchestrator("");
        let mut steps = Vec::new();
        let messages = orch
            .build_messages(&config(false), "SYS", "q", "USER".into(), &mut |c| steps.push(c))
            .await;
        assert_eq!(messages.len(), 2);
        assert!(steps.is_empty());
        assert_eq!(messages[1].content, "USER");
    }

    #[tokio::test]
    async fn test_fetch_timeline_parses_completion() {
        let reply = "===总结===\n概要\n===事件列表===\n--事件1--\n日期：2020\n标题：甲\n来源：S\n";
        let (orch, upstream) = orchestrator(reply);
        let result = orch
            .fetch_timeline(&config(false), "主题", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.summary, "概要");
        assert_eq!(result.events.len(), 1);

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].stream);
        assert_eq!(seen[0].model, "test-model");
        assert_eq!(seen[0].temperature, Some(DEFAULT_TEMPERATURE));
        assert!(seen[0].messages[1].content.contains("主题"));
    }

    #[tokio::test]
    async fn test_missing_key_is_configuration_failure() {
        let (orch, upstream) = orchestrator("");
        let mut cfg = config(false);
        cfg.api_key.clear();
        let report = orch
            .fetch_timeline(&cfg, "q", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(report.kind, FailureKind::Configuration);
        assert_eq!(report.http_status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_config_failure_emits_error_frame() {
        let (orch, _) = orchestrator("");
        let mut cfg = config(false);
        cfg.endpoint.clear();
        let mut frames = Vec::new();
        let result = orch
            .stream_timeline(&cfg, "q", &CancellationToken::new(), |c| frames.push(c))
            .await;
        assert!(result.is_err());
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], RelayChunk::Error(_)));
    }
}
