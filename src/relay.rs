use crate::backoff::{cancellable_sleep, BackoffPolicy};
use crate::constants::ATTEMPT_TIMEOUT;
use crate::decoder::{LineEvent, SseDecoder};
use crate::logging::RelayMetric;
use crate::parser::TimelineParser;
use crate::tracker::EventTracker;
use crate::types::*;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Seam between the relay and the generation service.
pub trait Upstream: Send + Sync {
    /// Opens a streaming request. Resolves once response headers have arrived with a 2xx status.
    fn open_stream<'a>(
        &'a self,
        config: &'a Config,
        request: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<ByteStream>>;

    /// Sends a non-streaming request and returns the response body.
    fn fetch_json<'a>(
        &'a self,
        config: &'a Config,
        request: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, config: &Config, request: &UpstreamRequest) -> Result<reqwest::Response> {
        tracing::info!(
            "[⚙️  -> ☁️ ] POST model={} stream={} messages={}",
            request.model,
            request.stream,
            request.messages.len()
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(mut payload) = serde_json::to_value(request) {
                crate::redaction::redact_value(&mut payload);
                tracing::debug!("[⚙️  -> ☁️ ] Payload: {}", payload);
            }
        }
        let response = self
            .client
            .post(&config.endpoint)
            .bearer_auth(&config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                "[☁️  -> ⚙️ ] Upstream returned {}: {}",
                status,
                crate::str_utils::log_snippet(&body, 200)
            );
            return Err(OnelineError::UpstreamHttp(status, body).into());
        }
        Ok(response)
    }
}

impl Upstream for HttpUpstream {
    fn open_stream<'a>(
        &'a self,
        config: &'a Config,
        request: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(async move {
            let response = self.send(config, request).await?;
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ObservedError::from));
            Ok(Box::pin(stream) as ByteStream)
        })
    }

    fn fetch_json<'a>(
        &'a self,
        config: &'a Config,
        request: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let response = self.send(config, request).await?;
            let text = response.text().await?;
            match serde_json::from_str(&text) {
                Ok(body) => Ok(body),
                Err(_) => {
                    tracing::debug!("[☁️  -> ⚙️ ] Non-JSON completion body, wrapping as content");
                    Ok(serde_json::json!({
                        "choices": [{ "message": { "role": "assistant", "content": text } }]
                    }))
                }
            }
        })
    }
}

/// State of a preparation step reported ahead of the relayed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Pending,
    Completed,
    Error,
}

/// One frame handed to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayChunk {
    Progress {
        message: String,
        status: ProgressStatus,
    },
    Content { content: String },
    Summary { summary: String },
    Event { event: TimelineEvent },
    Error(FailureReport),
    Done,
}

impl RelayChunk {
    pub fn progress(message: impl Into<String>, status: ProgressStatus) -> Self {
        RelayChunk::Progress {
            message: message.into(),
            status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayChunk::Done | RelayChunk::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Content fragments as they arrive.
    Text,
    /// Summary and newly closed events, diffed against what was already delivered.
    Structured,
}

/// How partial output relates to retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeliveryPolicy {
    /// Frames are delivered as soon as they exist. An attempt may be retried only while nothing
    /// has been delivered; a failure after the first delivered frame is terminal.
    CommitOnFirstChunk,
    /// Frames are staged per attempt and delivered only after the attempt succeeds, so every
    /// failure before success stays retryable.
    #[default]
    BufferUntilSuccess,
}

/// Per-request relay state. Never shared between requests.
#[derive(Debug, Default)]
pub struct StreamSession {
    pub buffer: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    tracker: EventTracker,
    decoder: SseDecoder,
    committed: bool,
    pending: Vec<RelayChunk>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any frame has reached the consumer.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn delivered_events(&self) -> usize {
        self.tracker.delivered_count()
    }

    fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.buffer.clear();
        self.decoder = SseDecoder::new();
        self.tracker = EventTracker::new();
        self.pending.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

#[derive(Clone)]
pub struct StreamRelay {
    upstream: Arc<dyn Upstream>,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
    delivery: DeliveryPolicy,
    parser: TimelineParser,
}

impl StreamRelay {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            policy: BackoffPolicy::default(),
            attempt_timeout: ATTEMPT_TIMEOUT,
            delivery: DeliveryPolicy::default(),
            parser: TimelineParser::default(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_parser(mut self, parser: TimelineParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn parser(&self) -> &TimelineParser {
        &self.parser
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn timeout_error(&self) -> ObservedError {
        OnelineError::timeout(format!(
            "no upstream response within {}s",
            self.attempt_timeout.as_secs_f32()
        ))
        .into()
    }

    /// Buffered mode: one complete response body after retries.
    pub async fn complete(
        &self,
        config: &Config,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let mut metric = RelayMetric::new("buffered");
        let result = self
            .policy
            .execute_with_retry(cancel, |attempt| {
                metric.attempts = attempt;
                async move {
                    match tokio::time::timeout(
                        self.attempt_timeout,
                        self.upstream.fetch_json(config, request),
                    )
                    .await
                    {
                        Ok(body) => body,
                        Err(_) => Err(self.timeout_error()),
                    }
                }
            })
            .await;

        if let Ok(body) = &result {
            if let Some(content) = crate::decoder::completion_content(body) {
                metric.content_chars = content.chars().count();
            }
        }
        metric.log_summary(outcome_label(&result));
        result
    }

    /// Streaming mode. Drives `on_chunk` until exactly one terminal frame (`Done` or `Error`) has
    /// been delivered, and returns the full accumulated text on success. Cancellation returns
    /// `Cancelled` without a terminal frame.
    pub async fn stream<F>(
        &self,
        config: &Config,
        request: &UpstreamRequest,
        mode: RelayMode,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<String>
    where
        F: FnMut(RelayChunk) + Send,
    {
        let mut session = StreamSession::new();
        let mut metric = RelayMetric::new(match mode {
            RelayMode::Text => "text",
            RelayMode::Structured => "structured",
        });

        loop {
            session.begin_attempt();
            metric.attempts = session.attempts;

            let outcome = self
                .run_attempt(config, request, mode, cancel, &mut session, &mut on_chunk, &mut metric)
                .await;

            match outcome {
                Ok(()) => {
                    self.finish_success(mode, &mut session, &mut on_chunk, &mut metric);
                    metric.log_summary("ok");
                    return Ok(std::mem::take(&mut session.buffer));
                }
                Err(e) if matches!(e.inner, OnelineError::Cancelled) => {
                    tracing::info!(
                        "[⚙️ ] Relay cancelled by caller during attempt {}",
                        session.attempts
                    );
                    metric.log_summary("cancelled");
                    return Err(e);
                }
                Err(e) => {
                    let retry = !session.committed
                        && self.policy.should_retry(session.attempts, &e.inner);
                    session.last_error = Some(e.inner.to_string());

                    if retry {
                        let delay = self.policy.next_delay(session.attempts);
                        tracing::warn!(
                            "[☁️  -> ⚙️ ] Attempt {}/{} failed: {}. Retrying in {:?}...",
                            session.attempts,
                            self.policy.max_attempts,
                            e.inner,
                            delay
                        );
                        if let Err(cancelled) = cancellable_sleep(delay, cancel).await {
                            metric.log_summary("cancelled");
                            return Err(cancelled);
                        }
                        continue;
                    }

                    if session.committed {
                        tracing::error!(
                            "[☁️  -> ⚙️ ] Stream failed after output was delivered, not retrying: {}",
                            e.inner
                        );
                    } else {
                        tracing::error!(
                            "[☁️  -> ⚙️ ] Giving up after {} attempt(s): {}",
                            session.attempts,
                            e.inner
                        );
                    }

                    let terminal = self.policy.exhausted(session.attempts, e.inner);
                    let report = FailureReport::from_error(&terminal, &[config.api_key.as_str()]);
                    on_chunk(RelayChunk::Error(report));
                    metric.log_summary("error");
                    return Err(terminal.into());
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt<F>(
        &self,
        config: &Config,
        request: &UpstreamRequest,
        mode: RelayMode,
        cancel: &CancellationToken,
        session: &mut StreamSession,
        on_chunk: &mut F,
        metric: &mut RelayMetric,
    ) -> Result<()>
    where
        F: FnMut(RelayChunk) + Send,
    {
        let deadline = Instant::now() + self.attempt_timeout;

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OnelineError::Cancelled.into()),
            opened = tokio::time::timeout_at(deadline, self.upstream.open_stream(config, request)) => {
                match opened {
                    Ok(stream) => stream?,
                    Err(_) => return Err(self.timeout_error()),
                }
            }
        };
        tracing::debug!("[☁️  -> ⚙️ ] Stream opened (attempt {})", session.attempts);

        // One deadline bounds the whole attempt, including reads after output was delivered.
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OnelineError::Cancelled.into()),
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };

            let bytes = match next {
                Err(_) => return Err(self.timeout_error()),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            metric.record_chunk(bytes.len());

            let events = session.decoder.feed(&bytes)?;
            if self.apply_lines(events, mode, session, on_chunk, metric)? == Flow::Done {
                return Ok(());
            }
        }

        let tail = session.decoder.finish()?;
        self.apply_lines(tail, mode, session, on_chunk, metric)?;
        Ok(())
    }

    fn apply_lines<F>(
        &self,
        events: Vec<LineEvent>,
        mode: RelayMode,
        session: &mut StreamSession,
        on_chunk: &mut F,
        metric: &mut RelayMetric,
    ) -> Result<Flow>
    where
        F: FnMut(RelayChunk) + Send,
    {
        let mut flow = Flow::Continue;
        let mut grew = false;
        for event in events {
            match event {
                LineEvent::Content(text) | LineEvent::Literal(text) => {
                    metric.content_chars += text.chars().count();
                    session.buffer.push_str(&text);
                    grew = true;
                    if mode == RelayMode::Text {
                        self.deliver(session, on_chunk, RelayChunk::Content { content: text });
                    }
                }
                LineEvent::Error(message) => {
                    tracing::warn!("[☁️  -> ⚙️ ] In-band upstream error: {}", message);
                    return Err(OnelineError::UpstreamHttp(StatusCode::BAD_GATEWAY, message).into());
                }
                LineEvent::Done => {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream end marker received");
                    flow = Flow::Done;
                    break;
                }
                LineEvent::Ignored => {}
            }
        }

        if grew && mode == RelayMode::Structured {
            let parsed = self.parser.parse(&session.buffer, false);
            self.emit_delta(&parsed, session, on_chunk, metric);
        }
        Ok(flow)
    }

    fn emit_delta<F>(
        &self,
        parsed: &ParseResult,
        session: &mut StreamSession,
        on_chunk: &mut F,
        metric: &mut RelayMetric,
    ) where
        F: FnMut(RelayChunk) + Send,
    {
        let delta = session.tracker.observe(parsed);
        if let Some(summary) = delta.summary {
            self.deliver(session, on_chunk, RelayChunk::Summary { summary });
        }
        for event in delta.events {
            metric.events += 1;
            self.deliver(session, on_chunk, RelayChunk::Event { event });
        }
    }

    fn deliver<F>(&self, session: &mut StreamSession, on_chunk: &mut F, chunk: RelayChunk)
    where
        F: FnMut(RelayChunk) + Send,
    {
        match self.delivery {
            DeliveryPolicy::CommitOnFirstChunk => {
                session.committed = true;
                on_chunk(chunk);
            }
            DeliveryPolicy::BufferUntilSuccess => session.pending.push(chunk),
        }
    }

    fn finish_success<F>(
        &self,
        mode: RelayMode,
        session: &mut StreamSession,
        on_chunk: &mut F,
        metric: &mut RelayMetric,
    ) where
        F: FnMut(RelayChunk) + Send,
    {
        if mode == RelayMode::Structured {
            let parsed = self.parser.parse(&session.buffer, true);
            self.emit_delta(&parsed, session, on_chunk, metric);
        }
        if session.buffer.is_empty() {
            tracing::warn!("[☁️  -> ⚙️ ] Upstream stream finished without any content");
        }
        for chunk in session.pending.drain(..) {
            on_chunk(chunk);
        }
        session.committed = true;
        if mode == RelayMode::Structured {
            tracing::debug!(
                "[⚙️ ] Delivered {} event(s) from attempt {}",
                session.delivered_events(),
                session.attempts
            );
        }
        on_chunk(RelayChunk::Done);
    }
}

fn outcome_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) if matches!(e.inner, OnelineError::Cancelled) => "cancelled",
        Err(_) => "error",
    }
}
