use crate::redaction::RedactingWriter;
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Instant;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-oneline-request-id";

/// Installs the global subscriber: stdout plus a daily log file whose lines are scrubbed of
/// credentials. Keep the returned guard alive for the lifetime of the process.
pub fn init_tracing(log_dir: &str) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => tracing_subscriber::EnvFilter::new("oneline=info,relay_metrics=info,panic=error,tower_http=warn"),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "oneline.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_writer = move || RedactingWriter::new(non_blocking.clone());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics through tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id, path = %req.uri().path());
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Counters for one relay call, logged once when it returns.
pub struct RelayMetric {
    pub mode: &'static str,
    pub attempts: u32,
    pub chunks: usize,
    pub bytes: usize,
    pub content_chars: usize,
    pub events: usize,
    started: Instant,
}

impl RelayMetric {
    pub fn new(mode: &'static str) -> Self {
        Self {
            mode,
            attempts: 0,
            chunks: 0,
            bytes: 0,
            content_chars: 0,
            events: 0,
            started: Instant::now(),
        }
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len;
    }

    pub fn log_summary(&self, outcome: &str) {
        info!(
            target: "relay_metrics",
            "[RELAY END] Mode: {} | Outcome: {} | Attempts: {} | Chunks: {} ({} bytes) | Text: {} chars | Events: {} | {:?}",
            self.mode,
            outcome,
            self.attempts,
            self.chunks,
            self.bytes,
            self.content_chars,
            self.events,
            self.started.elapsed()
        );
    }
}
