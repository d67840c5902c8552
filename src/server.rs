use crate::filter::DateFilter;
use crate::health;
use crate::logging::request_id_middleware;
use crate::main_helper::ClientConfig;
use crate::prompts::describe_event;
use crate::relay::RelayChunk;
use crate::types::*;
use crate::AppState;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::NaiveDate;
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Request fields consumed here and never forwarded upstream.
const CLIENT_ONLY_FIELDS: &[&str] = &[
    "model",
    "endpoint",
    "apiKey",
    "searxng",
    "search",
    "temperature",
    "query",
    "stream",
    "messages",
];

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/timeline", post(timeline_handler))
        .route("/api/event-details", post(event_details_handler))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineBody {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub config: ClientConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetailsBody {
    #[serde(default)]
    pub event: Option<TimelineEvent>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub config: ClientConfig,
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "Invalid request", "message": message })),
    )
        .into_response()
}

/// One NDJSON line per frame.
pub fn encode_frame(chunk: &RelayChunk) -> Bytes {
    match serde_json::to_string(chunk) {
        Ok(mut line) => {
            line.push('\n');
            Bytes::from(line)
        }
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            Bytes::from_static(b"{\"type\":\"error\",\"error\":\"Internal error\",\"kind\":\"internal\",\"message\":\"frame encoding failed\",\"isTimeout\":false,\"attempts\":0}\n")
        }
    }
}

/// Frame callback for a spawned relay task. A closed channel means the client went away.
fn frame_sender(
    tx: mpsc::UnboundedSender<RelayChunk>,
    cancel: CancellationToken,
) -> impl FnMut(RelayChunk) + Send + 'static {
    move |chunk| {
        if tx.send(chunk).is_err() && !cancel.is_cancelled() {
            tracing::info!("[⚙️  -> 🖥️ ] Client disconnected, cancelling upstream");
            cancel.cancel();
        }
    }
}

/// Streams frames from `rx` as the response body. Dropping the body cancels the relay.
fn ndjson_response(rx: mpsc::UnboundedReceiver<RelayChunk>, cancel: CancellationToken) -> Response {
    let guard = cancel.drop_guard();
    let frames = UnboundedReceiverStream::new(rx).map(move |chunk| {
        let _guard = &guard;
        Ok::<Bytes, Infallible>(encode_frame(&chunk))
    });
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let serde_json::Value::Object(mut map) = body else {
        return bad_request("request body must be a JSON object");
    };
    let client: ClientConfig = match serde_json::from_value(serde_json::Value::Object(map.clone())) {
        Ok(c) => c,
        Err(e) => return bad_request(&e.to_string()),
    };
    let config = match state.resolve(&client) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    let stream = map.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let messages: Vec<ChatMessage> = match map.get("messages") {
        Some(raw) => match serde_json::from_value(raw.clone()) {
            Ok(m) => m,
            Err(e) => return bad_request(&format!("invalid messages: {}", e)),
        },
        None => match map.get("query").and_then(|q| q.as_str()) {
            Some(q) if !q.trim().is_empty() => vec![ChatMessage::user(q)],
            _ => return bad_request("either messages or query is required"),
        },
    };
    for key in CLIENT_ONLY_FIELDS {
        map.remove(*key);
    }

    let request = UpstreamRequest {
        model: config.model.clone(),
        messages,
        stream,
        temperature: client.temperature,
        extra: map,
    };
    tracing::info!(
        "[🖥️  -> ⚙️ ] chat: model={} stream={} messages={}",
        request.model,
        stream,
        request.messages.len()
    );

    if !stream {
        let cancel = CancellationToken::new();
        return match state.orchestrator.chat(&config, request, &cancel).await {
            Ok(body) => Json(body).into_response(),
            Err(report) => report.into_response(),
        };
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let on_chunk = frame_sender(tx, task_cancel.clone());
        let _ = state
            .orchestrator
            .stream_chat(&config, request, &task_cancel, on_chunk)
            .await;
    });
    ndjson_response(rx, cancel)
}

async fn timeline_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TimelineBody>,
) -> Response {
    let query = body.query.trim().to_string();
    if query.is_empty() {
        return bad_request("query is required");
    }
    let config = match state.resolve(&body.config) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let filter = DateFilter::new(body.start_date, body.end_date);
    tracing::info!(
        "[🖥️  -> ⚙️ ] timeline: query={} stream={}",
        crate::str_utils::log_snippet(&query, 60),
        body.stream
    );

    if !body.stream {
        let cancel = CancellationToken::new();
        return match state.orchestrator.fetch_timeline(&config, &query, &cancel).await {
            Ok(mut result) => {
                result.events = filter.apply(result.events);
                Json(result).into_response()
            }
            Err(report) => report.into_response(),
        };
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut send = frame_sender(tx, task_cancel.clone());
        let on_chunk = move |chunk: RelayChunk| {
            if let RelayChunk::Event { event } = &chunk {
                if !filter.matches(event) {
                    return;
                }
            }
            send(chunk);
        };
        let _ = state
            .orchestrator
            .stream_timeline(&config, &query, &task_cancel, on_chunk)
            .await;
    });
    ndjson_response(rx, cancel)
}

async fn event_details_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EventDetailsBody>,
) -> Response {
    let subject = match (&body.event, body.query.as_deref()) {
        (Some(event), _) => describe_event(event, body.topic.as_deref()),
        (None, Some(q)) if !q.trim().is_empty() => q.trim().to_string(),
        _ => return bad_request("event or query is required"),
    };
    let config = match state.resolve(&body.config) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    tracing::info!(
        "[🖥️  -> ⚙️ ] event-details: {} stream={}",
        crate::str_utils::log_snippet(&subject, 60),
        body.stream
    );

    if !body.stream {
        let cancel = CancellationToken::new();
        return match state
            .orchestrator
            .fetch_event_details(&config, &subject, &cancel)
            .await
        {
            Ok(content) => Json(serde_json::json!({ "content": content })).into_response(),
            Err(report) => report.into_response(),
        };
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let on_chunk = frame_sender(tx, task_cancel.clone());
        let _ = state
            .orchestrator
            .stream_event_details(&config, &subject, &task_cancel, on_chunk)
            .await;
    });
    ndjson_response(rx, cancel)
}
