use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use oneline::constants::ENV_CONFIG_MARKER;
use oneline::grounding::{SearchProvider, SearchResults};
use oneline::main_helper::EnvConfig;
use oneline::relay::{ByteStream, ProgressStatus, RelayChunk, Upstream};
use oneline::server::router;
use oneline::*;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

const REPLY: &str = "===总结===\n两件事\n===事件列表===\n--事件1--\n日期：2019-05-01\n标题：早\n来源：甲\n--事件2--\n日期：2023-03-01\n标题：晚\n来源：乙\n";

/// Answers every request with `REPLY`, streamed in three pieces.
#[derive(Default)]
struct FixedUpstream {
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl FixedUpstream {
    fn record(&self, request: &UpstreamRequest) {
        self.seen.lock().unwrap().push(request.clone());
    }
}

impl Upstream for FixedUpstream {
    fn open_stream<'a>(
        &'a self,
        _config: &'a Config,
        request: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        self.record(request);
        let chars: Vec<char> = REPLY.chars().collect();
        let third = chars.len() / 3;
        let pieces: Vec<Result<Bytes>> = [
            &chars[..third],
            &chars[third..2 * third],
            &chars[2 * third..],
        ]
        .iter()
        .map(|part| {
            let content: String = part.iter().collect();
            let line = format!(
                "data: {}\n\n",
                serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
            );
            Ok(Bytes::from(line))
        })
        .collect();
        Box::pin(async move {
            Ok(Box::pin(futures_util::stream::iter(pieces)) as ByteStream)
        })
    }

    fn fetch_json<'a>(
        &'a self,
        _config: &'a Config,
        request: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        self.record(request);
        Box::pin(async {
            Ok(serde_json::json!({
                "id": "fixed",
                "choices": [{ "message": { "role": "assistant", "content": REPLY } }]
            }))
        })
    }
}

struct NoSearch;

impl SearchProvider for NoSearch {
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

fn env(configured: bool) -> EnvConfig {
    EnvConfig {
        api_key: configured.then(|| "server-secret-key".to_string()),
        endpoint: configured.then(|| "https://llm.internal/v1/chat/completions".to_string()),
        model: "server-model".into(),
        search: None,
    }
}

fn app(configured: bool) -> (axum::Router, Arc<FixedUpstream>) {
    let upstream = Arc::new(FixedUpstream::default());
    let state = AppState::with_parts(
        Args::default(),
        reqwest::Client::new(),
        env(configured),
        upstream.clone(),
        Arc::new(NoSearch),
    );
    (router(Arc::new(state)), upstream)
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_liveness_and_readiness() {
    let (app, _) = app(false);
    let live = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);
    assert!(live.headers().contains_key("x-oneline-request-id"));
    assert_eq!(body_json(live).await["status"], "ok");

    let ready = app
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_missing_configuration_is_bad_request() {
    let (app, upstream) = app(false);
    let response = app
        .oneshot(post("/api/timeline", serde_json::json!({ "query": "登月" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "configuration");
    assert!(upstream.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_marker_without_server_configuration_is_bad_request() {
    let (app, _) = app(false);
    let response = app
        .oneshot(post(
            "/api/timeline",
            serde_json::json!({ "query": "q", "apiKey": ENV_CONFIG_MARKER }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_streaming_timeline_emits_ndjson_frames() {
    let (app, upstream) = app(true);
    let response = app
        .oneshot(post(
            "/api/timeline",
            serde_json::json!({ "query": "两件事", "stream": true, "apiKey": ENV_CONFIG_MARKER }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let bytes = body_bytes(response).await;
    let text = std::str::from_utf8(&bytes).unwrap();
    let frames: Vec<RelayChunk> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    let content: Vec<&RelayChunk> = frames
        .iter()
        .filter(|f| !matches!(f, RelayChunk::Progress { .. }))
        .collect();
    assert_eq!(
        content.first(),
        Some(&&RelayChunk::Summary {
            summary: "两件事".into()
        })
    );
    let titles: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            RelayChunk::Event { event } => Some(event.title.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(titles, vec!["早", "晚"]);
    assert_eq!(frames.last(), Some(&RelayChunk::Done));
    assert!(!text.contains("server-secret-key"));

    let seen = upstream.seen.lock().unwrap();
    assert_eq!(seen[0].model, "server-model");
    assert!(seen[0].stream);
}

#[tokio::test]
async fn test_streaming_timeline_reports_progress_before_content() {
    let (app, _) = app(true);
    let response = app
        .oneshot(post(
            "/api/timeline",
            serde_json::json!({ "query": "两件事", "stream": true, "apiKey": ENV_CONFIG_MARKER }),
        ))
        .await
        .unwrap();
    let bytes = body_bytes(response).await;
    let lines: Vec<serde_json::Value> = std::str::from_utf8(&bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(lines[0]["type"], "progress");
    assert_eq!(lines[0]["status"], "pending");
    assert!(lines[0]["message"].as_str().unwrap().contains("两件事"));

    let generating = lines
        .iter()
        .position(|l| {
            l["type"] == "progress"
                && l["message"].as_str().unwrap_or("").contains("server-model")
        })
        .expect("generation step reported");
    let summary = lines.iter().position(|l| l["type"] == "summary").unwrap();
    assert!(generating < summary);

    let frames: Vec<RelayChunk> = lines
        .into_iter()
        .map(|l| serde_json::from_value(l).unwrap())
        .collect();
    assert!(frames[..generating].iter().all(|f| matches!(
        f,
        RelayChunk::Progress {
            status: ProgressStatus::Pending | ProgressStatus::Completed,
            ..
        }
    )));
}

#[tokio::test]
async fn test_buffered_timeline_applies_date_filter() {
    let (app, _) = app(true);
    let response = app
        .oneshot(post(
            "/api/timeline",
            serde_json::json!({
                "query": "两件事",
                "model": ENV_CONFIG_MARKER,
                "startDate": "2020-01-01"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["summary"], "两件事");
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["title"], "晚");
    assert_eq!(events[0]["id"], "event-1");
}

#[tokio::test]
async fn test_chat_forwards_extra_fields_only() {
    let (app, upstream) = app(false);
    let response = app
        .oneshot(post(
            "/api/chat",
            serde_json::json!({
                "endpoint": "https://llm.client/v1/chat/completions",
                "apiKey": "client-key-abcdef",
                "model": "client-model",
                "messages": [{ "role": "user", "content": "hi" }],
                "top_p": 0.9
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["id"], "fixed");

    let seen = upstream.seen.lock().unwrap();
    assert_eq!(seen[0].model, "client-model");
    assert_eq!(seen[0].extra.get("top_p"), Some(&serde_json::json!(0.9)));
    assert!(!seen[0].extra.contains_key("apiKey"));
    assert!(!seen[0].extra.contains_key("endpoint"));
}

#[tokio::test]
async fn test_event_details_buffered() {
    let (app, upstream) = app(true);
    let response = app
        .oneshot(post(
            "/api/event-details",
            serde_json::json!({
                "apiKey": ENV_CONFIG_MARKER,
                "topic": "两件事",
                "event": {
                    "id": "event-1",
                    "date": "2019-05-01",
                    "title": "早",
                    "description": "",
                    "people": [],
                    "source": "甲"
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["content"], REPLY);

    let seen = upstream.seen.lock().unwrap();
    let user = seen[0].messages.last().unwrap();
    assert!(user.content.contains("早"));
}

#[tokio::test]
async fn test_event_details_requires_subject() {
    let (app, _) = app(true);
    let response = app
        .oneshot(post(
            "/api/event-details",
            serde_json::json!({ "apiKey": ENV_CONFIG_MARKER }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
