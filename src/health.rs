use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub server_config: &'static str,
    pub model: String,
    pub search: &'static str,
    pub delivery: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready when the server can answer requests that ask for the server-side configuration. Clients
/// that bring their own endpoint and key are served either way.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let configured = state.env.is_configured();
    if !configured {
        tracing::warn!("Readiness check: server-side API configuration missing");
    }

    let status_code = if configured {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if configured { "ready" } else { "unready" },
            server_config: if configured { "ok" } else { "missing" },
            model: state.env.model.clone(),
            search: if state.env.search.is_some() { "enabled" } else { "disabled" },
            delivery: format!("{:?}", state.args.delivery),
        }),
    )
}
