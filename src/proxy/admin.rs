//! Optional admin routes for inspecting and driving the coordinator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::generation::GenerationId;
use crate::proxy::error::{ErrorResponse, ProxyError};
use crate::swap::SwapCoordinator;

#[derive(Debug, Serialize)]
pub struct SwapResponse {
    pub generation: GenerationId,
}

/// Routes mounted under the configured admin prefix.
pub fn router(coordinator: Arc<SwapCoordinator>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/swap", post(handle_swap))
        .with_state(coordinator)
}

async fn handle_status(State(coordinator): State<Arc<SwapCoordinator>>) -> impl IntoResponse {
    Json(coordinator.status())
}

/// Trigger a swap (or join the one in flight) and answer once it finishes.
async fn handle_swap(State(coordinator): State<Arc<SwapCoordinator>>) -> Response {
    let handle = coordinator.trigger_swap();
    tracing::info!(generation = %handle.generation(), "Swap requested via admin route");

    match handle.wait().await {
        Ok(generation) => (StatusCode::OK, Json(SwapResponse { generation })).into_response(),
        Err(e) => {
            let request_id = uuid::Uuid::new_v4().to_string();
            ErrorResponse::from_error(&ProxyError::from(e), &request_id)
        }
    }
}
