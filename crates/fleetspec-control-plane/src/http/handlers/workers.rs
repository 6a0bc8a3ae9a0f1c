//! Worker list handler.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::http::responses::WorkerResponse;
use crate::state::AppState;

/// List live workers as JSON.
pub async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response: Vec<WorkerResponse> = state
        .workers
        .all()
        .await
        .into_iter()
        .map(WorkerResponse::from)
        .collect();
    Json(response)
}
