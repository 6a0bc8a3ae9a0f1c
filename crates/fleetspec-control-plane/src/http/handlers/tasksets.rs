//! Active taskset list handler.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::error;

use crate::http::responses::{ErrorResponse, TasksetResponse};
use crate::state::AppState;
use crate::store::TasksetFilter;

#[derive(Debug, Deserialize)]
pub struct TasksetQuery {
    pub rsync_name: Option<String>,
}

/// List active tasksets, optionally for one owner.
pub async fn list_active_tasksets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TasksetQuery>,
) -> impl IntoResponse {
    let filter = TasksetFilter {
        rsync_name: query.rsync_name,
        active_only: true,
    };
    match state.store.tasksets(&filter).await {
        Ok(tasksets) => {
            let response: Vec<TasksetResponse> =
                tasksets.into_iter().map(TasksetResponse::from).collect();
            Json(response).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to list tasksets");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
