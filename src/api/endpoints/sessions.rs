//! Active-connection visibility for operators.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::connection::SessionInfo;

#[derive(Serialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionInfo>,
}

/// `GET /api/sessions` — metadata for every live WebSocket connection.
pub async fn list(State(ctx): State<ApiContext>) -> Result<Json<SessionsResponse>, ApiError> {
    let sessions = ctx.registry.list_sessions();
    Ok(Json(SessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}
