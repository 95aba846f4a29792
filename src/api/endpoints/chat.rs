//! REST chat endpoints: submit a message, fetch stored history, clear it.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::agent::session::history_path;
use crate::api::error::ApiError;
use crate::api::types::ApiContext;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub patient_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub patient_id: String,
    pub response: String,
    pub status: &'static str,
}

/// `POST /api/chat` — submit a message and get the complete response.
///
/// Locking the session serializes this turn behind any in-flight turn for
/// the same patient.
pub async fn send(
    State(ctx): State<ApiContext>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is empty".into()));
    }
    tracing::info!(patient_id = %payload.patient_id, "REST chat message received");

    let session = ctx.sessions.session(&payload.patient_id);
    let mut session = session.lock().await;
    let response = session.send(&payload.message).await?;

    Ok(Json(ChatResponse {
        patient_id: payload.patient_id,
        response,
        status: "success",
    }))
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub patient_id: String,
    pub conversation: serde_json::Value,
}

/// `GET /api/chat/:patient_id/history` — the patient's conversation.
///
/// Prefers the live in-memory session; falls back to the stored blob.
pub async fn history(
    State(ctx): State<ApiContext>,
    Path(patient_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    if let Some(session) = ctx.sessions.existing(&patient_id) {
        let session = session.lock().await;
        let conversation = serde_json::to_value(session.history())
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        return Ok(Json(HistoryResponse {
            patient_id,
            conversation,
        }));
    }

    let stored = ctx
        .store
        .read_json(&history_path(&patient_id))
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("no chat history for patient {patient_id}")))?;

    let conversation = stored
        .get("conversation")
        .cloned()
        .unwrap_or(serde_json::Value::Array(vec![]));

    Ok(Json(HistoryResponse {
        patient_id,
        conversation,
    }))
}

#[derive(Deserialize)]
pub struct NotifyRequest {
    pub message: String,
}

#[derive(Serialize)]
pub struct NotifyResponse {
    pub patient_id: String,
    pub delivered: usize,
}

/// `POST /api/chat/:patient_id/notify` — push a text message to every live
/// WebSocket session for a patient. Returns how many sessions received it.
pub async fn notify(
    State(ctx): State<ApiContext>,
    Path(patient_id): Path<String>,
    Json(payload): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is empty".into()));
    }

    let delivered = ctx
        .registry
        .broadcast_to_patient(
            &patient_id,
            crate::connection::WsOutgoing::text(payload.message.as_str()),
        )
        .await;
    tracing::info!(patient_id = %patient_id, delivered, "Notification broadcast");

    Ok(Json(NotifyResponse {
        patient_id,
        delivered,
    }))
}

#[derive(Serialize)]
pub struct ClearResponse {
    pub patient_id: String,
    pub status: &'static str,
}

/// `POST /api/chat/:patient_id/clear` — discard the conversation.
///
/// Clears the in-memory session and overwrites the stored blob with an
/// empty conversation. Non-reversible.
pub async fn clear(
    State(ctx): State<ApiContext>,
    Path(patient_id): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let session = ctx.sessions.session(&patient_id);
    let mut session = session.lock().await;
    session.clear_history();
    session.save_history().await?;

    Ok(Json(ClearResponse {
        patient_id,
        status: "cleared",
    }))
}
