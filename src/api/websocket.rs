//! WebSocket layer for live chat.
//!
//! Handles the upgrade at `/ws/chat/:patient_id`, envelope validation,
//! streamed and buffered turns, and the optional voice path. Outbound
//! traffic is decoupled through a bounded channel and a dedicated sender
//! task; when the peer goes away the sender task exits, sends start
//! failing, and any in-flight stream stops.
//!
//! Failures inside a turn are delivered as `error` envelopes on the same
//! channel without closing the connection; only transport-level errors end
//! the session, at which point the connection is removed from the registry.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent::ChatSession;
use crate::api::types::ApiContext;
use crate::connection::{
    AudioEnvelope, ConnectionState, TextEnvelope, WsIncoming, WsOutgoing,
    OUTBOUND_CHANNEL_CAPACITY,
};

/// WebSocket upgrade handler for `/ws/chat/:patient_id`.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(patient_id): Path<String>,
    State(ctx): State<ApiContext>,
) -> impl IntoResponse {
    tracing::info!(patient_id, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_ws(socket, ctx, patient_id))
}

/// Main connection handler: register, greet, serve messages, clean up.
async fn handle_ws(socket: WebSocket, ctx: ApiContext, patient_id: String) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::channel::<WsOutgoing>(OUTBOUND_CHANNEL_CAPACITY);

    // Sender task: reads from the channel, writes to the socket.
    let sender_handle = tokio::spawn(async move {
        let mut sink = ws_sink;
        let mut rx = rx;
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(_) => continue,
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session_id = ctx.registry.connect(&patient_id, tx.clone());

    let _ = tx
        .send(WsOutgoing::status(
            "connected",
            "Connected to admin assistant",
            &session_id,
        ))
        .await;
    ctx.registry.set_state(session_id, ConnectionState::Connected);

    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                ctx.registry.record_message(session_id);
                ctx.registry.set_state(session_id, ConnectionState::Processing);

                match serde_json::from_str::<WsIncoming>(&text) {
                    Ok(envelope) => {
                        handle_envelope(&ctx, session_id, &patient_id, envelope, &tx).await;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Malformed envelope");
                        let _ = tx
                            .send(WsOutgoing::error(format!("malformed message: {e}")))
                            .await;
                    }
                }

                ctx.registry.set_state(session_id, ConnectionState::Idle);
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {} // Ping/Pong handled by the transport.
        }
    }

    // Cleanup: drop the sender (stops the sender task), deregister.
    drop(tx);
    let _ = sender_handle.await;
    ctx.registry.disconnect(session_id);
}

/// Route a validated envelope.
async fn handle_envelope(
    ctx: &ApiContext,
    session_id: Uuid,
    patient_id: &str,
    envelope: WsIncoming,
    tx: &mpsc::Sender<WsOutgoing>,
) {
    match envelope {
        WsIncoming::Text(env) => {
            handle_text_message(ctx, patient_id, env, tx).await;
        }
        WsIncoming::Audio(env) => {
            handle_audio_message(ctx, session_id, patient_id, env, tx).await;
        }
    }
}

async fn handle_text_message(
    ctx: &ApiContext,
    patient_id: &str,
    env: TextEnvelope,
    tx: &mpsc::Sender<WsOutgoing>,
) {
    let Some(response) = run_chat_turn(ctx, patient_id, &env.message, env.stream, tx).await else {
        return;
    };

    if env.voice_response {
        send_voice_response(ctx, &response, tx).await;
    }
}

async fn handle_audio_message(
    ctx: &ApiContext,
    session_id: Uuid,
    patient_id: &str,
    env: AudioEnvelope,
    tx: &mpsc::Sender<WsOutgoing>,
) {
    // Voice off: refuse before anything touches the orchestrator.
    if !ctx.voice.enabled() {
        tracing::warn!(session_id = %session_id, "Audio message refused, voice support is disabled");
        let _ = tx
            .send(WsOutgoing::error("voice support is disabled"))
            .await;
        return;
    }

    let transcript = match ctx.voice.transcribe(&env.audio).await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Transcription failed");
            let _ = tx.send(WsOutgoing::error(e.to_string())).await;
            return;
        }
    };

    let _ = tx.send(WsOutgoing::transcription(transcript.as_str())).await;

    let Some(response) = run_chat_turn(ctx, patient_id, &transcript, env.stream, tx).await else {
        return;
    };

    if env.voice_response {
        send_voice_response(ctx, &response, tx).await;
    }
}

/// Run one chat turn, streamed or buffered. Returns the full response text,
/// or `None` when the turn failed (an `error` envelope has been sent) or
/// the peer vanished.
async fn run_chat_turn(
    ctx: &ApiContext,
    patient_id: &str,
    message: &str,
    stream: bool,
    tx: &mpsc::Sender<WsOutgoing>,
) -> Option<String> {
    let session = ctx.sessions.session(patient_id);

    if stream {
        if tx.send(WsOutgoing::stream_start()).await.is_err() {
            return None;
        }
        let _ = tx.send(WsOutgoing::typing(true)).await;

        let mut fragments = ChatSession::send_stream(session, message.to_string());
        let mut full_text = String::new();
        let mut failed = false;

        while let Some(fragment) = fragments.recv().await {
            match fragment {
                Ok(chunk) => {
                    full_text.push_str(&chunk);
                    if tx.send(WsOutgoing::stream_chunk(chunk)).await.is_err() {
                        // Peer gone: dropping `fragments` cancels the producer.
                        return None;
                    }
                }
                Err(e) => {
                    tracing::error!(patient_id, error = %e, "Streamed turn failed");
                    let _ = tx.send(WsOutgoing::error(e.to_string())).await;
                    failed = true;
                    break;
                }
            }
        }

        let _ = tx.send(WsOutgoing::typing(false)).await;
        let _ = tx.send(WsOutgoing::stream_end()).await;
        if failed {
            return None;
        }
        Some(full_text)
    } else {
        let _ = tx.send(WsOutgoing::typing(true)).await;
        let result = {
            let mut session = session.lock().await;
            session.send(message).await
        };
        let _ = tx.send(WsOutgoing::typing(false)).await;

        match result {
            Ok(response) => {
                if tx.send(WsOutgoing::text(response.as_str())).await.is_err() {
                    return None;
                }
                Some(response)
            }
            Err(e) => {
                tracing::error!(patient_id, error = %e, "Chat turn failed");
                let _ = tx.send(WsOutgoing::error(e.to_string())).await;
                None
            }
        }
    }
}

/// Synthesize the response text and deliver it as base64 audio.
async fn send_voice_response(ctx: &ApiContext, text: &str, tx: &mpsc::Sender<WsOutgoing>) {
    match ctx.voice.synthesize(text).await {
        Ok(audio) => {
            let _ = tx.send(WsOutgoing::audio_response(audio)).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Speech synthesis failed");
            let _ = tx.send(WsOutgoing::error(e.to_string())).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests — full connection lifecycle against a live server
// ---------------------------------------------------------------------------
