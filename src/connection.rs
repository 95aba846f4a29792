//! Connection registry for live WebSocket chat channels.
//!
//! Maps generated session ids to live outbound channels plus a per-patient
//! secondary index for fan-out. Both maps live behind one lock so a reader
//! never observes one updated without the other. The primary map owns the
//! `Connection`; the patient index holds only session ids.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of each connection's outbound channel.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

/// Server → client messages. Every variant carries an RFC 3339 timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    /// Connection acknowledged.
    Status {
        status: String,
        message: String,
        session_id: String,
        timestamp: String,
    },
    /// Complete (non-streamed) response text.
    Text { content: String, timestamp: String },
    /// Typing indicator.
    Typing { is_typing: bool, timestamp: String },
    /// A streamed response is starting.
    StreamStart { timestamp: String },
    /// One ordered response fragment.
    StreamChunk { content: String, timestamp: String },
    /// The streamed response is complete.
    StreamEnd { timestamp: String },
    /// Transcript of an inbound audio chunk.
    Transcription { content: String, timestamp: String },
    /// Synthesized speech for the response, base64-encoded.
    AudioResponse { audio: String, timestamp: String },
    /// Something went wrong; the connection stays usable.
    Error { error: String, timestamp: String },
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl WsOutgoing {
    pub fn status(status: &str, message: &str, session_id: &Uuid) -> Self {
        WsOutgoing::Status {
            status: status.to_string(),
            message: message.to_string(),
            session_id: session_id.to_string(),
            timestamp: now(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        WsOutgoing::Text {
            content: content.into(),
            timestamp: now(),
        }
    }

    pub fn typing(is_typing: bool) -> Self {
        WsOutgoing::Typing {
            is_typing,
            timestamp: now(),
        }
    }

    pub fn stream_start() -> Self {
        WsOutgoing::StreamStart { timestamp: now() }
    }

    pub fn stream_chunk(content: impl Into<String>) -> Self {
        WsOutgoing::StreamChunk {
            content: content.into(),
            timestamp: now(),
        }
    }

    pub fn stream_end() -> Self {
        WsOutgoing::StreamEnd { timestamp: now() }
    }

    pub fn transcription(content: impl Into<String>) -> Self {
        WsOutgoing::Transcription {
            content: content.into(),
            timestamp: now(),
        }
    }

    pub fn audio_response(audio: impl Into<String>) -> Self {
        WsOutgoing::AudioResponse {
            audio: audio.into(),
            timestamp: now(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        WsOutgoing::Error {
            error: error.into(),
            timestamp: now(),
        }
    }
}

/// Client → server messages: either a text message or an audio chunk.
///
/// A closed union: the variants below are the only accepted shapes, and
/// anything else fails at the boundary with a structured error instead of
/// propagating an unexpected shape inward.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WsIncoming {
    Audio(AudioEnvelope),
    Text(TextEnvelope),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextEnvelope {
    pub message: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub voice_response: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioEnvelope {
    /// Forces the discriminator: only `"audio_chunk"` parses.
    #[serde(rename = "type")]
    pub kind: AudioChunkTag,
    /// Base64-encoded mono 16 kHz LINEAR16 PCM.
    pub audio: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub voice_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub enum AudioChunkTag {
    #[serde(rename = "audio_chunk")]
    AudioChunk,
}

fn default_stream() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle of one connection. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Processing,
    Idle,
    Disconnected,
}

/// A live connection. Owned exclusively by the registry's primary map.
#[derive(Debug)]
struct Connection {
    session_id: Uuid,
    patient_id: String,
    channel: mpsc::Sender<WsOutgoing>,
    state: ConnectionState,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: u64,
}

/// Serializable connection metadata for monitoring. Never exposes the
/// channel itself.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub patient_id: String,
    pub state: ConnectionState,
    pub connected_at: String,
    pub last_activity: String,
    pub message_count: u64,
    pub duration_seconds: i64,
}

impl From<&Connection> for SessionInfo {
    fn from(conn: &Connection) -> Self {
        Self {
            session_id: conn.session_id,
            patient_id: conn.patient_id.clone(),
            state: conn.state,
            connected_at: conn.connected_at.to_rfc3339(),
            last_activity: conn.last_activity.to_rfc3339(),
            message_count: conn.message_count,
            duration_seconds: (Utc::now() - conn.connected_at).num_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryInner {
    /// Point of truth, keyed by session id.
    sessions: HashMap<Uuid, Connection>,
    /// Weak back-reference only; every id here exists in `sessions`.
    by_patient: HashMap<String, HashSet<Uuid>>,
}

/// Tracks all live connections. Explicitly constructed and passed by
/// reference so tests can instantiate independent registries.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Generates a fresh session id and inserts
    /// into both maps under one lock.
    pub fn connect(&self, patient_id: &str, channel: mpsc::Sender<WsOutgoing>) -> Uuid {
        let session_id = Uuid::new_v4();
        let connection = Connection {
            session_id,
            patient_id: patient_id.to_string(),
            channel,
            state: ConnectionState::Connecting,
            connected_at: Utc::now(),
            last_activity: Utc::now(),
            message_count: 0,
        };

        let mut inner = self.inner.lock().expect("registry lock");
        inner.sessions.insert(session_id, connection);
        inner
            .by_patient
            .entry(patient_id.to_string())
            .or_default()
            .insert(session_id);

        tracing::info!(
            session_id = %session_id,
            patient_id,
            active = inner.sessions.len(),
            "WebSocket connection registered"
        );
        session_id
    }

    /// Remove a connection from both maps. Idempotent: unknown or
    /// already-removed ids are a no-op.
    pub fn disconnect(&self, session_id: Uuid) {
        let mut inner = self.inner.lock().expect("registry lock");
        let Some(mut connection) = inner.sessions.remove(&session_id) else {
            return;
        };
        connection.state = ConnectionState::Disconnected;

        if let Some(ids) = inner.by_patient.get_mut(&connection.patient_id) {
            ids.remove(&session_id);
            if ids.is_empty() {
                inner.by_patient.remove(&connection.patient_id);
            }
        }

        tracing::info!(
            session_id = %session_id,
            patient_id = %connection.patient_id,
            active = inner.sessions.len(),
            "WebSocket connection removed"
        );
    }

    /// Transition a connection's state. Returns false for unknown ids.
    pub fn set_state(&self, session_id: Uuid, state: ConnectionState) -> bool {
        let mut inner = self.inner.lock().expect("registry lock");
        match inner.sessions.get_mut(&session_id) {
            Some(connection) => {
                tracing::debug!(
                    session_id = %session_id,
                    from = ?connection.state,
                    to = ?state,
                    "Connection state transition"
                );
                connection.state = state;
                connection.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Count an inbound message against a connection.
    pub fn record_message(&self, session_id: Uuid) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(connection) = inner.sessions.get_mut(&session_id) {
            connection.message_count += 1;
            connection.last_activity = Utc::now();
        }
    }

    /// Send a message to every session registered under a patient at call
    /// time. A session that disconnects concurrently just reduces the
    /// recipient count; the broadcast itself never fails.
    pub async fn broadcast_to_patient(&self, patient_id: &str, message: WsOutgoing) -> usize {
        // Snapshot the channels, then send outside the lock.
        let channels: Vec<(Uuid, mpsc::Sender<WsOutgoing>)> = {
            let inner = self.inner.lock().expect("registry lock");
            inner
                .by_patient
                .get(patient_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| {
                            inner.sessions.get(id).map(|c| (*id, c.channel.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for (session_id, channel) in channels {
            if channel.send(message.clone()).await.is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(session_id = %session_id, "Broadcast skipped dead channel");
            }
        }
        delivered
    }

    /// Metadata snapshot of every live connection.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().expect("registry lock");
        inner.sessions.values().map(SessionInfo::from).collect()
    }

    /// Metadata for one connection.
    pub fn session_info(&self, session_id: Uuid) -> Option<SessionInfo> {
        let inner = self.inner.lock().expect("registry lock");
        inner.sessions.get(&session_id).map(SessionInfo::from)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<WsOutgoing>, mpsc::Receiver<WsOutgoing>) {
        mpsc::channel(OUTBOUND_CHANNEL_CAPACITY)
    }

    #[test]
    fn connect_then_disconnect_leaves_no_trace() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.len(), 0);

        let (tx, _rx) = channel();
        let session_id = registry.connect("P0001", tx);
        assert_eq!(registry.len(), 1);
        assert!(registry.session_info(session_id).is_some());

        registry.disconnect(session_id);
        assert_eq!(registry.len(), 0);
        assert!(registry.session_info(session_id).is_none());
        assert!(registry.list_sessions().is_empty());
        // Patient index cleaned up too: a broadcast finds nobody.
        let inner = registry.inner.lock().unwrap();
        assert!(inner.by_patient.is_empty());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let session_id = registry.connect("P0001", tx);

        registry.disconnect(session_id);
        registry.disconnect(session_id);
        registry.disconnect(Uuid::new_v4());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn state_transitions_touch_activity() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let session_id = registry.connect("P0001", tx);

        assert_eq!(
            registry.session_info(session_id).unwrap().state,
            ConnectionState::Connecting
        );
        assert!(registry.set_state(session_id, ConnectionState::Connected));
        assert!(registry.set_state(session_id, ConnectionState::Processing));
        assert!(registry.set_state(session_id, ConnectionState::Idle));
        assert_eq!(
            registry.session_info(session_id).unwrap().state,
            ConnectionState::Idle
        );
        assert!(!registry.set_state(Uuid::new_v4(), ConnectionState::Idle));
    }

    #[test]
    fn record_message_increments_count() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let session_id = registry.connect("P0001", tx);

        registry.record_message(session_id);
        registry.record_message(session_id);
        assert_eq!(registry.session_info(session_id).unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_exactly_the_patients_sessions() {
        let registry = ConnectionRegistry::new();
        let (tx_a1, mut rx_a1) = channel();
        let (tx_a2, mut rx_a2) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.connect("P0001", tx_a1);
        registry.connect("P0001", tx_a2);
        registry.connect("P0002", tx_b);

        let delivered = registry
            .broadcast_to_patient("P0001", WsOutgoing::text("lab results ready"))
            .await;
        assert_eq!(delivered, 2);

        assert!(matches!(rx_a1.try_recv().unwrap(), WsOutgoing::Text { .. }));
        assert!(matches!(rx_a2.try_recv().unwrap(), WsOutgoing::Text { .. }));
        // The other patient's session never sees the message.
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_survives_a_dead_channel() {
        let registry = ConnectionRegistry::new();
        let (tx_live, mut rx_live) = channel();
        let (tx_dead, rx_dead) = channel();
        registry.connect("P0001", tx_live);
        registry.connect("P0001", tx_dead);
        drop(rx_dead);

        let delivered = registry
            .broadcast_to_patient("P0001", WsOutgoing::text("hello"))
            .await;
        assert_eq!(delivered, 1);
        assert!(rx_live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_patient_reaches_nobody() {
        let registry = ConnectionRegistry::new();
        let delivered = registry
            .broadcast_to_patient("P0404", WsOutgoing::text("anyone?"))
            .await;
        assert_eq!(delivered, 0);
    }

    #[test]
    fn list_sessions_exposes_metadata_not_channels() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        registry.connect("P0001", tx);

        let sessions = registry.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].patient_id, "P0001");
        // SessionInfo is plain serializable data.
        let json = serde_json::to_value(&sessions).unwrap();
        assert!(json[0].get("channel").is_none());
        assert_eq!(json[0]["state"], "connecting");
    }

    // -- Envelope parsing -----------------------------------------------------

    #[test]
    fn text_envelope_parses_with_defaults() {
        let parsed: WsIncoming =
            serde_json::from_str(r#"{"message": "hello"}"#).unwrap();
        match parsed {
            WsIncoming::Text(env) => {
                assert_eq!(env.message, "hello");
                assert!(env.stream);
                assert!(!env.voice_response);
            }
            other => panic!("expected text envelope, got {other:?}"),
        }
    }

    #[test]
    fn audio_envelope_requires_the_discriminator() {
        let parsed: WsIncoming = serde_json::from_str(
            r#"{"type": "audio_chunk", "audio": "UklGRg==", "voice_response": true}"#,
        )
        .unwrap();
        match parsed {
            WsIncoming::Audio(env) => {
                assert_eq!(env.audio, "UklGRg==");
                assert!(env.voice_response);
            }
            other => panic!("expected audio envelope, got {other:?}"),
        }
    }

    #[test]
    fn unknown_shapes_fail_at_the_boundary() {
        assert!(serde_json::from_str::<WsIncoming>(r#"{"type": "video_chunk", "data": "x"}"#).is_err());
        assert!(serde_json::from_str::<WsIncoming>(r#"{"unrelated": true}"#).is_err());
        assert!(serde_json::from_str::<WsIncoming>("not json").is_err());
    }

    #[test]
    fn outgoing_envelopes_use_snake_case_types() {
        let json = serde_json::to_value(WsOutgoing::stream_start()).unwrap();
        assert_eq!(json["type"], "stream_start");
        let json = serde_json::to_value(WsOutgoing::error("boom")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "boom");
        assert!(json["timestamp"].is_string());
    }
}
