//! Shared state for the API layer.

use std::sync::Arc;

use crate::agent::SessionManager;
use crate::connection::ConnectionRegistry;
use crate::storage::ObjectStore;
use crate::voice::VoiceAdapter;

/// Shared context for all routes and the WebSocket handler.
///
/// Explicitly constructed and injected (never module-level state) so tests
/// can instantiate independent contexts with mock collaborators.
#[derive(Clone)]
pub struct ApiContext {
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn ObjectStore>,
    pub voice: Arc<VoiceAdapter>,
}

impl ApiContext {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn ObjectStore>,
        voice: Arc<VoiceAdapter>,
    ) -> Self {
        Self {
            sessions,
            registry,
            store,
            voice,
        }
    }
}
