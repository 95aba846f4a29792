//! Transport layer: REST endpoints and the WebSocket chat handler.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;
pub mod websocket;

pub use error::ApiError;
pub use router::app_router;
pub use server::{start_server, ChatServer};
pub use types::ApiContext;
