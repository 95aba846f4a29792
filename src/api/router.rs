//! Router assembly.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//! REST routes are nested under `/api/`; the WebSocket upgrade lives at
//! `/ws/chat/:patient_id`. CORS is wide open, matching the demo frontend's
//! expectations.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;
use crate::api::websocket;

/// Build the full application router.
pub fn app_router(ctx: ApiContext) -> Router {
    let api = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/chat", post(endpoints::chat::send))
        .route("/chat/:patient_id/history", get(endpoints::chat::history))
        .route("/chat/:patient_id/clear", post(endpoints::chat::clear))
        .route("/chat/:patient_id/notify", post(endpoints::chat::notify))
        .route("/patients", get(endpoints::patients::list))
        .route("/sessions", get(endpoints::sessions::list))
        .with_state(ctx.clone());

    let ws = Router::new()
        .route("/ws/chat/:patient_id", get(websocket::ws_upgrade))
        .with_state(ctx);

    Router::new()
        .nest("/api", api)
        .merge(ws)
        .layer(CorsLayer::permissive())
}
