//! Defines the HTTP surface of the sink.
//!
//! - `POST /messages`: accept one chat event
//! - `GET  /healthz`: liveness
//! - `GET  /readyz`: readiness (dispatcher accepting, backend reachable)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        message_handlers::create_message,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. The caller attaches [`AppState`] with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/messages", post(create_message))
}
