//! Axum router construction for the evaluator.
//!
//! Every connection is a `WebSocket` upgrade. The first path segment
//! selects the role, so `/client` and `/client/anything` both reach the
//! observer handler. CORS is open so browser dashboards can observe.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::EvaluatorState;
use crate::ws;

/// Build the complete Axum router for the evaluator.
///
/// The router includes:
/// - `GET /client` -- observer stream (snapshot, updates, terminated)
/// - `GET /dispatch` -- reporter event stream
///
/// Any other path is answered with `400 Bad Request`.
pub fn build_router(state: Arc<EvaluatorState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/{*path}", get(ws::connect))
        .fallback(ws::unroutable)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
