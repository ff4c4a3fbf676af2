//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One listener serves two surfaces: `/clients` (and `/clients/{id}`) is
//! the admin API for per-client limits; every other path and method falls
//! through to the proxy dispatcher, which forwards to a backend.

pub mod clients;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::proxy;
use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/clients", axum::routing::post(clients::create).get(clients::list))
        .route(
            "/clients/{id}",
            get(clients::get_one).put(clients::update).delete(clients::remove),
        )
        // Anything deeper stays on the admin surface instead of being
        // proxied to a backend.
        .route("/clients/{id}/{*rest}", axum::routing::any(clients::nested_not_found))
        .fallback(proxy::dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
