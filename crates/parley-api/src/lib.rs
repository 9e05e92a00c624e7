pub mod error;
pub mod history;
pub mod middleware;

use axum::{Router, middleware::from_fn_with_state, routing::get};

use parley_gateway::Dispatcher;
use parley_gateway::auth::TokenVerifier;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub verifier: TokenVerifier,
}

/// REST routes for room history. Every route requires a bearer token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/rooms/{room_key}/messages",
            get(history::get_history).delete(history::clear_history),
        )
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}
