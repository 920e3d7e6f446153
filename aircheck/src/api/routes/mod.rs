//! API route modules, organised by resource.

pub mod health;
pub mod recordings;
pub mod reservations;
pub mod series;

use axum::Router;

use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(series::router())
        .merge(reservations::router())
        .merge(recordings::router())
        .with_state(state)
}
