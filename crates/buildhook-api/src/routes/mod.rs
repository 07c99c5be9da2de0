//! HTTP routes.

pub mod build;
pub mod health;
pub mod triggers;
pub mod views;

use crate::AppState;
use axum::Router;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(build::router())
        .merge(triggers::router())
        .merge(views::router())
        .merge(health::router())
        .with_state(state)
}
