//! HTTP server for buildhook.
//!
//! Serves the webhook trigger endpoint, trigger administration, requeue and
//! JSON views of builds, queues and workers.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
