//! Job scheduling for buildhook.
//!
//! Turns matching webhook events into queued build jobs, runs them on
//! workers, and finalizes jobs whose worker died mid-run.

pub mod dispatcher;
pub mod matcher;
pub mod reconciler;
pub mod requeue;
pub mod shutdown;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, QueuedJob};
pub use matcher::TriggerMatcher;
pub use reconciler::{ReconcileReport, Reconciler};
pub use requeue::RequeueError;
pub use shutdown::install_shutdown_handler;
pub use worker::{ProcessedJob, Worker, WorkerError, WorkerResult};

use buildhook_config::StoreSettings;
use buildhook_db::{DbResult, Store};
use tracing::info;

/// Open the configured store and finalize any jobs left behind by dead workers.
pub async fn open_store(settings: &StoreSettings) -> DbResult<Store> {
    let store = Store::connect(
        &settings.url,
        settings.max_connections,
        settings.poll_interval,
    )
    .await?;

    let report = Reconciler::new(store.clone()).reconcile().await?;
    if report.finalized > 0 {
        info!(finalized = report.finalized, "Finalized jobs from dead workers");
    }
    Ok(store)
}
