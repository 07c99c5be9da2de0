//! Application state.

use buildhook_db::Store;
use buildhook_scheduler::{Dispatcher, Reconciler};
use tracing::{info, warn};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub dispatcher: Dispatcher,
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            dispatcher: Dispatcher::new(store.clone()),
            reconciler: Reconciler::new(store.clone()),
            store,
        }
    }

    /// Finalize dead-lettered jobs before serving a request.
    ///
    /// Failures are logged and otherwise ignored; the request still proceeds.
    pub async fn reconcile(&self) {
        match self.reconciler.reconcile().await {
            Ok(report) if report.finalized > 0 => {
                info!(finalized = report.finalized, "Finalized jobs from dead workers")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Reconcile failed"),
        }
    }
}
