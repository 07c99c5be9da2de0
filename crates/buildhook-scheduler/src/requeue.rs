//! Requeue - rerun a build as a new job.

use buildhook_core::JobId;
use buildhook_db::DbError;
use thiserror::Error;
use tracing::info;

use crate::Dispatcher;

#[derive(Debug, Error)]
pub enum RequeueError {
    #[error("build {0} not found")]
    NotFound(JobId),

    #[error("store error: {0}")]
    Store(#[from] DbError),
}

impl Dispatcher {
    /// Mark `old` as requeued and enqueue a fresh copy of it on the same queue.
    ///
    /// The original keeps its status and results; only its `requeued` flag
    /// changes. Jobs in any state may be requeued.
    pub async fn requeue(&self, old: JobId) -> Result<JobId, RequeueError> {
        let mut job = match self.store.jobs.get(old).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => return Err(RequeueError::NotFound(old)),
            Err(e) => return Err(e.into()),
        };

        job.requeued = true;
        self.store.jobs.put(&job).await?;

        let id = self.store.jobs.next_id().await?;
        let copy = job.requeued_copy(id);
        self.enqueue(&copy).await?;

        info!(old_id = %old, new_id = %id, queue = %copy.queue, "Build requeued");
        Ok(id)
    }
}
