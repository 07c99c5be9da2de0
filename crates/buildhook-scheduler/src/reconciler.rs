//! Failure reconciler.
//!
//! Drains the dead-letter list and finalizes each affected job with the
//! recorded failure, so a job whose worker died does not stay `RUNNING`
//! forever. Safe to call from any number of processes at once: entries are
//! popped atomically and each is handled by exactly one caller.

use buildhook_db::{DbError, DbResult, DeadLetter, Stat, Store};
use serde::Serialize;
use tracing::{debug, error, warn};

/// Upper bound on entries handled by one [`Reconciler::reconcile`] call.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// What a reconcile pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Jobs moved to `DONE` with an error.
    pub finalized: usize,
    /// Entries dropped because their job was gone or already had a result.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    max_entries: usize,
}

impl Reconciler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Drain the dead-letter list until it is observed empty.
    ///
    /// An entry pushed after the final empty read is left for the next call.
    /// On a store error the entry being handled is put back before returning.
    pub async fn reconcile(&self) -> DbResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for _ in 0..self.max_entries {
            let Some(entry) = self.store.queue.pop_dead_letter().await? else {
                return Ok(report);
            };
            match self.finalize(&entry).await {
                Ok(true) => report.finalized += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(job_id = %entry.job_id, error = %e, "Failed to finalize dead-lettered job");
                    self.store.queue.push_dead_letter(&entry).await?;
                    return Err(e);
                }
            }
        }

        if self.store.queue.dead_letter_count().await? > 0 {
            warn!(
                max_entries = self.max_entries,
                "Dead-letter list not drained, remaining entries left for the next pass"
            );
        }
        Ok(report)
    }

    async fn finalize(&self, entry: &DeadLetter) -> DbResult<bool> {
        let mut job = match self.store.jobs.get(entry.job_id).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => {
                warn!(job_id = %entry.job_id, "Dead letter for unknown build, dropping");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if job.abandon(entry.failure.clone()).is_err() {
            debug!(job_id = %job.id, "Build already has a result, dropping dead letter");
            return Ok(false);
        }

        self.store.jobs.put(&job).await?;
        self.store.jobs.incr_stat(Stat::SystemFailures).await?;
        error!(
            job_id = %job.id,
            queue = %entry.queue,
            worker = %entry.failure.worker,
            error = %entry.failure.error,
            "Build finalized with system error"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildhook_core::{BuildJob, BuildOutcome, BuildOutput, JobFailure, JobId, JobStatus};
    use chrono::Utc;
    use serde_json::json;

    fn failure(worker: &str) -> JobFailure {
        JobFailure {
            worker: worker.to_string(),
            queue: "linux".to_string(),
            failed_at: Utc::now(),
            error: "worker killed".to_string(),
            backtrace: vec!["signal 9".to_string()],
        }
    }

    async fn running_job(store: &Store) -> BuildJob {
        let id = store.jobs.next_id().await.unwrap();
        let mut job = BuildJob::new(id, "p", "linux", json!({}), "manual");
        job.start().unwrap();
        store.jobs.put(&job).await.unwrap();
        job
    }

    fn letter(job_id: JobId, worker: &str) -> DeadLetter {
        DeadLetter {
            job_id,
            queue: "linux".to_string(),
            failure: failure(worker),
        }
    }

    #[tokio::test]
    async fn test_dead_letter_round_trip() {
        let store = Store::in_memory();
        let job = running_job(&store).await;
        store
            .queue
            .push_dead_letter(&letter(job.id, "host:99:linux"))
            .await
            .unwrap();

        let report = Reconciler::new(store.clone()).reconcile().await.unwrap();
        assert_eq!(report.finalized, 1);
        assert_eq!(report.skipped, 0);

        let job = store.jobs.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.return_code.is_none());
        let error = job.error.as_ref().unwrap();
        assert_eq!(error.worker, "host:99:linux");
        assert_eq!(error.backtrace, vec!["signal 9".to_string()]);
        assert_eq!(job.outcome(), BuildOutcome::SystemError);

        assert_eq!(store.queue.dead_letter_count().await.unwrap(), 0);
        assert_eq!(store.jobs.stats().await.unwrap().system_failures, 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = Store::in_memory();
        let job = running_job(&store).await;
        store
            .queue
            .push_dead_letter(&letter(job.id, "w"))
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone());
        reconciler.reconcile().await.unwrap();
        let after_first = store.jobs.get(job.id).await.unwrap();

        let second = reconciler.reconcile().await.unwrap();
        assert_eq!(second, ReconcileReport::default());
        assert_eq!(store.jobs.get(job.id).await.unwrap(), after_first);
        assert_eq!(store.jobs.stats().await.unwrap().system_failures, 1);
    }

    #[tokio::test]
    async fn test_skips_missing_and_finished_jobs() {
        let store = Store::in_memory();
        let id = store.jobs.next_id().await.unwrap();
        let mut done = BuildJob::new(id, "p", "linux", json!({}), "manual");
        done.start().unwrap();
        done.finish(BuildOutput::new(0, "ok")).unwrap();
        store.jobs.put(&done).await.unwrap();

        store.queue.push_dead_letter(&letter(JobId::new(500), "w")).await.unwrap();
        store.queue.push_dead_letter(&letter(id, "w")).await.unwrap();

        let report = Reconciler::new(store.clone()).reconcile().await.unwrap();
        assert_eq!(report.finalized, 0);
        assert_eq!(report.skipped, 2);

        let job = store.jobs.get(id).await.unwrap();
        assert_eq!(job.return_code, Some(0));
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_bounded_pass_leaves_remaining_entries() {
        let store = Store::in_memory();
        for _ in 0..3 {
            let job = running_job(&store).await;
            store.queue.push_dead_letter(&letter(job.id, "w")).await.unwrap();
        }

        let reconciler = Reconciler::new(store.clone()).with_max_entries(2);
        assert_eq!(reconciler.reconcile().await.unwrap().finalized, 2);
        assert_eq!(store.queue.dead_letter_count().await.unwrap(), 1);
        assert_eq!(reconciler.reconcile().await.unwrap().finalized, 1);
        assert_eq!(store.queue.dead_letter_count().await.unwrap(), 0);
    }
}
