//! Worker - claims job ids and runs their builds.

use buildhook_core::{BuildRunner, JobFailure, JobId};
use buildhook_db::{Claim, DbError, Stat, Store, WorkerInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Reconciler;

/// Pause after a failed iteration before claiming again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Host recorded for a worker whose machine name could not be read.
pub const UNKNOWN_HOST: &str = "unknown";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] DbError),

    #[error("build error: {0}")]
    Runner(#[from] buildhook_core::Error),

    /// Cancelled while the claim on `job_id` still could not be acknowledged.
    #[error("claim on job {job_id} left unsettled: {source}")]
    Unsettled { job_id: JobId, source: DbError },
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// What one worker iteration did with the id it claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedJob {
    /// The build ran; a non-zero code is a failed build, not a worker error.
    Completed { job_id: JobId, return_code: i32 },
    /// The job was no longer `WAITING` and was acknowledged without running.
    Skipped { job_id: JobId },
    /// The worker could not handle the job; it is on the dead-letter list.
    DeadLettered { job_id: JobId },
}

/// How a claim is acknowledged once its job has been handled.
enum Settlement {
    Complete,
    DeadLetter(JobFailure),
}

/// A single-job-at-a-time consumer of one or more queues.
pub struct Worker {
    info: WorkerInfo,
    /// Host whose dead workers may be pruned. `None` disables pruning.
    prune_host: Option<String>,
    store: Store,
    runner: Arc<dyn BuildRunner>,
    build_root: PathBuf,
    reconciler: Reconciler,
    settle_backoff: Duration,
}

impl Worker {
    /// Worker identified by this host and process.
    pub fn new(
        store: Store,
        runner: Arc<dyn BuildRunner>,
        build_root: impl Into<PathBuf>,
        queues: Vec<String>,
    ) -> Self {
        Self::on_host(store, runner, build_root, local_hostname(), queues)
    }

    /// Worker of this process on `host`. Without a host name the worker
    /// registers as [`UNKNOWN_HOST`] and never prunes other workers.
    pub fn on_host(
        store: Store,
        runner: Arc<dyn BuildRunner>,
        build_root: impl Into<PathBuf>,
        host: Option<String>,
        queues: Vec<String>,
    ) -> Self {
        let info = WorkerInfo::new(
            host.as_deref().unwrap_or(UNKNOWN_HOST),
            std::process::id(),
            queues,
        );
        let mut worker = Self::with_identity(store, runner, build_root, info);
        worker.prune_host = host;
        worker
    }

    pub fn with_identity(
        store: Store,
        runner: Arc<dyn BuildRunner>,
        build_root: impl Into<PathBuf>,
        info: WorkerInfo,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone());
        Self {
            prune_host: Some(info.host.clone()),
            info,
            store,
            runner,
            build_root: build_root.into(),
            reconciler,
            settle_backoff: ERROR_BACKOFF,
        }
    }

    /// Delay between attempts to acknowledge a claim.
    pub fn with_settle_backoff(mut self, backoff: Duration) -> Self {
        self.settle_backoff = backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn queues(&self) -> &[String] {
        &self.info.queues
    }

    /// Work until `cancel` fires. A build already running is finished first.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerResult<()> {
        self.store.queue.register_worker(&self.info).await?;
        info!(
            worker = %self.info.id,
            runner = self.runner.name(),
            queues = ?self.info.queues,
            "Worker started"
        );

        match self.prune_dead_workers().await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "Pruned dead workers"),
            Err(e) => warn!(error = %e, "Failed to prune dead workers"),
        }

        while !cancel.is_cancelled() {
            match self.run_once(&cancel).await {
                Ok(Some(processed)) => debug!(?processed, "Worker iteration finished"),
                Ok(None) => break,
                Err(e @ WorkerError::Unsettled { .. }) => {
                    error!(
                        worker = %self.info.id,
                        error = %e,
                        "Stopping with an unsettled claim, staying registered for pruning"
                    );
                    return Err(e);
                }
                Err(e) => {
                    error!(worker = %self.info.id, error = %e, "Worker iteration failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.store.queue.unregister_worker(&self.info.id).await?;
        info!(worker = %self.info.id, "Worker stopped");
        Ok(())
    }

    /// Claim one id and handle it. `None` when cancelled while waiting.
    pub async fn run_once(&self, cancel: &CancellationToken) -> WorkerResult<Option<ProcessedJob>> {
        if let Err(e) = self.reconciler.reconcile().await {
            warn!(error = %e, "Reconcile before claim failed");
        }

        let Some(claim) = self
            .store
            .queue
            .claim(&self.info.queues, &self.info.id, cancel)
            .await?
        else {
            return Ok(None);
        };
        debug!(job_id = %claim.job_id, queue = %claim.queue, "Claimed job");

        match self.perform(&claim).await {
            Ok(processed) => {
                self.settle(&claim, Settlement::Complete, cancel).await?;
                Ok(Some(processed))
            }
            Err(e) => {
                error!(job_id = %claim.job_id, queue = %claim.queue, error = %e, "Job failed, moving to dead letters");
                let failure = JobFailure::from_error(self.info.id.as_str(), claim.queue.as_str(), &e);
                self.settle(&claim, Settlement::DeadLetter(failure), cancel)
                    .await?;
                Ok(Some(ProcessedJob::DeadLettered {
                    job_id: claim.job_id,
                }))
            }
        }
    }

    /// Acknowledge `claim`, retrying until the store accepts it or `cancel` fires.
    async fn settle(
        &self,
        claim: &Claim,
        settlement: Settlement,
        cancel: &CancellationToken,
    ) -> WorkerResult<()> {
        loop {
            let result = match &settlement {
                Settlement::Complete => self.store.queue.complete(claim).await,
                Settlement::DeadLetter(failure) => {
                    self.store.queue.fail(claim, failure.clone()).await
                }
            };
            let Err(e) = result else {
                return Ok(());
            };
            warn!(job_id = %claim.job_id, queue = %claim.queue, error = %e, "Failed to settle claim, retrying");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WorkerError::Unsettled {
                        job_id: claim.job_id,
                        source: e,
                    });
                }
                _ = tokio::time::sleep(self.settle_backoff) => {}
            }
        }
    }

    async fn perform(&self, claim: &Claim) -> WorkerResult<ProcessedJob> {
        let mut job = self.store.jobs.get(claim.job_id).await?;
        if job.start().is_err() {
            warn!(job_id = %job.id, status = %job.status, "Job is not waiting, skipping");
            return Ok(ProcessedJob::Skipped { job_id: job.id });
        }
        self.store.jobs.put(&job).await?;

        let working_dir = self.build_root.join(&job.project);
        info!(job_id = %job.id, project = %job.project, dir = %working_dir.display(), "Running build");
        let output = self.runner.run(&working_dir).await?;
        let return_code = output.exit_code;
        let succeeded = output.succeeded();

        job.finish(output)?;
        self.store.jobs.put(&job).await?;
        info!(job_id = %job.id, return_code, "Build finished");

        self.store.jobs.incr_stat(Stat::Processed).await?;
        if succeeded {
            self.store.jobs.incr_stat(Stat::Successes).await?;
        } else {
            self.store.jobs.incr_stat(Stat::Failures).await?;
        }

        Ok(ProcessedJob::Completed {
            job_id: job.id,
            return_code,
        })
    }

    /// Unregister workers of this host whose process is gone, dead-lettering
    /// whatever they still held. Returns how many were pruned.
    pub async fn prune_dead_workers(&self) -> WorkerResult<usize> {
        let Some(host) = self.prune_host.as_deref() else {
            warn!(worker = %self.info.id, "Host name unknown, not pruning dead workers");
            return Ok(0);
        };
        let mut pruned = 0;
        for worker in self.store.queue.workers().await? {
            if worker.host != host || worker.id == self.info.id {
                continue;
            }
            if process_alive(worker.pid) {
                continue;
            }
            let moved = self
                .store
                .queue
                .abandon_worker(&worker.id, "worker process exited")
                .await?;
            warn!(worker = %worker.id, claims = moved, "Pruned dead worker");
            pruned += 1;
        }
        Ok(pruned)
    }
}

/// This machine's name. `None` when it cannot be read or is only `localhost`,
/// which would collide with other machines.
pub fn local_hostname() -> Option<String> {
    let name = gethostname::gethostname().into_string().ok()?;
    valid_hostname(&name)
}

fn valid_hostname(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("localhost") {
        return None;
    }
    Some(name.to_string())
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    std::path::Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
