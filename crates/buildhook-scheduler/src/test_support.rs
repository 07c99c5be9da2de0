//! Shared fixtures for scheduler tests.

use async_trait::async_trait;
use buildhook_core::{BuildJob, BuildOutput, BuildRunner, Error, JobFailure, JobId, Result};
use buildhook_db::{
    Claim, DbError, DbResult, DeadLetter, JobRepo, Stat, Stats, Store, WorkQueue, WorkerInfo,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// In-memory store with project `p` triggered by `org/repo` on `refs/heads/master`.
pub async fn store_with_trigger() -> Store {
    let store = Store::in_memory();
    store
        .triggers
        .add_or_update("p", "org/repo", &["refs/heads/master".to_string()])
        .await
        .unwrap();
    store
}

pub fn push_payload(git_ref: &str) -> String {
    json!({
        "ref": git_ref,
        "after": "0f3a9c",
        "repository": {"name": "repo", "owner": {"name": "org"}}
    })
    .to_string()
}

/// Runner that records where it was asked to build.
pub struct FakeRunner {
    result: std::result::Result<BuildOutput, String>,
    pub dirs: Mutex<Vec<PathBuf>>,
}

impl FakeRunner {
    pub fn exiting(code: i32, output: &str) -> Self {
        Self {
            result: Ok(BuildOutput::new(code, output)),
            dirs: Mutex::new(Vec::new()),
        }
    }

    pub fn broken(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            dirs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BuildRunner for FakeRunner {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run(&self, working_dir: &Path) -> Result<BuildOutput> {
        self.dirs.lock().unwrap().push(working_dir.to_path_buf());
        self.result
            .clone()
            .map_err(Error::ExecutionFailed)
    }
}

/// Work queue that fails selected operations before delegating to another.
pub struct FlakyQueue {
    inner: Arc<dyn WorkQueue>,
    reject_queue: Option<String>,
    complete_errors: AtomicUsize,
    fail_errors: AtomicUsize,
    pub fail_calls: AtomicUsize,
}

impl FlakyQueue {
    pub fn wrapping(store: &Store) -> Self {
        Self {
            inner: store.queue.clone(),
            reject_queue: None,
            complete_errors: AtomicUsize::new(0),
            fail_errors: AtomicUsize::new(0),
            fail_calls: AtomicUsize::new(0),
        }
    }

    /// Refuse every push to `queue`.
    pub fn rejecting_push(mut self, queue: &str) -> Self {
        self.reject_queue = Some(queue.to_string());
        self
    }

    /// Error on the next `times` calls to `complete`.
    pub fn failing_complete(self, times: usize) -> Self {
        self.complete_errors.store(times, Ordering::SeqCst);
        self
    }

    /// Error on the next `times` calls to `fail`.
    pub fn failing_fail(self, times: usize) -> Self {
        self.fail_errors.store(times, Ordering::SeqCst);
        self
    }

    /// A copy of `store` whose queue is this one.
    pub fn install(self, store: &Store) -> (Store, Arc<FlakyQueue>) {
        let queue = Arc::new(self);
        let store = Store {
            queue: queue.clone(),
            ..store.clone()
        };
        (store, queue)
    }
}

fn outage() -> DbError {
    DbError::Database(sqlx::Error::PoolTimedOut)
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn push(&self, queue: &str, job_id: JobId) -> DbResult<()> {
        if self.reject_queue.as_deref() == Some(queue) {
            return Err(outage());
        }
        self.inner.push(queue, job_id).await
    }

    async fn try_claim(&self, queues: &[String], worker: &str) -> DbResult<Option<Claim>> {
        self.inner.try_claim(queues, worker).await
    }

    fn poll_interval(&self) -> Duration {
        self.inner.poll_interval()
    }

    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        cancel: &CancellationToken,
    ) -> DbResult<Option<Claim>> {
        self.inner.claim(queues, worker, cancel).await
    }

    async fn complete(&self, claim: &Claim) -> DbResult<()> {
        if take(&self.complete_errors) {
            return Err(outage());
        }
        self.inner.complete(claim).await
    }

    async fn fail(&self, claim: &Claim, failure: JobFailure) -> DbResult<()> {
        self.fail_calls.fetch_add(1, Ordering::SeqCst);
        if take(&self.fail_errors) {
            return Err(outage());
        }
        self.inner.fail(claim, failure).await
    }

    async fn push_dead_letter(&self, entry: &DeadLetter) -> DbResult<()> {
        self.inner.push_dead_letter(entry).await
    }

    async fn pop_dead_letter(&self) -> DbResult<Option<DeadLetter>> {
        self.inner.pop_dead_letter().await
    }

    async fn dead_letter_count(&self) -> DbResult<usize> {
        self.inner.dead_letter_count().await
    }

    async fn pending(&self, queue: &str) -> DbResult<usize> {
        self.inner.pending(queue).await
    }

    async fn queues(&self) -> DbResult<Vec<String>> {
        self.inner.queues().await
    }

    async fn register_worker(&self, info: &WorkerInfo) -> DbResult<()> {
        self.inner.register_worker(info).await
    }

    async fn unregister_worker(&self, id: &str) -> DbResult<()> {
        self.inner.unregister_worker(id).await
    }

    async fn workers(&self) -> DbResult<Vec<WorkerInfo>> {
        self.inner.workers().await
    }

    async fn abandon_worker(&self, id: &str, reason: &str) -> DbResult<usize> {
        self.inner.abandon_worker(id, reason).await
    }
}

/// Job repository that refuses to persist finished jobs.
pub struct UnfinishableJobs {
    inner: Arc<dyn JobRepo>,
}

impl UnfinishableJobs {
    /// A copy of `store` whose job repository is wrapped.
    pub fn install(store: &Store) -> Store {
        Store {
            jobs: Arc::new(Self {
                inner: store.jobs.clone(),
            }),
            ..store.clone()
        }
    }
}

#[async_trait]
impl JobRepo for UnfinishableJobs {
    async fn next_id(&self) -> DbResult<JobId> {
        self.inner.next_id().await
    }

    async fn get(&self, id: JobId) -> DbResult<BuildJob> {
        self.inner.get(id).await
    }

    async fn put(&self, job: &BuildJob) -> DbResult<()> {
        if job.is_done() {
            return Err(outage());
        }
        self.inner.put(job).await
    }

    async fn index(&self, job: &BuildJob) -> DbResult<()> {
        self.inner.index(job).await
    }

    async fn list_by_queue(&self, queue: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        self.inner.list_by_queue(queue, limit).await
    }

    async fn list_by_project(&self, project: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        self.inner.list_by_project(project, limit).await
    }

    async fn incr_stat(&self, stat: Stat) -> DbResult<i64> {
        self.inner.incr_stat(stat).await
    }

    async fn stats(&self) -> DbResult<Stats> {
        self.inner.stats().await
    }
}
