//! In-memory store.
//!
//! Implements every repository trait against process-local state. Payloads
//! are kept serialized, as the PostgreSQL store keeps them, so a job read back
//! is always a decoded copy rather than a shared reference.

use async_trait::async_trait;
use buildhook_core::{BuildJob, JobFailure, JobId, ProjectTriggers, RepoTriggers};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::repo::{
    Claim, DeadLetter, JobRepo, Stat, Stats, TriggerRepo, WorkQueue, WorkerInfo,
};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Inner {
    // Trigger registry
    repos: BTreeMap<String, BTreeSet<String>>,
    refs: BTreeMap<(String, String), BTreeSet<String>>,

    // Job store
    last_id: i64,
    jobs: HashMap<JobId, String>,
    by_project: HashMap<String, VecDeque<JobId>>,
    by_queue: HashMap<String, VecDeque<JobId>>,
    stats: BTreeMap<Stat, i64>,

    // Work queue
    last_ticket: i64,
    queues: BTreeMap<String, VecDeque<(i64, JobId)>>,
    claimed: BTreeMap<i64, Claim>,
    dead_letters: VecDeque<DeadLetter>,
    workers: BTreeMap<String, WorkerInfo>,
}

impl Inner {
    fn dead_letter_claim(&mut self, claim: Claim, failure: JobFailure) {
        self.dead_letters.push_back(DeadLetter {
            job_id: claim.job_id,
            queue: claim.queue,
            failure,
        });
    }
}

/// Process-local implementation of [`TriggerRepo`], [`JobRepo`] and [`WorkQueue`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    work_available: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerRepo for MemoryStore {
    async fn add_or_update(
        &self,
        project: &str,
        repository: &str,
        refs: &[String],
    ) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .repos
            .entry(project.to_string())
            .or_default()
            .insert(repository.to_string());
        if !refs.is_empty() {
            inner
                .refs
                .entry((project.to_string(), repository.to_string()))
                .or_default()
                .extend(refs.iter().cloned());
        }
        Ok(())
    }

    async fn remove_project(&self, project: &str) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .repos
            .get(project)
            .map(|repos| !repos.is_empty())
            .unwrap_or(false)
        {
            return Err(DbError::NotEmpty(format!("project {}", project)));
        }
        inner.repos.remove(project);
        Ok(())
    }

    async fn remove_repo(&self, project: &str, repository: &str) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let key = (project.to_string(), repository.to_string());
        if inner.refs.get(&key).map(|r| !r.is_empty()).unwrap_or(false) {
            return Err(DbError::NotEmpty(format!("repo {}", repository)));
        }
        inner.refs.remove(&key);
        if let Some(repos) = inner.repos.get_mut(project) {
            repos.remove(repository);
        }
        Ok(())
    }

    async fn remove_ref(&self, project: &str, repository: &str, git_ref: &str) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let key = (project.to_string(), repository.to_string());
        if let Some(refs) = inner.refs.get_mut(&key) {
            refs.remove(git_ref);
            if refs.is_empty() {
                inner.refs.remove(&key);
            }
        }
        Ok(())
    }

    async fn project_exists(&self, project: &str) -> DbResult<bool> {
        Ok(self.inner.lock().await.repos.contains_key(project))
    }

    async fn is_triggered(
        &self,
        project: &str,
        repository: &str,
        git_ref: &str,
    ) -> DbResult<bool> {
        let inner = self.inner.lock().await;
        let triggered = inner
            .refs
            .get(&(project.to_string(), repository.to_string()))
            .map(|refs| refs.contains(git_ref))
            .unwrap_or(false);
        Ok(triggered)
    }

    async fn list(&self) -> DbResult<Vec<ProjectTriggers>> {
        let inner = self.inner.lock().await;
        let projects = inner
            .repos
            .iter()
            .map(|(project, repos)| ProjectTriggers {
                name: project.clone(),
                repos: repos
                    .iter()
                    .map(|repo| RepoTriggers {
                        name: repo.clone(),
                        refs: inner
                            .refs
                            .get(&(project.clone(), repo.clone()))
                            .map(|refs| refs.iter().cloned().collect())
                            .unwrap_or_default(),
                    })
                    .collect(),
            })
            .collect();
        Ok(projects)
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn next_id(&self) -> DbResult<JobId> {
        let mut inner = self.inner.lock().await;
        inner.last_id += 1;
        Ok(JobId::new(inner.last_id))
    }

    async fn get(&self, id: JobId) -> DbResult<BuildJob> {
        let inner = self.inner.lock().await;
        let payload = inner
            .jobs
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        Ok(serde_json::from_str(payload)?)
    }

    async fn put(&self, job: &BuildJob) -> DbResult<()> {
        let payload = serde_json::to_string(job)?;
        self.inner.lock().await.jobs.insert(job.id, payload);
        Ok(())
    }

    async fn index(&self, job: &BuildJob) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .by_project
            .entry(job.project.clone())
            .or_default()
            .push_front(job.id);
        inner
            .by_queue
            .entry(job.queue.clone())
            .or_default()
            .push_front(job.id);
        Ok(())
    }

    async fn list_by_queue(&self, queue: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        let ids: Vec<JobId> = {
            let inner = self.inner.lock().await;
            inner
                .by_queue
                .get(queue)
                .map(|ids| ids.iter().take(limit).copied().collect())
                .unwrap_or_default()
        };
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            jobs.push(self.get(id).await?);
        }
        Ok(jobs)
    }

    async fn list_by_project(&self, project: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        let ids: Vec<JobId> = {
            let inner = self.inner.lock().await;
            inner
                .by_project
                .get(project)
                .map(|ids| ids.iter().take(limit).copied().collect())
                .unwrap_or_default()
        };
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            jobs.push(self.get(id).await?);
        }
        Ok(jobs)
    }

    async fn incr_stat(&self, stat: Stat) -> DbResult<i64> {
        let mut inner = self.inner.lock().await;
        let value = inner.stats.entry(stat).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn stats(&self) -> DbResult<Stats> {
        let inner = self.inner.lock().await;
        let mut stats = Stats::default();
        for (stat, value) in &inner.stats {
            stats.set(*stat, *value);
        }
        Ok(stats)
    }
}

#[async_trait]
impl WorkQueue for MemoryStore {
    async fn push(&self, queue: &str, job_id: JobId) -> DbResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.last_ticket += 1;
            let ticket = inner.last_ticket;
            inner
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back((ticket, job_id));
        }
        self.work_available.notify_waiters();
        Ok(())
    }

    async fn try_claim(&self, queues: &[String], worker: &str) -> DbResult<Option<Claim>> {
        let mut inner = self.inner.lock().await;
        for queue in queues {
            let Some((ticket, job_id)) = inner.queues.get_mut(queue).and_then(|q| q.pop_front())
            else {
                continue;
            };
            let claim = Claim {
                ticket,
                queue: queue.clone(),
                job_id,
                worker: worker.to_string(),
                claimed_at: Utc::now(),
            };
            inner.claimed.insert(ticket, claim.clone());
            return Ok(Some(claim));
        }
        Ok(None)
    }

    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        cancel: &CancellationToken,
    ) -> DbResult<Option<Claim>> {
        loop {
            // Register interest before looking so a push in between is not missed.
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(claim) = self.try_claim(queues, worker).await? {
                return Ok(Some(claim));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    async fn complete(&self, claim: &Claim) -> DbResult<()> {
        self.inner.lock().await.claimed.remove(&claim.ticket);
        Ok(())
    }

    async fn fail(&self, claim: &Claim, failure: JobFailure) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.claimed.remove(&claim.ticket);
        inner.dead_letter_claim(claim.clone(), failure);
        Ok(())
    }

    async fn push_dead_letter(&self, entry: &DeadLetter) -> DbResult<()> {
        self.inner
            .lock()
            .await
            .dead_letters
            .push_back(entry.clone());
        Ok(())
    }

    async fn pop_dead_letter(&self) -> DbResult<Option<DeadLetter>> {
        Ok(self.inner.lock().await.dead_letters.pop_front())
    }

    async fn dead_letter_count(&self) -> DbResult<usize> {
        Ok(self.inner.lock().await.dead_letters.len())
    }

    async fn pending(&self, queue: &str) -> DbResult<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(queue).map(VecDeque::len).unwrap_or(0))
    }

    async fn queues(&self) -> DbResult<Vec<String>> {
        Ok(self.inner.lock().await.queues.keys().cloned().collect())
    }

    async fn register_worker(&self, info: &WorkerInfo) -> DbResult<()> {
        self.inner
            .lock()
            .await
            .workers
            .insert(info.id.clone(), info.clone());
        Ok(())
    }

    async fn unregister_worker(&self, id: &str) -> DbResult<()> {
        self.inner.lock().await.workers.remove(id);
        Ok(())
    }

    async fn workers(&self) -> DbResult<Vec<WorkerInfo>> {
        Ok(self.inner.lock().await.workers.values().cloned().collect())
    }

    async fn abandon_worker(&self, id: &str, reason: &str) -> DbResult<usize> {
        let mut inner = self.inner.lock().await;
        let tickets: Vec<i64> = inner
            .claimed
            .values()
            .filter(|c| c.worker == id)
            .map(|c| c.ticket)
            .collect();
        for ticket in &tickets {
            if let Some(claim) = inner.claimed.remove(ticket) {
                let failure = JobFailure {
                    worker: id.to_string(),
                    queue: claim.queue.clone(),
                    failed_at: Utc::now(),
                    error: reason.to_string(),
                    backtrace: Vec::new(),
                };
                inner.dead_letter_claim(claim, failure);
            }
        }
        inner.workers.remove(id);
        Ok(tickets.len())
    }
}
