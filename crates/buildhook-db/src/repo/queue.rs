//! Work queue with dead-letter list and worker registry.
//!
//! The queue only holds `(queue, job id)` references; payloads live in the
//! job store. Delivery is at-least-once: a claimed entry stays recorded
//! against its worker until completed, and a worker that dies with a claim
//! leaves a dead letter behind instead of silently losing the job.

use async_trait::async_trait;
use buildhook_core::{JobFailure, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::DbResult;

/// A job id taken off a queue by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Position of the entry in the queue; opaque to callers.
    pub ticket: i64,
    pub queue: String,
    pub job_id: JobId,
    pub worker: String,
    pub claimed_at: DateTime<Utc>,
}

/// A job whose worker failed before finishing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub queue: String,
    pub failure: JobFailure,
}

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// `host:pid:queue,queue`
    pub id: String,
    pub host: String,
    pub pid: u32,
    pub queues: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(host: impl Into<String>, pid: u32, queues: Vec<String>) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}:{}", host, pid, queues.join(",")),
            host,
            pid,
            queues,
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a job id to the tail of `queue`.
    async fn push(&self, queue: &str, job_id: JobId) -> DbResult<()>;

    /// Take the oldest entry of the first non-empty queue, in subscription order.
    async fn try_claim(&self, queues: &[String], worker: &str) -> DbResult<Option<Claim>>;

    /// Delay between polls of [`WorkQueue::claim`].
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Block until an entry can be claimed. Returns `None` once `cancel` fires.
    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        cancel: &CancellationToken,
    ) -> DbResult<Option<Claim>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(claim) = self.try_claim(queues, worker).await? {
                return Ok(Some(claim));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }

    /// Acknowledge a finished claim.
    async fn complete(&self, claim: &Claim) -> DbResult<()>;

    /// Drop a claim and record it on the dead-letter list.
    async fn fail(&self, claim: &Claim, failure: JobFailure) -> DbResult<()>;

    async fn push_dead_letter(&self, entry: &DeadLetter) -> DbResult<()>;

    /// Remove and return the oldest dead letter.
    async fn pop_dead_letter(&self) -> DbResult<Option<DeadLetter>>;

    async fn dead_letter_count(&self) -> DbResult<usize>;

    /// Unclaimed entries waiting in `queue`.
    async fn pending(&self, queue: &str) -> DbResult<usize>;

    /// Every queue name that has ever received a job, sorted.
    async fn queues(&self) -> DbResult<Vec<String>>;

    async fn register_worker(&self, info: &WorkerInfo) -> DbResult<()>;

    async fn unregister_worker(&self, id: &str) -> DbResult<()>;

    async fn workers(&self) -> DbResult<Vec<WorkerInfo>>;

    /// Dead-letter every claim still held by `id` and unregister it.
    /// Returns how many claims were moved.
    async fn abandon_worker(&self, id: &str, reason: &str) -> DbResult<usize>;
}

/// PostgreSQL implementation of WorkQueue.
/// Uses SKIP LOCKED so concurrent workers never claim the same entry.
pub struct PgWorkQueue {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    ticket: i64,
    queue: String,
    job_id: i64,
    claimed_by: String,
    claimed_at: DateTime<Utc>,
}

impl From<ClaimRow> for Claim {
    fn from(row: ClaimRow) -> Self {
        Claim {
            ticket: row.ticket,
            queue: row.queue,
            job_id: JobId::new(row.job_id),
            worker: row.claimed_by,
            claimed_at: row.claimed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    job_id: i64,
    queue: String,
    failure: Json<JobFailure>,
}

impl From<DeadLetterRow> for DeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetter {
            job_id: JobId::new(row.job_id),
            queue: row.queue,
            failure: row.failure.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    host: String,
    pid: i64,
    queues: Vec<String>,
    started_at: DateTime<Utc>,
}

impl From<WorkerRow> for WorkerInfo {
    fn from(row: WorkerRow) -> Self {
        WorkerInfo {
            id: row.id,
            host: row.host,
            pid: u32::try_from(row.pid).unwrap_or_default(),
            queues: row.queues,
            started_at: row.started_at,
        }
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn push(&self, queue: &str, job_id: JobId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO queues (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO work_queue (queue, job_id) VALUES ($1, $2)")
            .bind(queue)
            .bind(job_id.get())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn try_claim(&self, queues: &[String], worker: &str) -> DbResult<Option<Claim>> {
        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            UPDATE work_queue
            SET claimed_by = $2, claimed_at = NOW()
            WHERE ticket = (
                SELECT ticket FROM work_queue
                WHERE claimed_by IS NULL AND queue = ANY($1)
                ORDER BY array_position($1, queue), ticket
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING ticket, queue, job_id, claimed_by, claimed_at
            "#,
        )
        .bind(queues)
        .bind(worker)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Claim::from))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn complete(&self, claim: &Claim) -> DbResult<()> {
        sqlx::query("DELETE FROM work_queue WHERE ticket = $1")
            .bind(claim.ticket)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, claim: &Claim, failure: JobFailure) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM work_queue WHERE ticket = $1")
            .bind(claim.ticket)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO dead_letters (job_id, queue, failure) VALUES ($1, $2, $3)")
            .bind(claim.job_id.get())
            .bind(&claim.queue)
            .bind(Json(&failure))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn push_dead_letter(&self, entry: &DeadLetter) -> DbResult<()> {
        sqlx::query("INSERT INTO dead_letters (job_id, queue, failure) VALUES ($1, $2, $3)")
            .bind(entry.job_id.get())
            .bind(&entry.queue)
            .bind(Json(&entry.failure))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_dead_letter(&self) -> DbResult<Option<DeadLetter>> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            DELETE FROM dead_letters
            WHERE seq = (
                SELECT seq FROM dead_letters
                ORDER BY seq
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING job_id, queue, failure
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DeadLetter::from))
    }

    async fn dead_letter_count(&self) -> DbResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn pending(&self, queue: &str) -> DbResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM work_queue WHERE queue = $1 AND claimed_by IS NULL",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn queues(&self) -> DbResult<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM queues ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn register_worker(&self, info: &WorkerInfo) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, host, pid, queues, started_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET started_at = EXCLUDED.started_at
            "#,
        )
        .bind(&info.id)
        .bind(&info.host)
        .bind(i64::from(info.pid))
        .bind(&info.queues)
        .bind(info.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unregister_worker(&self, id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn workers(&self) -> DbResult<Vec<WorkerInfo>> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(WorkerInfo::from).collect())
    }

    async fn abandon_worker(&self, id: &str, reason: &str) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;

        let claims = sqlx::query_as::<_, ClaimRow>(
            r#"
            DELETE FROM work_queue WHERE claimed_by = $1
            RETURNING ticket, queue, job_id, claimed_by, claimed_at
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        for row in &claims {
            let failure = JobFailure {
                worker: id.to_string(),
                queue: row.queue.clone(),
                failed_at: Utc::now(),
                error: reason.to_string(),
                backtrace: Vec::new(),
            };
            sqlx::query("INSERT INTO dead_letters (job_id, queue, failure) VALUES ($1, $2, $3)")
                .bind(row.job_id)
                .bind(&row.queue)
                .bind(Json(&failure))
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(claims.len())
    }
}
