//! Job store: build job payloads, listing indices and counters.

use async_trait::async_trait;
use buildhook_core::{BuildJob, JobId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::{DbError, DbResult};

/// Global counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stat {
    /// Jobs a worker ran to completion.
    Processed,
    /// Completed builds with exit code zero.
    Successes,
    /// Completed builds with a non-zero exit code.
    Failures,
    /// Jobs finalized after their worker died.
    SystemFailures,
}

impl Stat {
    pub fn key(&self) -> &'static str {
        match self {
            Stat::Processed => "processed",
            Stat::Successes => "successes",
            Stat::Failures => "failures",
            Stat::SystemFailures => "system_failures",
        }
    }
}

/// Snapshot of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub processed: i64,
    pub successes: i64,
    pub failures: i64,
    pub system_failures: i64,
}

impl Stats {
    pub(crate) fn set(&mut self, stat: Stat, value: i64) {
        match stat {
            Stat::Processed => self.processed = value,
            Stat::Successes => self.successes = value,
            Stat::Failures => self.failures = value,
            Stat::SystemFailures => self.system_failures = value,
        }
    }
}

/// Persistence of build job payloads.
///
/// The store is the only owner of job state. Writes are whole-payload
/// replacements; the last writer wins.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Atomically allocate the next job id.
    async fn next_id(&self) -> DbResult<JobId>;
    async fn get(&self, id: JobId) -> DbResult<BuildJob>;
    async fn put(&self, job: &BuildJob) -> DbResult<()>;
    /// Record the job at the head of its project and queue listings.
    async fn index(&self, job: &BuildJob) -> DbResult<()>;
    /// Most recent jobs of a queue, newest first.
    async fn list_by_queue(&self, queue: &str, limit: usize) -> DbResult<Vec<BuildJob>>;
    /// Most recent jobs of a project, newest first.
    async fn list_by_project(&self, project: &str, limit: usize) -> DbResult<Vec<BuildJob>>;
    async fn incr_stat(&self, stat: Stat) -> DbResult<i64>;
    async fn stats(&self) -> DbResult<Stats>;
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn list_index(&self, kind: &str, key: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        let jobs: Vec<Json<BuildJob>> = sqlx::query_scalar(
            r#"
            SELECT j.payload
            FROM build_job_index i
            JOIN build_jobs j ON j.id = i.job_id
            WHERE i.kind = $1 AND i.key = $2
            ORDER BY i.seq DESC
            LIMIT $3
            "#,
        )
        .bind(kind)
        .bind(key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs.into_iter().map(|Json(job)| job).collect())
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn next_id(&self) -> DbResult<JobId> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('build_job_ids')")
            .fetch_one(&self.pool)
            .await?;
        Ok(JobId::new(id))
    }

    async fn get(&self, id: JobId) -> DbResult<BuildJob> {
        let Json(job) = sqlx::query_scalar::<_, Json<BuildJob>>(
            "SELECT payload FROM build_jobs WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        Ok(job)
    }

    async fn put(&self, job: &BuildJob) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_jobs (id, payload) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload
            "#,
        )
        .bind(job.id.get())
        .bind(Json(job))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn index(&self, job: &BuildJob) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_job_index (kind, key, job_id)
            VALUES ('project', $1, $3), ('queue', $2, $3)
            "#,
        )
        .bind(&job.project)
        .bind(&job.queue)
        .bind(job.id.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_queue(&self, queue: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        self.list_index("queue", queue, limit).await
    }

    async fn list_by_project(&self, project: &str, limit: usize) -> DbResult<Vec<BuildJob>> {
        self.list_index("project", project, limit).await
    }

    async fn incr_stat(&self, stat: Stat) -> DbResult<i64> {
        let value = sqlx::query_scalar(
            r#"
            INSERT INTO build_stats (name, value) VALUES ($1, 1)
            ON CONFLICT (name) DO UPDATE SET value = build_stats.value + 1
            RETURNING value
            "#,
        )
        .bind(stat.key())
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn stats(&self) -> DbResult<Stats> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT name, value FROM build_stats")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = Stats::default();
        for stat in [
            Stat::Processed,
            Stat::Successes,
            Stat::Failures,
            Stat::SystemFailures,
        ] {
            if let Some((_, value)) = rows.iter().find(|(name, _)| name == stat.key()) {
                stats.set(stat, *value);
            }
        }
        Ok(stats)
    }
}
