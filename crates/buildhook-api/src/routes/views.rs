//! Read-only JSON views of triggers, queues, builds and workers.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use buildhook_core::{BuildJob, JobId, JobStatus, ProjectTriggers};
use buildhook_db::{Stats, WorkerInfo};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

/// Builds shown per queue on the overview.
const OVERVIEW_BUILDS: usize = 10;
/// Builds shown on a queue or project page.
const PAGE_BUILDS: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(overview))
        .route("/builds_for_queue/{queue}", get(builds_for_queue))
        .route("/builds_for_project/{project}", get(builds_for_project))
        .route("/log/{id}", get(build_log))
}

/// One row of a build listing.
#[derive(Debug, Serialize)]
pub struct BuildSummary {
    pub id: JobId,
    pub project: String,
    pub queue: String,
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub outcome: String,
    pub return_code: Option<i32>,
    pub triggered_by: String,
    pub requeued: bool,
}

impl From<&BuildJob> for BuildSummary {
    fn from(job: &BuildJob) -> Self {
        Self {
            id: job.id,
            project: job.project.clone(),
            queue: job.queue.clone(),
            timestamp: job.timestamp,
            status: job.status,
            outcome: job.outcome().label(),
            return_code: job.return_code,
            triggered_by: job.triggered_by.clone(),
            requeued: job.requeued,
        }
    }
}

/// Full job record with its outcome label.
#[derive(Debug, Serialize)]
pub struct BuildDetail {
    #[serde(flatten)]
    pub job: BuildJob,
    pub outcome: String,
}

#[derive(Debug, Serialize)]
pub struct QueueOverview {
    pub name: String,
    pub pending: usize,
    pub builds: Vec<BuildSummary>,
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub projects: Vec<ProjectTriggers>,
    pub queues: Vec<QueueOverview>,
    pub workers: Vec<WorkerInfo>,
    pub stats: Stats,
}

fn summaries(jobs: &[BuildJob]) -> Vec<BuildSummary> {
    jobs.iter().map(BuildSummary::from).collect()
}

async fn overview(State(state): State<AppState>) -> Result<Json<Overview>, ApiError> {
    state.reconcile().await;
    let store = &state.store;

    let mut queues = Vec::new();
    for name in store.queue.queues().await? {
        let builds = store.jobs.list_by_queue(&name, OVERVIEW_BUILDS).await?;
        queues.push(QueueOverview {
            pending: store.queue.pending(&name).await?,
            builds: summaries(&builds),
            name,
        });
    }

    Ok(Json(Overview {
        projects: store.triggers.list().await?,
        queues,
        workers: store.queue.workers().await?,
        stats: store.jobs.stats().await?,
    }))
}

async fn builds_for_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<Vec<BuildSummary>>, ApiError> {
    state.reconcile().await;
    let builds = state.store.jobs.list_by_queue(&queue, PAGE_BUILDS).await?;
    Ok(Json(summaries(&builds)))
}

async fn builds_for_project(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<Vec<BuildSummary>>, ApiError> {
    state.reconcile().await;
    let builds = state.store.jobs.list_by_project(&project, PAGE_BUILDS).await?;
    Ok(Json(summaries(&builds)))
}

async fn build_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BuildDetail>, ApiError> {
    state.reconcile().await;
    let job = state.store.jobs.get(JobId::new(id)).await?;
    let outcome = job.outcome().label();
    Ok(Json(BuildDetail { job, outcome }))
}
