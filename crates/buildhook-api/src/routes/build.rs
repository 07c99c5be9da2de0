//! Webhook trigger and requeue endpoints.

use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use buildhook_core::JobId;
use buildhook_scheduler::{DispatchError, DispatchReport};
use serde::Deserialize;
use std::fmt::Write;
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;

pub(crate) const NO_PAYLOAD: &str = "No payload provided\n";
pub(crate) const UNKNOWN_PROJECT: &str = "Unknown Project.\n";
pub(crate) const TRIGGER_MISSED: &str = "Trigger Missed.\n";
pub(crate) const ALL_QUEUED: &str = "Succesfully Queued all jobs.\n";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/build/{project}/{queues}", post(build))
        .route("/requeue/{id}", get(requeue))
}

#[derive(Debug, Deserialize)]
struct BuildForm {
    payload: Option<String>,
}

/// Webhook receiver. Every outcome a sender can cause is a plain 200 answer.
async fn build(
    State(state): State<AppState>,
    Path((project, queues)): Path<(String, String)>,
    form: Result<Form<BuildForm>, FormRejection>,
) -> Result<Response, ApiError> {
    state.reconcile().await;

    let payload = match form {
        Ok(Form(form)) => form.payload,
        Err(rejection) => {
            debug!(error = %rejection, "Unreadable build request body");
            None
        }
    };

    let report = match state
        .dispatcher
        .submit_webhook(&project, &queues, payload.as_deref())
        .await
    {
        Ok(report) => report,
        Err(DispatchError::MalformedPayload(_)) => return Ok(NO_PAYLOAD.into_response()),
        Err(DispatchError::UnknownProject(_)) => return Ok(UNKNOWN_PROJECT.into_response()),
        Err(DispatchError::TriggerMiss(_)) => return Ok(TRIGGER_MISSED.into_response()),
        Err(e) => return Err(e.into()),
    };

    if report.is_complete() {
        return Ok(ALL_QUEUED.into_response());
    }
    Ok((StatusCode::INTERNAL_SERVER_ERROR, partial_failure(&report)).into_response())
}

/// Plain-text account of which queues got a job and which did not.
fn partial_failure(report: &DispatchReport) -> String {
    let mut body = String::new();
    for queued in &report.queued {
        let _ = writeln!(body, "Queued build {} on {}.", queued.id, queued.queue);
    }
    for (queue, error) in &report.failed {
        let _ = writeln!(body, "Failed to queue on {}: {}", queue, error);
    }
    body
}

async fn requeue(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Redirect, ApiError> {
    state.reconcile().await;
    state.dispatcher.requeue(JobId::new(id)).await?;
    Ok(Redirect::to("/"))
}
