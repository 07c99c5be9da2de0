//! Trigger administration endpoints.

use axum::extract::{Form, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use buildhook_core::split_list;
use buildhook_db::DbError;
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub(crate) const PROJECT_HAS_CHILDREN: &str = "Can't delete project with children.\n";
pub(crate) const REPO_HAS_CHILDREN: &str = "Can't delete repo with children.\n";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/project_add_update", post(add_update))
        .route("/project_rem", get(remove_project))
        .route("/project_repo_rem", get(remove_repo))
        .route("/project_repo_ref_rem", get(remove_ref))
}

#[derive(Debug, Deserialize)]
struct AddUpdateForm {
    project: String,
    repo: String,
    #[serde(default)]
    refs: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoveQuery {
    project: String,
    repo: String,
    #[serde(rename = "ref")]
    git_ref: String,
}

async fn add_update(
    State(state): State<AppState>,
    Form(form): Form<AddUpdateForm>,
) -> Result<Redirect, ApiError> {
    let project = form.project.trim();
    let repo = form.repo.trim();
    if project.is_empty() || repo.is_empty() {
        return Err(ApiError::BadRequest(
            "project and repo are required".to_string(),
        ));
    }

    let refs = split_list(&form.refs);
    state.reconcile().await;
    state.store.triggers.add_or_update(project, repo, &refs).await?;
    info!(project = %project, repo = %repo, refs = ?refs, "Trigger updated");
    Ok(Redirect::to("/"))
}

async fn remove_project(
    State(state): State<AppState>,
    Query(query): Query<RemoveQuery>,
) -> Result<Response, ApiError> {
    state.reconcile().await;
    match state.store.triggers.remove_project(&query.project).await {
        Ok(()) => {
            info!(project = %query.project, "Project removed");
            Ok(Redirect::to("/").into_response())
        }
        Err(DbError::NotEmpty(_)) => Ok(PROJECT_HAS_CHILDREN.into_response()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_repo(
    State(state): State<AppState>,
    Query(query): Query<RemoveQuery>,
) -> Result<Response, ApiError> {
    state.reconcile().await;
    match state
        .store
        .triggers
        .remove_repo(&query.project, &query.repo)
        .await
    {
        Ok(()) => {
            info!(project = %query.project, repo = %query.repo, "Repository removed");
            Ok(Redirect::to("/").into_response())
        }
        Err(DbError::NotEmpty(_)) => Ok(REPO_HAS_CHILDREN.into_response()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_ref(
    State(state): State<AppState>,
    Query(query): Query<RemoveQuery>,
) -> Result<Redirect, ApiError> {
    state.reconcile().await;
    state
        .store
        .triggers
        .remove_ref(&query.project, &query.repo, &query.git_ref)
        .await?;
    info!(project = %query.project, repo = %query.repo, git_ref = %query.git_ref, "Ref removed");
    Ok(Redirect::to("/"))
}
