//! Trigger registry.

use async_trait::async_trait;
use buildhook_core::{ProjectTriggers, RepoTriggers};
use sqlx::PgPool;

use crate::{DbError, DbResult};

const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Configured mapping of project to the (repository, ref) pairs that build it.
///
/// Removal is refused while children remain: a repository needs an empty ref
/// set and a project an empty repository set before either can go.
#[async_trait]
pub trait TriggerRepo: Send + Sync {
    /// Register `project`, `repository` under it, and add `refs` to that repository.
    async fn add_or_update(&self, project: &str, repository: &str, refs: &[String])
    -> DbResult<()>;
    async fn remove_project(&self, project: &str) -> DbResult<()>;
    async fn remove_repo(&self, project: &str, repository: &str) -> DbResult<()>;
    /// Remove one ref. Removing the last ref empties the repository.
    async fn remove_ref(&self, project: &str, repository: &str, git_ref: &str) -> DbResult<()>;
    async fn project_exists(&self, project: &str) -> DbResult<bool>;
    async fn is_triggered(&self, project: &str, repository: &str, git_ref: &str)
    -> DbResult<bool>;
    /// Every project with its repositories and refs, sorted by name.
    async fn list(&self) -> DbResult<Vec<ProjectTriggers>>;
}

/// PostgreSQL implementation of TriggerRepo.
pub struct PgTriggerRepo {
    pool: PgPool,
}

impl PgTriggerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn not_empty_on_fk(err: sqlx::Error, what: String) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
            DbError::NotEmpty(what)
        }
        _ => DbError::Database(err),
    }
}

#[async_trait]
impl TriggerRepo for PgTriggerRepo {
    async fn add_or_update(
        &self,
        project: &str,
        repository: &str,
        refs: &[String],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO projects (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(project)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO project_repos (project, repository) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(project)
        .bind(repository)
        .execute(&mut *tx)
        .await?;

        for git_ref in refs {
            sqlx::query(
                r#"
                INSERT INTO repo_refs (project, repository, git_ref)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(project)
            .bind(repository)
            .bind(git_ref)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_project(&self, project: &str) -> DbResult<()> {
        let has_repos: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM project_repos WHERE project = $1)",
        )
        .bind(project)
        .fetch_one(&self.pool)
        .await?;
        if has_repos {
            return Err(DbError::NotEmpty(format!("project {}", project)));
        }

        sqlx::query("DELETE FROM projects WHERE name = $1")
            .bind(project)
            .execute(&self.pool)
            .await
            .map_err(|e| not_empty_on_fk(e, format!("project {}", project)))?;
        Ok(())
    }

    async fn remove_repo(&self, project: &str, repository: &str) -> DbResult<()> {
        let has_refs: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM repo_refs WHERE project = $1 AND repository = $2)",
        )
        .bind(project)
        .bind(repository)
        .fetch_one(&self.pool)
        .await?;
        if has_refs {
            return Err(DbError::NotEmpty(format!("repo {}", repository)));
        }

        sqlx::query("DELETE FROM project_repos WHERE project = $1 AND repository = $2")
            .bind(project)
            .bind(repository)
            .execute(&self.pool)
            .await
            .map_err(|e| not_empty_on_fk(e, format!("repo {}", repository)))?;
        Ok(())
    }

    async fn remove_ref(&self, project: &str, repository: &str, git_ref: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM repo_refs WHERE project = $1 AND repository = $2 AND git_ref = $3")
            .bind(project)
            .bind(repository)
            .bind(git_ref)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn project_exists(&self, project: &str) -> DbResult<bool> {
        let exists = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM projects WHERE name = $1)")
            .bind(project)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn is_triggered(
        &self,
        project: &str,
        repository: &str,
        git_ref: &str,
    ) -> DbResult<bool> {
        let triggered = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM repo_refs
                WHERE project = $1 AND repository = $2 AND git_ref = $3
            )
            "#,
        )
        .bind(project)
        .bind(repository)
        .bind(git_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(triggered)
    }

    async fn list(&self) -> DbResult<Vec<ProjectTriggers>> {
        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT p.name, r.repository, f.git_ref
            FROM projects p
            LEFT JOIN project_repos r ON r.project = p.name
            LEFT JOIN repo_refs f ON f.project = r.project AND f.repository = r.repository
            ORDER BY p.name, r.repository, f.git_ref
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut projects: Vec<ProjectTriggers> = Vec::new();
        for (project, repository, git_ref) in rows {
            if projects.last().map(|p| p.name != project).unwrap_or(true) {
                projects.push(ProjectTriggers {
                    name: project,
                    repos: Vec::new(),
                });
            }
            let Some(entry) = projects.last_mut() else {
                continue;
            };
            let Some(repository) = repository else {
                continue;
            };
            if entry.repos.last().map(|r| r.name != repository).unwrap_or(true) {
                entry.repos.push(RepoTriggers {
                    name: repository,
                    refs: Vec::new(),
                });
            }
            if let (Some(repo), Some(git_ref)) = (entry.repos.last_mut(), git_ref) {
                repo.refs.push(git_ref);
            }
        }
        Ok(projects)
    }
}
