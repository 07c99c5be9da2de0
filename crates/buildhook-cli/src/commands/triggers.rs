//! Trigger commands.

use anyhow::{Result, bail};
use buildhook_config::Settings;
use buildhook_core::split_list;
use buildhook_scheduler::open_store;

pub async fn list(settings: &Settings) -> Result<()> {
    let store = open_store(&settings.store).await?;
    let projects = store.triggers.list().await?;
    if projects.is_empty() {
        println!("No projects configured");
        return Ok(());
    }
    for project in projects {
        println!("{}", project.name);
        for repo in project.repos {
            println!("  {}", repo.name);
            for git_ref in repo.refs {
                println!("    {}", git_ref);
            }
        }
    }
    Ok(())
}

pub async fn add(settings: &Settings, project: &str, repo: &str, refs: &str) -> Result<()> {
    let refs = split_list(refs);
    if refs.is_empty() {
        bail!("no refs given");
    }
    let store = open_store(&settings.store).await?;
    store.triggers.add_or_update(project, repo, &refs).await?;
    println!("{} now builds {} on {}", project, repo, refs.join(", "));
    Ok(())
}

pub async fn remove(settings: &Settings, project: &str) -> Result<()> {
    let store = open_store(&settings.store).await?;
    store.triggers.remove_project(project).await?;
    println!("Removed project {}", project);
    Ok(())
}

pub async fn remove_repo(settings: &Settings, project: &str, repo: &str) -> Result<()> {
    let store = open_store(&settings.store).await?;
    store.triggers.remove_repo(project, repo).await?;
    println!("Removed {} from {}", repo, project);
    Ok(())
}

pub async fn remove_ref(settings: &Settings, project: &str, repo: &str, git_ref: &str) -> Result<()> {
    let store = open_store(&settings.store).await?;
    store.triggers.remove_ref(project, repo, git_ref).await?;
    println!("Removed {} from {} in {}", git_ref, repo, project);
    Ok(())
}
