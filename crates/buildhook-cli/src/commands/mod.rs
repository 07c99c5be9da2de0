//! CLI command implementations.

pub mod triggers;
pub mod worker;

use anyhow::{Result, bail};
use buildhook_config::Settings;
use buildhook_core::JobId;
use buildhook_scheduler::{Dispatcher, Reconciler, open_store};
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    match Settings::parse(&content) {
        Ok(settings) => {
            println!("Configuration is valid");
            println!("  store:  {}", settings.store.url);
            println!("  listen: {}", settings.listen_addr());
            if !settings.general.build_queues.is_empty() {
                println!("  queues: {}", settings.general.build_queues.join(", "));
            }
            Ok(())
        }
        Err(e) => bail!("Configuration error: {}", e),
    }
}

pub async fn reconcile(settings: &Settings) -> Result<()> {
    let store = open_store(&settings.store).await?;
    // Opening already drained once; report anything that arrived since.
    let report = Reconciler::new(store).reconcile().await?;
    println!(
        "Finalized {} build(s), dropped {} stale dead letter(s)",
        report.finalized, report.skipped
    );
    Ok(())
}

pub async fn requeue(settings: &Settings, id: i64) -> Result<()> {
    let store = open_store(&settings.store).await?;
    let new_id = Dispatcher::new(store).requeue(JobId::new(id)).await?;
    println!("Build {} requeued as build {}", id, new_id);
    Ok(())
}

pub async fn show(settings: &Settings, id: i64) -> Result<()> {
    let store = open_store(&settings.store).await?;
    let job = store.jobs.get(JobId::new(id)).await?;

    println!("Build {} ({} on {})", job.id, job.project, job.queue);
    println!("  status:       {}", job.status);
    println!("  outcome:      {}", job.outcome().label());
    println!("  triggered by: {}", job.triggered_by);
    println!("  created:      {}", job.timestamp.to_rfc3339());
    println!("  requeued:     {}", job.requeued);
    if let Some(error) = &job.error {
        println!("  worker:       {}", error.worker);
        println!("  failed at:    {}", error.failed_at.to_rfc3339());
        println!("  error:        {}", error.error);
        for line in &error.backtrace {
            println!("    {}", line);
        }
    }
    if let Some(output) = &job.output {
        println!();
        print!("{}", output);
    }
    Ok(())
}
