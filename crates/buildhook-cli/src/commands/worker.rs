//! Worker command.

use anyhow::{Result, bail};
use buildhook_config::Settings;
use buildhook_executor::ScriptRunner;
use buildhook_scheduler::{Worker, install_shutdown_handler, open_store};
use std::sync::Arc;
use tracing::info;

pub async fn run(settings: &Settings) -> Result<()> {
    let general = &settings.general;
    if general.build_queues.is_empty() {
        bail!("no queues to work on; set general.build-queues or pass --queues");
    }

    let store = open_store(&settings.store).await?;
    let runner = Arc::new(ScriptRunner::new(general.build_script.clone()));
    let worker = Worker::new(
        store,
        runner,
        general.build_root.clone(),
        general.build_queues.clone(),
    );
    info!(
        worker = %worker.id(),
        build_root = %general.build_root.display(),
        script = %general.build_script,
        "Starting worker"
    );

    let shutdown = install_shutdown_handler();
    worker.run(shutdown).await?;
    Ok(())
}
