//! buildhook API server

use buildhook_api::{AppState, routes};
use buildhook_config::Settings;
use buildhook_scheduler::{install_shutdown_handler, open_store};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buildhook-server")]
#[command(about = "buildhook webhook and dashboard server", long_about = None)]
struct Args {
    /// Settings file, instead of the standard layered locations
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store url, overriding the settings
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Address to listen on, overriding the settings
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(args.config.as_deref())?;
    if let Some(url) = args.database_url {
        settings.store.url = url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log.level)),
        )
        .init();

    let store = open_store(&settings.store).await?;
    let state = AppState::new(store);

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr = args.listen.unwrap_or_else(|| settings.listen_addr());
    info!(name = %settings.general.name, "Starting server on {}", addr);

    let shutdown = install_shutdown_handler();
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Server stopped");
    Ok(())
}
