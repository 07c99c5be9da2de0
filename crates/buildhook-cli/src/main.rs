//! buildhook CLI tool.

use buildhook_config::Settings;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildhook")]
#[command(about = "buildhook build queue tool", long_about = None)]
struct Cli {
    /// Settings file, instead of the standard layered locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store url, overriding the settings
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker until SIGINT or SIGTERM
    Worker {
        /// Comma separated queues to consume, in priority order
        #[arg(long)]
        queues: Option<String>,
        /// Directory holding one checkout per project
        #[arg(long)]
        build_root: Option<PathBuf>,
        /// Command run inside the project checkout
        #[arg(long)]
        script: Option<String>,
    },
    /// Finalize jobs left behind by dead workers
    Reconcile,
    /// Queue a build again as a new job
    Requeue {
        /// Build ID
        id: i64,
    },
    /// Show a build with its output
    Show {
        /// Build ID
        id: i64,
    },
    /// Manage build triggers
    Triggers {
        #[command(subcommand)]
        command: TriggerCommands,
    },
    /// Validate a settings file
    Validate {
        /// Path to the settings file
        #[arg(default_value = "buildhook.kdl")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum TriggerCommands {
    /// List projects with their repositories and refs
    List,
    /// Add a repository and refs to a project, creating either as needed
    Add {
        project: String,
        /// Repository as owner/name
        repo: String,
        /// Comma separated refs, e.g. refs/heads/master
        refs: String,
    },
    /// Remove a project without repositories
    Remove { project: String },
    /// Remove a repository without refs
    RemoveRepo { project: String, repo: String },
    /// Remove one ref
    RemoveRef {
        project: String,
        repo: String,
        #[arg(value_name = "REF")]
        git_ref: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }

    let mut settings = Settings::load_from(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        settings.store.url = url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log.level)),
        )
        .init();

    match cli.command {
        Commands::Worker {
            queues,
            build_root,
            script,
        } => {
            if let Some(queues) = queues {
                settings.general.build_queues = buildhook_core::split_list(&queues);
            }
            if let Some(build_root) = build_root {
                settings.general.build_root = build_root;
            }
            if let Some(script) = script {
                settings.general.build_script = script;
            }
            commands::worker::run(&settings).await?;
        }
        Commands::Reconcile => {
            commands::reconcile(&settings).await?;
        }
        Commands::Requeue { id } => {
            commands::requeue(&settings, id).await?;
        }
        Commands::Show { id } => {
            commands::show(&settings, id).await?;
        }
        Commands::Triggers { command } => match command {
            TriggerCommands::List => {
                commands::triggers::list(&settings).await?;
            }
            TriggerCommands::Add {
                project,
                repo,
                refs,
            } => {
                commands::triggers::add(&settings, &project, &repo, &refs).await?;
            }
            TriggerCommands::Remove { project } => {
                commands::triggers::remove(&settings, &project).await?;
            }
            TriggerCommands::RemoveRepo { project, repo } => {
                commands::triggers::remove_repo(&settings, &project, &repo).await?;
            }
            TriggerCommands::RemoveRef {
                project,
                repo,
                git_ref,
            } => {
                commands::triggers::remove_ref(&settings, &project, &repo, &git_ref).await?;
            }
        },
        Commands::Validate { .. } => {}
    }

    Ok(())
}
