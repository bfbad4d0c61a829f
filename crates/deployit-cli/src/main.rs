//! DeployIt CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "deployit")]
#[command(about = "Source to build to deploy pipeline runner", long_about = None)]
struct Cli {
    /// System configuration file (KDL)
    #[arg(long, global = true, env = "DEPLOYIT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs and command output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to the pipeline definition
        #[arg(default_value = "deployit.kdl")]
        path: PathBuf,
    },
    /// Run a pipeline once and wait for it to finish
    Run {
        /// Path to the pipeline definition
        #[arg(default_value = "deployit.kdl")]
        path: PathBuf,
        /// Take the source from a local directory instead of the repository
        #[arg(long)]
        source_dir: Option<PathBuf>,
        /// Revision to build instead of the branch head
        #[arg(long)]
        revision: Option<String>,
    },
    /// Watch the source and run the pipeline on every change
    Watch {
        /// Path to the pipeline definition
        #[arg(default_value = "deployit.kdl")]
        path: PathBuf,
        /// Take the source from a local directory instead of the repository
        #[arg(long)]
        source_dir: Option<PathBuf>,
        /// Poll interval in seconds, overriding the system configuration
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show the state of a deploy target
    Status {
        /// Target (stack) name
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = matches!(cli.command, Commands::Watch { .. });
    commands::init_tracing(cli.json, verbose);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate::validate(&path, cli.json)?;
        }
        Commands::Run {
            path,
            source_dir,
            revision,
        } => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::run::run(&config, &path, source_dir, revision, cli.json).await?;
        }
        Commands::Watch {
            path,
            source_dir,
            interval,
        } => {
            let mut config = commands::load_config(cli.config.as_deref())?;
            if let Some(secs) = interval {
                config.trigger.poll_interval = std::time::Duration::from_secs(secs.max(1));
            }
            commands::watch::watch(&config, &path, source_dir).await?;
        }
        Commands::Status { target } => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::status::status(&config, &target, cli.json).await?;
        }
    }

    Ok(())
}
