//! vecagent CLI
//!
//! Hosts one agent: an index plus its write-buffering engine.
//!
//! # Usage
//!
//! ```bash
//! # Run with auto-commit until Ctrl-C, then commit, save and exit
//! vecagent run --config agent.json
//!
//! # Inspect the saved state of an index directory
//! vecagent stats --config agent.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vecagent::service::metadata;
use vecagent::{AgentConfig, IndexService};

#[derive(Parser)]
#[command(name = "vecagent")]
#[command(about = "Write-buffering and commit engine for an ANN search agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Path to the JSON agent config
    #[arg(short, long)]
    config: PathBuf,

    /// Override the index directory
    #[arg(long)]
    index_path: Option<PathBuf>,

    /// Override the vector dimension
    #[arg(long)]
    dimension: Option<usize>,
}

impl ConfigArgs {
    fn load(&self) -> Result<AgentConfig> {
        let mut config = AgentConfig::from_file(&self.config)
            .with_context(|| format!("loading config {:?}", self.config))?;
        if let Some(path) = &self.index_path {
            config.index_path = Some(path.clone());
        }
        if let Some(dimension) = self.dimension {
            config.dimension = dimension;
        }
        config.validate().context("invalid config overrides")?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until Ctrl-C
    Run(ConfigArgs),

    /// Print the saved mapping size, metadata and config as JSON
    Stats(ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args.load()?).await,
        Commands::Stats(args) => stats(args.load()?),
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    let pool_size = config.default_pool_size;
    let service = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || IndexService::new(config))
            .await
            .context("opening index panicked")?
            .context("failed to open index")?
    };
    let service = Arc::new(service);
    tracing::info!("Agent started with {} objects", service.object_count());

    let token = CancellationToken::new();
    if let Some(mut daemon) = service.start(token.clone()) {
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for Ctrl-C")?;
                    break;
                }
                Some(err) = daemon.next_error() => {
                    tracing::error!("auto-commit: {err}");
                }
            }
        }
        daemon.stop().await;
    } else {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    }

    tracing::info!("Shutting down: committing and saving");
    let svc = Arc::clone(&service);
    tokio::task::spawn_blocking(move || {
        let result = svc.create_and_save_index(pool_size);
        svc.close();
        result
    })
    .await
    .context("shutdown panicked")?
    .context("final commit failed")?;

    tracing::info!("Agent stopped");
    Ok(())
}

fn stats(config: AgentConfig) -> Result<()> {
    let (meta, mapped) = match config.persistent_path() {
        Some(dir) => (
            metadata::load_metadata(dir).context("reading agent metadata")?,
            metadata::load_kvs(dir).context("reading uuid mapping")?.len(),
        ),
        None => (None, 0),
    };

    let report = serde_json::json!({
        "index_path": config.persistent_path(),
        "metadata": meta,
        "mapped_uuids": mapped,
        "config": config,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
