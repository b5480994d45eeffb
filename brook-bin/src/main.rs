use anyhow::Context;
use brook_rpc::config::{initialize_config, Config};
use brook_server_common::shutdown::Shutdown;
use brook_server_common::start_admin_server;
use brook_state::CheckpointStore;
use brook_types::to_millis;
use brook_worker::{aggregate_store_for_url, Engine, FileFeed};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a config file (TOML, YAML or JSON); BROOK__ environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the aggregation engine over the configured feed
    Run {},

    /// Prints the latest valid checkpoint
    Checkpoints {},

    /// Loads and validates the configuration, then prints it
    ValidateConfig {},
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run { .. } => run(cli.config.as_deref()).await,
        Commands::Checkpoints { .. } => checkpoints(cli.config.as_deref()).await,
        Commands::ValidateConfig { .. } => validate_config(cli.config.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = initialize_config(path)?;
    let _guard = brook_server_common::init_logging("brook");

    let feed = FileFeed::open(&config.feed.path).await?;
    let store = aggregate_store_for_url(&config.sink.url)
        .await
        .with_context(|| format!("failed to open aggregate store at {}", config.sink.url))?;
    let checkpoints = CheckpointStore::for_url(&config.checkpoint.url, config.checkpoint.retained)
        .await
        .with_context(|| format!("failed to open checkpoint store at {}", config.checkpoint.url))?;
    let engine = Engine::new(&config, Arc::new(feed), store, checkpoints)?;

    let shutdown = Shutdown::new("brook");
    shutdown.spawn_task("admin", start_admin_server("brook", shutdown.token()));

    let token = shutdown.token();
    let handle = shutdown.spawn_draining("engine", engine.run(token));

    match shutdown.join(handle, Duration::from_secs(30)).await {
        Ok(result) => {
            result?;
            info!("engine stopped");
            Ok(())
        }
        Err(e) => {
            error!(message = "engine did not stop cleanly", error = %e);
            Err(e.into())
        }
    }
}

async fn checkpoints(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let store =
        CheckpointStore::for_url(&config.checkpoint.url, config.checkpoint.retained).await?;

    let Some(checkpoint) = store.load_latest_valid().await? else {
        println!("no checkpoints in {}", config.checkpoint.url);
        return Ok(());
    };

    let summary = json!({
        "checkpointId": checkpoint.checkpoint_id,
        "createdAt": to_millis(checkpoint.created_at),
        "offsets": checkpoint.feed_offsets(),
        "openWindows": checkpoint.window_accumulators().len(),
        "keys": checkpoint.watermarks().len(),
        "retained": store.list().await?,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
