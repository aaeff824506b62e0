use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mnemo::config::MemoryConfig;
use mnemo::{cli, server, sync};

#[derive(Parser)]
#[command(name = "mnemo", version, about = "Local memory MCP server for coding-assistant CLIs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport)
    Serve,
    /// Run one foreground sync of both sources and print the report
    Sync {
        /// Reindex every file even when its fingerprint is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to the model cache directory
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MemoryConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            server::serve_stdio(config).await?;
        }
        Command::Sync { force } => {
            run_foreground_sync(config, force).await?;
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
    }

    Ok(())
}

async fn run_foreground_sync(config: MemoryConfig, force: bool) -> Result<()> {
    let (db, embedder, config) = server::setup_shared_state(config)?;

    let reports = tokio::task::spawn_blocking(move || -> Result<serde_json::Value> {
        let (memory, sessions) = {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            sync::run_sync(&mut conn, &config, true, true, force)?
        };
        sync::sync_embeddings(&db, &embedder)?;
        Ok(serde_json::json!({ "memory": memory, "sessions": sessions }))
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
