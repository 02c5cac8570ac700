//! `gridfill` - collaborative real-time puzzle grid server
//!
//! This binary serves puzzles over WebSocket so several participants can
//! fill the same grid together, and provides the file-level CRUD for the
//! puzzle store (list, upload, delete).

use anyhow::{Context, Result};
use clap::Parser;

use crate::cli::{Cli, Commands};
use gridfill_core::model::PuzzleUpload;
use gridfill_core::{Config, PuzzleStore};

mod cli;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridfill=info,gridfill_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration, with CLI flags taking precedence
    let mut config = match &cli.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::load_or_default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            server::start_server(config).await?;
        }

        Commands::List => {
            let store = PuzzleStore::new(&config.data_dir)?;
            for name in store.list().await? {
                println!("{name}");
            }
        }

        Commands::Upload { name, file } => {
            let store = PuzzleStore::new(&config.data_dir)?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let upload: PuzzleUpload =
                serde_json::from_slice(&bytes).context("Invalid upload file")?;
            let doc = upload.into_document()?;
            store.write_atomic(&name, &doc).await?;
            println!("created puzzle '{name}'");
        }

        Commands::Delete { name } => {
            let store = PuzzleStore::new(&config.data_dir)?;
            store.delete(&name).await?;
            println!("deleted puzzle '{name}'");
        }
    }

    Ok(())
}
