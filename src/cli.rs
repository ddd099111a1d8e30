//! CLI interface for lingo-relay
//!
//! Ops tooling only: the orchestrator itself is embedded by the platform
//! process; these commands inspect and prepare its local state.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::store::SqliteStore;

#[derive(Parser)]
#[command(name = "lingo-relay")]
#[command(about = "Message translation orchestrator for a multilingual chat platform", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file path (defaults to the per-user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and the uploads directory layout
    InitDb {
        /// Override the configured database path
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show row counts for the local store
    Stats {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Validate the effective configuration and print it
    CheckConfig,
}

/// Run the CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::InitDb { db } => {
            let path = db.unwrap_or_else(|| config.database.path.clone());
            SqliteStore::new(&path).await?;
            tokio::fs::create_dir_all(config.storage.uploads_root.join("attachments/translated"))
                .await?;
            println!("Database initialized at {}", path.display());
            println!("Uploads root: {}", config.storage.uploads_root.display());
        }
        Commands::Stats { json } => {
            let store = SqliteStore::new(&config.database.path).await?;
            let counts = store.counts().await?;
            if json {
                let map: serde_json::Map<String, serde_json::Value> = counts
                    .into_iter()
                    .map(|(table, count)| (table, serde_json::json!(count)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (table, count) in counts {
                    println!("{:<16} {}", table, count);
                }
            }
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
