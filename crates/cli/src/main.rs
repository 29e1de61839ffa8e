//! pixcache command-line entry point.
//!
//! Results go to stdout as JSON lines; logging goes to stderr so output
//! stays machine-readable.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pixcache_core::AppConfig;
use tracing_subscriber::EnvFilter;

mod commands;
mod wanted;

#[derive(Debug, Parser)]
#[command(name = "pixcache", about = "Multi-tier image cache: memory, journaled disk, network")]
struct Cli {
    /// Override the configured cache directory.
    #[arg(long, global = true, value_name = "PATH")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Look up images, fetching the ones not already cached.
    Get {
        #[arg(required = true, value_name = "URL")]
        identifiers: Vec<String>,

        /// Seconds to wait for outstanding fetches.
        #[arg(long, default_value_t = 30, value_name = "SECS")]
        wait: u64,

        /// Write each result into this directory, named by cache key.
        #[arg(long, value_name = "DIR")]
        save: Option<PathBuf>,
    },
    /// Print disk cache occupancy.
    Stats,
    /// Delete the disk cache.
    Clear,
    /// Print the cache key derived from an identifier.
    Key { identifier: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }

    match cli.command {
        Command::Get { identifiers, wait, save } => {
            commands::get(&config, &identifiers, Duration::from_secs(wait), save.as_deref()).await
        }
        Command::Stats => commands::stats(&config),
        Command::Clear => commands::clear(&config),
        Command::Key { identifier } => {
            commands::key(&identifier);
            Ok(())
        }
    }
}
