//! # rvault CLI
//!
//! Operator tooling for a reelvault cache: inspect contents, force a
//! startup reconciliation, write a starter config. Session orchestration
//! lives with the recorder and export processes, not here.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rvault_cache::{Cache, CacheMode, CacheTuning};
use rvault_config::logging::{init_logging, LogLevel};
use rvault_fs::OsFileStore;
use rvault_persist::{JsonStore, PersistenceStore};

/// reelvault - broadcast tape digitisation archive tooling
#[derive(Parser)]
#[command(name = "rvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cache contents and free space
    Status,

    /// Open the cache read-write once, letting startup reconciliation
    /// resolve duplicates, dangling rows and stale staging files
    Reconcile,

    /// Write a starter config to ~/.reelvault/config.toml
    InitConfig {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn });

    match cli.command {
        Commands::Status => status(),
        Commands::Reconcile => reconcile(),
        Commands::InitConfig { force } => init_config(force),
    }
}

fn open_cache(mode: CacheMode) -> Result<Cache> {
    let config = rvault_config::config();
    let store = JsonStore::open(&config.cache.store_file)
        .with_context(|| format!("opening store {:?}", config.cache.store_file))?;
    Cache::open(
        Arc::new(store) as Arc<dyn PersistenceStore>,
        Arc::new(OsFileStore),
        mode,
        &config.recorder.name,
        &config.cache.directory,
        &config.cache.browse_directory,
        &config.cache.pse_directory,
        CacheTuning::default(),
    )
    .with_context(|| format!("opening cache at {:?}", config.cache.directory))
}

fn status() -> Result<()> {
    let cache = open_cache(CacheMode::ReadOnly)?;
    let status = cache.status();
    let contents = cache.contents();

    println!(
        "{} items, {} on disk, {} free",
        status.num_items,
        format_size(status.total_size.max(0) as u64),
        format_size(cache.disk_space()?)
    );
    for entry in contents {
        let marker = if entry.creating { "~" } else { " " };
        println!(
            "{} {:<28} {:>10}  {:>8} frames  {} item {}",
            marker,
            entry.row.filename,
            format_size(entry.row.size.max(0) as u64),
            entry.row.duration.max(0),
            entry.row.source.spool_number,
            entry.row.source.item_number,
        );
    }
    Ok(())
}

fn reconcile() -> Result<()> {
    let cache = open_cache(CacheMode::ReadWrite)?;
    let status = cache.status();
    println!(
        "reconciled: {} items, {} on disk",
        status.num_items,
        format_size(status.total_size.max(0) as u64)
    );
    Ok(())
}

fn init_config(force: bool) -> Result<()> {
    let path = rvault_config::Config::global_config_path()
        .context("no home directory for global config")?;
    if path.exists() && !force {
        anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, rvault_config::Config::default_toml())?;
    println!("wrote {:?}", path);
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
        assert_eq!(format_size(1536), "1.5 KiB");
    }
}
