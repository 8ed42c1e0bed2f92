// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! BlockDB CLI Tool
//!
//! Command-line interface for storing values in a BlockDB store file. Every command runs
//! as one transaction; values are addressed by the hex form of their inode descriptor.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, bail};
use blockdb_core::{Inode, LockManager, StorageConfig, Store, Transaction};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Resource guarding every value of the store
const VALUES_RESOURCE: &str = "values";

#[derive(Parser)]
#[command(name = "blockdb")]
#[command(about = "BlockDB - transactional block store CLI")]
#[command(version = "0.1.0")]
struct Cli {
    /// Store file (overrides the configuration file)
    #[arg(long, short = 'p', global = true)]
    path: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store file
    Init,
    /// Store a value and print its descriptor
    Put {
        /// Value text
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,
        /// Read the value from a file instead
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print a value
    Cat {
        /// Value descriptor (hex)
        descriptor: String,
    },
    /// Delete a value
    Rm {
        /// Value descriptor (hex)
        descriptor: String,
    },
    /// Print store statistics as JSON
    Stat,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("Command failed: {:#}", e);
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>, config_file: Option<PathBuf>) -> anyhow::Result<StorageConfig> {
    let mut config = match config_file {
        Some(file) => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("failed to read config {}", file.display()))?;
            serde_json::from_str(&text).with_context(|| format!("invalid config {}", file.display()))?
        }
        None => StorageConfig::default(),
    };
    if let Some(path) = path {
        config.path = path;
    }
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.path, cli.config)?;
    if let Some(parent) = config.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let store = Store::open(config).context("failed to open store")?;
    let locks = LockManager::new();

    match cli.command {
        Commands::Init => handle_init(&store),
        Commands::Put { text, file } => {
            let value = match (text, file) {
                (_, Some(file)) => std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?,
                (Some(text), None) => text.into_bytes(),
                (None, None) => bail!("either a value or --file is required"),
            };
            let descriptor = handle_put(&store, &locks, &value)?;
            println!("{descriptor}");
            Ok(())
        }
        Commands::Cat { descriptor } => {
            let value = handle_cat(&store, &locks, &descriptor)?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&value)?;
            stdout.flush()?;
            Ok(())
        }
        Commands::Rm { descriptor } => {
            handle_rm(&store, &locks, &descriptor)?;
            println!("Value deleted: {descriptor}");
            Ok(())
        }
        Commands::Stat => {
            println!("{}", serde_json::to_string_pretty(&handle_stat(&store)?)?);
            Ok(())
        }
    }
}

fn parse_descriptor(text: &str) -> anyhow::Result<Vec<u8>> {
    let bytes = hex::decode(text.trim()).context("descriptor is not valid hex")?;
    if bytes.len() != Inode::DESCRIPTOR_SIZE {
        bail!("descriptor must be {} bytes, got {}", Inode::DESCRIPTOR_SIZE, bytes.len());
    }
    Ok(bytes)
}

fn handle_init(store: &Arc<Store>) -> anyhow::Result<()> {
    store.sync()?;
    println!("Store ready: {} ({} byte blocks)", store.config().path.display(), store.block_size());
    info!("Initialized store {}", store.config().path.display());
    Ok(())
}

fn handle_put(store: &Arc<Store>, locks: &LockManager, value: &[u8]) -> anyhow::Result<String> {
    let lock = locks.lock(VALUES_RESOURCE);
    let mut xa = Transaction::new(store.config());
    xa.lock_write(&lock)?;

    let inode = Inode::create(&mut xa, store)?;
    inode.append(&mut xa, value)?;
    let descriptor = hex::encode(inode.descriptor());
    xa.commit()?;

    info!("Stored {} bytes as {}", value.len(), descriptor);
    Ok(descriptor)
}

fn handle_cat(store: &Arc<Store>, locks: &LockManager, descriptor: &str) -> anyhow::Result<Vec<u8>> {
    let descriptor = parse_descriptor(descriptor)?;
    let lock = locks.lock(VALUES_RESOURCE);
    let mut xa = Transaction::new(store.config());
    xa.lock_read(&lock)?;

    let inode = Inode::open(&mut xa, store, &descriptor)?;
    let value = inode.read_all(&mut xa)?;
    xa.commit()?;
    Ok(value)
}

fn handle_rm(store: &Arc<Store>, locks: &LockManager, descriptor: &str) -> anyhow::Result<()> {
    let descriptor = parse_descriptor(descriptor)?;
    let lock = locks.lock(VALUES_RESOURCE);
    let mut xa = Transaction::new(store.config());
    xa.lock_write(&lock)?;

    let inode = Inode::open(&mut xa, store, &descriptor)?;
    inode.remove(&mut xa)?;
    xa.commit()?;

    info!("Deleted value {} ({} blocks)", hex::encode(&descriptor), inode.block_ids().len());
    Ok(())
}

fn handle_stat(store: &Arc<Store>) -> anyhow::Result<serde_json::Value> {
    Ok(json!({
        "path": store.config().path,
        "block_size": store.block_size(),
        "allocated_blocks": store.allocated_blocks()?,
        "cached_blocks": store.cached_blocks(),
        "stats": store.stats().snapshot(),
    }))
}
