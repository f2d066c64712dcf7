//! StashIO CLI - inspect and edit a redb-backed store
//!
//! Every invocation opens the database, runs one command and exits.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use stashio_common::{Metadata, SetOptions, StoreConfig};
use stashio_storage::{RedbBackend, StorageManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stashio-cli")]
#[command(about = "StashIO key/value store CLI")]
#[command(version)]
struct Args {
    /// Database file
    #[arg(long, env = "STASHIO_DB", default_value = "./stashio.redb")]
    db: PathBuf,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stashio/stashio.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Per-operation diagnostics (overrides the config file)
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a JSON value
    Set {
        key: String,
        /// Value as JSON text
        value: String,
        /// Lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,
        /// Metadata as field=value (repeatable)
        #[arg(long = "meta", value_name = "FIELD=VALUE")]
        meta: Vec<String>,
        /// Do not populate the memory cache
        #[arg(long)]
        skip_cache: bool,
    },
    /// Print a value
    Get {
        key: String,
        /// Print metadata alongside the value
        #[arg(long)]
        with_metadata: bool,
    },
    /// Delete a key
    Rm { key: String },
    /// Find entries whose metadata matches every field=value pair
    Query {
        #[arg(value_name = "FIELD=VALUE")]
        filters: Vec<String>,
    },
    /// List live keys
    Keys,
    /// Count live keys
    Len,
    /// Remove expired entries now
    Sweep,
    /// Delete everything
    Clear,
}

/// Configuration file layout
#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    store: StoreConfig,
}

fn load_config(path: &Path) -> Result<StoreConfig> {
    if !path.exists() {
        return Ok(StoreConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config.store)
}

/// Split `field=value`; numeric text becomes a JSON number
fn parse_pair(pair: &str) -> Result<(String, Value)> {
    let Some((field, raw)) = pair.split_once('=') else {
        bail!("expected FIELD=VALUE, got '{pair}'");
    };
    if field.is_empty() {
        bail!("empty field name in '{pair}'");
    }
    let value = raw
        .parse::<serde_json::Number>()
        .map_or_else(|_| Value::String(raw.to_string()), Value::Number);
    Ok((field.to_string(), value))
}

fn parse_pairs(pairs: &[String]) -> Result<Metadata> {
    pairs.iter().map(|p| parse_pair(p)).collect()
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = load_config(&args.config)?;
    if args.debug {
        config.debug = true;
    }
    debug!("Opening {} with {:?}", args.db.display(), config);

    let backend = Arc::new(RedbBackend::open(&args.db)?);
    let manager = StorageManager::new(backend, config);

    match args.command {
        Commands::Set {
            key,
            value,
            expires_in,
            meta,
            skip_cache,
        } => {
            let value: Value = serde_json::from_str(&value).context("value is not valid JSON")?;
            let mut options = SetOptions::new();
            if let Some(secs) = expires_in {
                options = options.expires_in(Duration::from_secs(secs));
            }
            if !meta.is_empty() {
                options = options.metadata(parse_pairs(&meta)?);
            }
            if skip_cache {
                options = options.skip_cache();
            }
            manager.set_item(&key, &value, options).await?;
        }
        Commands::Get { key, with_metadata } => {
            if with_metadata {
                match manager.get_item_with_metadata::<Value>(&key).await? {
                    Some(item) => print_json(&serde_json::json!({
                        "value": item.value,
                        "metadata": item.metadata,
                    }))?,
                    None => bail!("key not found: {key}"),
                }
            } else {
                match manager.get_item::<Value>(&key).await? {
                    Some(value) => print_json(&value)?,
                    None => bail!("key not found: {key}"),
                }
            }
        }
        Commands::Rm { key } => {
            manager.remove_item(&key).await?;
        }
        Commands::Query { filters } => {
            let query = parse_pairs(&filters)?;
            for hit in manager.query_by_metadata::<Value>(&query).await? {
                println!("{}\t{}", hit.key, hit.value);
            }
        }
        Commands::Keys => {
            for key in manager.keys().await? {
                println!("{key}");
            }
        }
        Commands::Len => {
            println!("{}", manager.length().await?);
        }
        Commands::Sweep => {
            let report = manager.clean_expired_items().await?;
            println!(
                "Scanned {} keys, removed {} expired in {:?}",
                report.scanned, report.removed, report.duration
            );
        }
        Commands::Clear => {
            manager.clear().await?;
        }
    }

    Ok(())
}
