//! mathpad-rows - document inspection tool
//!
//! Loads the persisted row document from the data folder and reports the
//! state of every row. Optionally prints the activation timeline and purges
//! expired cache entries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mathpad_common::config::{self, TomlConfig};
use mathpad_common::events::EventBus;
use mathpad_common::SystemClock;
use mathpad_rows::cache::{Cache, CacheNamespace};
use mathpad_rows::models::{RecognitionResult, ValidationResult};
use mathpad_rows::persistence::{DocumentStore, JsonFileStore};
use mathpad_rows::RowManager;

/// Command-line arguments for mathpad-rows
#[derive(Parser, Debug)]
#[command(name = "mathpad-rows")]
#[command(about = "Inspect a persisted mathpad row document")]
#[command(version)]
struct Args {
    /// Data folder holding document.json and cache.json
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Configuration file (defaults to the per-user mathpad.toml)
    #[arg(short, long, env = "MATHPAD_CONFIG")]
    config: Option<PathBuf>,

    /// Print the activation timeline as JSON
    #[arg(long)]
    timeline: bool,

    /// Drop expired cache entries and rewrite cache.json
    #[arg(long)]
    purge_cache: bool,
}

fn init_tracing(config: &TomlConfig) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    let level = &config.logging.level;
                    format!("mathpad_rows={level},mathpad_common={level}").into()
                }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(config::default_config_path);
    let toml_config = config::load_or_default(config_path.as_deref());
    init_tracing(&toml_config);

    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    info!("Root folder: {}", root_folder.display());
    let store = JsonFileStore::new(&root_folder);

    let clock = Arc::new(SystemClock);
    let manager = match store.load_document().await {
        Ok(Some(snapshot)) => RowManager::deserialize(snapshot, clock.clone(), EventBus::new(16))
            .context("Persisted document is inconsistent")?,
        Ok(None) => {
            warn!("No document saved in {}", root_folder.display());
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to read document"),
    };

    info!(
        rows = manager.row_count(),
        active = ?manager.active_row(),
        "Loaded document"
    );
    for row in manager.rows() {
        info!(
            row_id = %row.id,
            ocr = %row.ocr_status,
            validation = %row.validation_status,
            expression = row.expression.as_deref().unwrap_or("-"),
            error = row.error_message.as_deref().unwrap_or("-"),
            "Row"
        );
    }

    if args.timeline {
        let json = serde_json::to_string_pretty(manager.get_activation_timeline())
            .context("Failed to render timeline")?;
        println!("{}", json);
    }

    if args.purge_cache {
        let ttl = chrono::Duration::seconds(toml_config.pipeline.cache_ttl_secs as i64);
        let recognition: Cache<RecognitionResult> =
            Cache::new(CacheNamespace::Recognition, ttl, clock.clone());
        let validation: Cache<ValidationResult> =
            Cache::new(CacheNamespace::Validation, ttl, clock);

        let entries = store.load_cache().await.context("Failed to read cache")?;
        let before = entries.len();
        recognition.restore(&entries);
        validation.restore(&entries);

        let mut kept = recognition.export();
        kept.extend(validation.export());
        store
            .save_cache(&kept)
            .await
            .context("Failed to write cache")?;
        info!(before, after = kept.len(), "Purged cache");
    }

    Ok(())
}
