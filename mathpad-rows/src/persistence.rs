//! Document and cache persistence
//!
//! The pipeline only depends on the `DocumentStore` contract. `JsonFileStore`
//! keeps `document.json` and `cache.json` in the data folder and replaces
//! them atomically (write to a temp file, then rename).

use crate::cache::PersistedEntry;
use crate::error::{PipelineError, Result};
use crate::row_manager::DocumentSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DOCUMENT_FILE: &str = "document.json";
pub const CACHE_FILE: &str = "cache.json";

/// Load/save contract for row state and cache snapshots
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    async fn load_document(&self) -> Result<Option<DocumentSnapshot>>;

    async fn save_document(&self, snapshot: &DocumentSnapshot) -> Result<()>;

    /// Entries that fail to decode are dropped individually
    async fn load_cache(&self) -> Result<Vec<PersistedEntry>>;

    async fn save_cache(&self, entries: &[PersistedEntry]) -> Result<()>;
}

#[derive(Deserialize)]
struct CacheFile {
    entries: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    entries: &'a [PersistedEntry],
}

/// JSON files under one data folder
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self) -> PathBuf {
        self.root.join(DOCUMENT_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn write_atomic(&self, path: &Path, contents: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, e))?;
        debug!(path = %path.display(), "Saved");
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::from(mathpad_common::Error::Io(std::io::Error::new(
        e.kind(),
        format!("{}: {}", path.display(), e),
    )))
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load_document(&self) -> Result<Option<DocumentSnapshot>> {
        let path = self.document_path();
        let Some(text) = Self::read_optional(&path).await? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PipelineError::PersistedStateCorrupt(format!("{}: {}", path.display(), e)))
    }

    async fn save_document(&self, snapshot: &DocumentSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        self.write_atomic(&self.document_path(), json).await
    }

    async fn load_cache(&self) -> Result<Vec<PersistedEntry>> {
        let path = self.cache_path();
        let Some(text) = Self::read_optional(&path).await? else {
            return Ok(Vec::new());
        };

        let file: CacheFile = match serde_json::from_str(&text) {
            Ok(file) => file,
            Err(e) => {
                let err = PipelineError::CacheCorrupt(format!("{}: {}", path.display(), e));
                warn!(error = %err, "Ignoring unreadable cache snapshot");
                return Ok(Vec::new());
            }
        };

        let total = file.entries.len();
        let entries: Vec<PersistedEntry> = file
            .entries
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<PersistedEntry>(raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    let err = PipelineError::CacheCorrupt(e.to_string());
                    warn!(error = %err, "Dropping cache entry");
                    None
                }
            })
            .collect();

        debug!(total, loaded = entries.len(), "Read cache snapshot");
        Ok(entries)
    }

    async fn save_cache(&self, entries: &[PersistedEntry]) -> Result<()> {
        let json = serde_json::to_string(&CacheFileRef { entries })
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        self.write_atomic(&self.cache_path(), json).await
    }
}
