//! Cache persistence backends.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cache::{CacheBackend, CacheSnapshot};
use crate::error::Result;
use crate::storage::local::{read_json, write_json};

/// Keeps the snapshot in memory; survives only as long as the value.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    snapshot: Mutex<Option<CacheSnapshot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<CacheSnapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> Result<()> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

/// JSON file written atomically (temp file, then rename).
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn load(&self) -> Result<Option<CacheSnapshot>> {
        read_json(&self.path).await
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> Result<()> {
        write_json(&self.path, snapshot).await
    }
}
