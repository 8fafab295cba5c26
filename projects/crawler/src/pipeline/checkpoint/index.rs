use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_CHECKPOINT_PATH: &str = "crawl_checkpoint.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
}

/// Progress of a crawl as of the last page that was fully persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Cursor to request the next page with; `None` means the first page.
    pub cursor: Option<String>,
    pub records_processed: u64,
    pub pages_completed: u64,
    /// Observation bucket of the run, reused when the run is resumed.
    pub recorded_at: NaiveDateTime,
    pub status: CheckpointStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Checkpoint {
    pub fn is_resumable(&self) -> bool {
        self.status != CheckpointStatus::Completed
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("ReadCheckpoint: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ParseCheckpoint: {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("SerializeCheckpoint: {source}")]
    Serialize {
        #[from]
        source: serde_json::Error,
    },

    #[error("WriteCheckpoint: {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait CheckpointStore: Send {
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

/// JSON file replaced atomically on every save, so a crash mid-write leaves
/// the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CheckpointError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let staging = self.staging_path();
        let write_err = |source: std::io::Error| CheckpointError::Write {
            path: staging.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let mut file = tokio::fs::File::create(&staging).await.map_err(write_err)?;
        file.write_all(&json).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|source| CheckpointError::Write {
                path: self.path.clone(),
                source,
            })
    }
}
