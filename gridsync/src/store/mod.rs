//! Durable storage for flushed documents and saved drawings.
//!
//! ```text
//! ┌──────────────┐  read_file / write_file   ┌───────────────────────────┐
//! │ DocumentCache│ ◄───────────────────────► │ objects  <owner>/<id>.csv │
//! │ Reconciler   │  touch_modified           │ metadata FileMetadata     │
//! │ SyncServer   │  read/write_drawing       │ drawings scene JSON       │
//! └──────────────┘                           └───────────────────────────┘
//! ```
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! single-process deployments, and [`RocksStore`] for on-disk durability.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable side of the write-behind cache.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Row-major text content of a file.
    async fn read_file(&self, owner_id: &str, file_id: &str) -> Result<Vec<u8>, StoreError>;

    /// Replace a file's content. Returns the object key it was stored under.
    async fn write_file(
        &self,
        owner_id: &str,
        file_id: &str,
        content: &[u8],
    ) -> Result<String, StoreError>;

    /// Bump the file's last-modified timestamp.
    async fn touch_modified(&self, file_id: &str, owner_id: &str) -> Result<(), StoreError>;

    async fn read_drawing(&self, file_id: &str) -> Result<Option<Value>, StoreError>;

    async fn write_drawing(&self, file_id: &str, scene: &Value) -> Result<(), StoreError>;
}

/// Owner embedded in a file identifier: everything before the first `_`.
pub fn owner_of(file_id: &str) -> &str {
    file_id.split('_').next().unwrap_or(file_id)
}

/// Object key a file's content is stored under.
pub fn object_key(owner_id: &str, file_id: &str) -> String {
    format!("{owner_id}/{file_id}.csv")
}

/// Metadata kept next to each stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub owner_id: String,
    pub object_key: String,
    /// Uncompressed content size in bytes
    pub size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub last_modified: u64,
}

impl FileMetadata {
    pub(crate) fn new(owner_id: &str, file_id: &str) -> Self {
        let now = now_secs();
        Self {
            file_id: file_id.to_string(),
            owner_id: owner_id.to_string(),
            object_key: object_key(owner_id, file_id),
            size: 0,
            created_at: now,
            last_modified: now,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Encoding(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        Ok(meta)
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
