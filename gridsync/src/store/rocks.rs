//! RocksDB-backed durable store.
//!
//! Column families:
//! - `objects`  — file content keyed by `<owner>/<fileId>.csv` (LZ4 compressed)
//! - `metadata` — [`FileMetadata`] keyed by file id (bincode)
//! - `drawings` — saved drawing scenes keyed by file id (JSON, LZ4 compressed)
//!
//! Content and metadata for one file are written in a single batch.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{now_secs, object_key, DurableStore, FileMetadata, StoreError};

const CF_OBJECTS: &str = "objects";
const CF_METADATA: &str = "metadata";
const CF_DRAWINGS: &str = "drawings";

const COLUMN_FAMILIES: &[&str] = &[CF_OBJECTS, CF_METADATA, CF_DRAWINGS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gridsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened durable store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are LZ4 framed already.
            CF_OBJECTS | CF_DRAWINGS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn metadata(&self, file_id: &str) -> Result<Option<FileMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, file_id.as_bytes())? {
            Some(bytes) => FileMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Ids of every file with stored metadata.
    pub fn list_files(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut files = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            files.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(files)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn read_file(&self, owner_id: &str, file_id: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_OBJECTS)?;
        match self.db.get_cf(cf, object_key(owner_id, file_id).as_bytes())? {
            Some(compressed) => Self::decompress(&compressed),
            None => Err(StoreError::NotFound(file_id.to_string())),
        }
    }

    async fn write_file(
        &self,
        owner_id: &str,
        file_id: &str,
        content: &[u8],
    ) -> Result<String, StoreError> {
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let key = object_key(owner_id, file_id);
        let compressed = lz4_flex::compress_prepend_size(content);

        let mut meta = self
            .metadata(file_id)?
            .unwrap_or_else(|| FileMetadata::new(owner_id, file_id));
        meta.object_key = key.clone();
        meta.size = content.len() as u64;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_objects, key.as_bytes(), &compressed);
        batch.put_cf(cf_meta, file_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Stored {key}: {} bytes ({} compressed)",
            content.len(),
            compressed.len()
        );
        Ok(key)
    }

    async fn touch_modified(&self, file_id: &str, owner_id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut meta = self
            .metadata(file_id)?
            .unwrap_or_else(|| FileMetadata::new(owner_id, file_id));
        meta.last_modified = now_secs();
        self.db
            .put_cf_opt(cf, file_id.as_bytes(), meta.encode()?, &self.write_options())?;
        Ok(())
    }

    async fn read_drawing(&self, file_id: &str) -> Result<Option<Value>, StoreError> {
        let cf = self.cf(CF_DRAWINGS)?;
        match self.db.get_cf(cf, file_id.as_bytes())? {
            Some(compressed) => {
                let bytes = Self::decompress(&compressed)?;
                serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(|e| StoreError::Encoding(e.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn write_drawing(&self, file_id: &str, scene: &Value) -> Result<(), StoreError> {
        let cf = self.cf(CF_DRAWINGS)?;
        let bytes = serde_json::to_vec(scene).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&bytes);
        self.db
            .put_cf_opt(cf, file_id.as_bytes(), compressed, &self.write_options())?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_temp() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_write_read_file() {
        let (store, _dir) = open_temp();
        let location = store.write_file("u1", "u1_a", b"1,2\n3,4").await.unwrap();
        assert_eq!(location, "u1/u1_a.csv");
        assert_eq!(store.read_file("u1", "u1_a").await.unwrap(), b"1,2\n3,4");

        let meta = store.metadata("u1_a").unwrap().unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(meta.owner_id, "u1");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let (store, _dir) = open_temp();
        assert!(matches!(
            store.read_file("u1", "u1_nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.read_drawing("u1_nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_created_at() {
        let (store, _dir) = open_temp();
        store.write_file("u1", "u1_a", b"old").await.unwrap();
        let created = store.metadata("u1_a").unwrap().unwrap().created_at;
        store.write_file("u1", "u1_a", b"newer").await.unwrap();
        store.touch_modified("u1_a", "u1").await.unwrap();

        let meta = store.metadata("u1_a").unwrap().unwrap();
        assert_eq!(meta.created_at, created);
        assert_eq!(meta.size, 5);
        assert_eq!(store.read_file("u1", "u1_a").await.unwrap(), b"newer");
    }

    #[tokio::test]
    async fn test_drawings() {
        let (store, _dir) = open_temp();
        let scene = json!({"elements": [{"id": "r1", "type": "rectangle"}]});
        store.write_drawing("u1_a", &scene).await.unwrap();
        assert_eq!(store.read_drawing("u1_a").await.unwrap(), Some(scene));
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.write_file("u1", "u1_a", b"a,b").await.unwrap();
            store.write_file("u2", "u2_b", b"c").await.unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.read_file("u1", "u1_a").await.unwrap(), b"a,b");
        let mut files = store.list_files().unwrap();
        files.sort();
        assert_eq!(files, vec!["u1_a", "u2_b"]);
        assert_eq!(store.path(), dir.path());
    }

    #[tokio::test]
    async fn test_compression_on_repetitive_content() {
        let (store, _dir) = open_temp();
        let content = "0,0,0,0,0,0,0,0\n".repeat(1000);
        store.write_file("u1", "u1_big", content.as_bytes()).await.unwrap();

        let cf = store.cf(CF_OBJECTS).unwrap();
        let raw = store.db.get_cf(cf, b"u1/u1_big.csv").unwrap().unwrap();
        assert!(raw.len() < content.len() / 4);
    }
}
