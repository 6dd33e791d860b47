//! In-process durable store.
//!
//! Used when no storage path is configured, and by tests, which can also
//! make writes fail on demand.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{now_secs, object_key, owner_of, DurableStore, FileMetadata, StoreError};

#[derive(Default)]
struct Contents {
    objects: HashMap<String, Vec<u8>>,
    metadata: HashMap<String, FileMetadata>,
    drawings: HashMap<String, Value>,
}

#[derive(Default)]
pub struct MemoryStore {
    contents: RwLock<Contents>,
    fail_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `text` as the content of `file_id` under its derived owner.
    pub async fn seed(&self, file_id: &str, text: &str) {
        let owner = owner_of(file_id);
        let mut contents = self.contents.write().await;
        contents
            .objects
            .insert(object_key(owner, file_id), text.as_bytes().to_vec());
        contents
            .metadata
            .entry(file_id.to_string())
            .or_insert_with(|| FileMetadata::new(owner, file_id))
            .size = text.len() as u64;
    }

    /// Current content of a file as text.
    pub async fn file_text(&self, file_id: &str) -> Option<String> {
        let key = object_key(owner_of(file_id), file_id);
        self.contents
            .read()
            .await
            .objects
            .get(&key)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub async fn metadata(&self, file_id: &str) -> Option<FileMetadata> {
        self.contents.read().await.metadata.get(file_id).cloned()
    }

    /// Make the next `n` calls to `write_file` fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of successful `write_file` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read_file(&self, owner_id: &str, file_id: &str) -> Result<Vec<u8>, StoreError> {
        self.contents
            .read()
            .await
            .objects
            .get(&object_key(owner_id, file_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))
    }

    async fn write_file(
        &self,
        owner_id: &str,
        file_id: &str,
        content: &[u8],
    ) -> Result<String, StoreError> {
        let failing = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable(format!(
                "injected write failure for {file_id}"
            )));
        }

        let key = object_key(owner_id, file_id);
        let mut contents = self.contents.write().await;
        contents.objects.insert(key.clone(), content.to_vec());
        contents
            .metadata
            .entry(file_id.to_string())
            .or_insert_with(|| FileMetadata::new(owner_id, file_id))
            .size = content.len() as u64;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(key)
    }

    async fn touch_modified(&self, file_id: &str, owner_id: &str) -> Result<(), StoreError> {
        let mut contents = self.contents.write().await;
        contents
            .metadata
            .entry(file_id.to_string())
            .or_insert_with(|| FileMetadata::new(owner_id, file_id))
            .last_modified = now_secs();
        Ok(())
    }

    async fn read_drawing(&self, file_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.contents.read().await.drawings.get(file_id).cloned())
    }

    async fn write_drawing(&self, file_id: &str, scene: &Value) -> Result<(), StoreError> {
        self.contents
            .write()
            .await
            .drawings
            .insert(file_id.to_string(), scene.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_seed_and_read() {
        let store = MemoryStore::new();
        store.seed("u1_a", "1,2").await;
        assert_eq!(store.read_file("u1", "u1_a").await.unwrap(), b"1,2");
        assert!(matches!(
            store.read_file("u2", "u1_a").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.metadata("u1_a").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_write_returns_location() {
        let store = MemoryStore::new();
        let location = store.write_file("u1", "u1_a", b"x,y").await.unwrap();
        assert_eq!(location, "u1/u1_a.csv");
        assert_eq!(store.file_text("u1_a").await.as_deref(), Some("x,y"));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);
        assert!(store.write_file("u1", "u1_a", b"1").await.is_err());
        assert!(store.write_file("u1", "u1_a", b"1").await.is_err());
        assert!(store.write_file("u1", "u1_a", b"1").await.is_ok());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_touch_and_drawings() {
        let store = MemoryStore::new();
        store.touch_modified("u1_a", "u1").await.unwrap();
        assert_eq!(store.metadata("u1_a").await.unwrap().owner_id, "u1");

        assert_eq!(store.read_drawing("u1_a").await.unwrap(), None);
        store.write_drawing("u1_a", &json!({"elements": []})).await.unwrap();
        assert_eq!(
            store.read_drawing("u1_a").await.unwrap(),
            Some(json!({"elements": []}))
        );
    }
}
