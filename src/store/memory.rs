//! In-memory object store.
//!
//! Used by the test suite in place of S3. Supports back-dating artifacts (for
//! retention tests) and forcing a checksum mismatch on the next upload (for
//! upload-verification tests), and counts downloads so tests can assert that
//! fail-closed paths never touched the store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{BackupError, Result};
use crate::store::{BackupArtifact, ObjectStore};

struct StoredObject {
    data: Vec<u8>,
    created_at: DateTime<Utc>,
    checksum: String,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    corrupt_next_upload: AtomicBool,
    downloads: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next upload report a wrong checksum, as a corrupted transfer
    /// would.
    pub fn corrupt_next_upload(&self) {
        self.corrupt_next_upload.store(true, Ordering::SeqCst);
    }

    /// Number of downloads served so far.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Back-date an artifact's creation time.
    pub async fn set_created_at(&self, key: &str, created_at: DateTime<Utc>) {
        if let Some(object) = self.objects.lock().await.get_mut(key) {
            object.created_at = created_at;
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }
}

fn checksum_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(data))
}

fn artifact_of(key: &str, object: &StoredObject) -> BackupArtifact {
    BackupArtifact {
        key: key.to_string(),
        size: object.data.len() as u64,
        created_at: object.created_at,
        integrity_tag: object.checksum.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, local: &Path, key: &str, verify: bool) -> Result<BackupArtifact> {
        let data = tokio::fs::read(local).await?;
        let local_checksum = checksum_base64(&data);

        let stored_checksum = if self.corrupt_next_upload.swap(false, Ordering::SeqCst) {
            // Simulates a transfer that flipped bits on the wire.
            checksum_base64(b"corrupted")
        } else {
            local_checksum.clone()
        };

        let object = StoredObject {
            data,
            created_at: Utc::now(),
            checksum: stored_checksum.clone(),
        };
        let artifact = artifact_of(key, &object);

        let mut objects = self.objects.lock().await;
        objects.insert(key.to_string(), object);

        if verify && stored_checksum != local_checksum {
            objects.remove(key);
            return Err(BackupError::Integrity(format!(
                "upload checksum mismatch for {}",
                key
            )));
        }

        Ok(artifact)
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().await;
        let object = objects
            .get(key)
            .ok_or_else(|| BackupError::Transport(format!("no such object: {}", key)))?;
        tokio::fs::write(local, &object.data).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BackupArtifact>> {
        let objects = self.objects.lock().await;
        let mut artifacts: Vec<_> = objects
            .iter()
            .map(|(key, object)| artifact_of(key, object))
            .collect();
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(artifacts)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn metadata(&self, key: &str) -> Result<Option<BackupArtifact>> {
        let objects = self.objects.lock().await;
        Ok(objects.get(key).map(|object| artifact_of(key, object)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_of_missing_key_is_not_an_error() {
        let store = MemoryObjectStore::new();
        store.delete("never-uploaded").await.unwrap();
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = MemoryObjectStore::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob");
        tokio::fs::write(&file, b"x").await.unwrap();

        store.upload(&file, "older", true).await.unwrap();
        store.upload(&file, "newer", true).await.unwrap();
        store
            .set_created_at("older", Utc::now() - chrono::Duration::hours(1))
            .await;

        let keys: Vec<_> = store.list().await.unwrap().into_iter().map(|a| a.key).collect();
        assert_eq!(keys, vec!["newer", "older"]);
    }
}
