//! Remote object storage for encrypted backup artifacts.
//!
//! The `ObjectStore` trait is the seam between the pipelines and the storage
//! backend: production uses the S3 implementation, tests use the in-memory
//! store.

pub mod memory;
pub mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One stored encrypted backup object.
///
/// Identity is the remote key, which embeds a random component so backup
/// cadence cannot be read off the object names alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Store-reported integrity identifier. Uploads and single-object
    /// lookups carry the base64 SHA-256 content digest; bulk listings fall
    /// back to the store's entity tag, which for multipart uploads is not a
    /// digest of the content. Treat it as opaque.
    pub integrity_tag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist yet. Idempotent.
    async fn ensure_bucket(&self) -> Result<()>;

    /// Upload a local file under `key`.
    ///
    /// With `verify`, the store's post-transfer content digest is compared
    /// against a locally computed one; on mismatch the just-uploaded object
    /// is deleted and the upload fails. An artifact is never left
    /// half-trusted.
    async fn upload(&self, local: &Path, key: &str, verify: bool) -> Result<BackupArtifact>;

    /// Fetch the full object to a local path.
    async fn download(&self, key: &str, local: &Path) -> Result<()>;

    /// All artifacts, newest first.
    async fn list(&self) -> Result<Vec<BackupArtifact>>;

    /// Delete by key. Deleting a nonexistent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Single-object lookup; `None` if absent.
    async fn metadata(&self, key: &str) -> Result<Option<BackupArtifact>>;
}
