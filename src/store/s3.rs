//! S3-backed object store.
//!
//! The client is constructed explicitly and owned by the caller; there is no
//! shared module-level session. Upload integrity is verified through S3's
//! `ChecksumSHA256` metadata rather than ETags, which stop being content
//! digests for multipart uploads.

use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ChecksumMode;
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{BackupError, Result};
use crate::secure_fs;
use crate::store::{BackupArtifact, ObjectStore};

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from the storage configuration. Static credentials are
    /// used when configured, otherwise the default provider chain applies.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "course-backup",
            ));
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            // Path-style addressing for S3-compatible stores behind a
            // custom endpoint.
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    fn artifact_from_head(
        &self,
        key: &str,
        head: &aws_sdk_s3::operation::head_object::HeadObjectOutput,
    ) -> BackupArtifact {
        BackupArtifact {
            key: key.to_string(),
            size: head.content_length().unwrap_or(0).max(0) as u64,
            created_at: convert_timestamp(head.last_modified()),
            integrity_tag: head.checksum_sha256().unwrap_or_default().to_string(),
        }
    }
}

fn convert_timestamp(ts: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    ts.and_then(|t| Utc.timestamp_opt(t.secs(), 0).single())
        .unwrap_or_else(Utc::now)
}

fn transport<E: std::fmt::Display>(e: E) -> BackupError {
    BackupError::Transport(e.to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Created backup bucket");
                Ok(())
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_bucket_already_owned_by_you()
                    || service_err.is_bucket_already_exists()
                {
                    Ok(())
                } else {
                    Err(transport(service_err))
                }
            }
        }
    }

    async fn upload(&self, local: &Path, key: &str, verify: bool) -> Result<BackupArtifact> {
        let local_path = local.to_path_buf();
        let local_sha256 = tokio::task::spawn_blocking(move || {
            secure_fs::sha256_file_base64(&local_path)
        })
        .await
        .map_err(|e| BackupError::Unknown(e.to_string()))??;

        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_sha256(&local_sha256)
            .body(body)
            .send()
            .await
            .map_err(transport)?;

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
            .map_err(transport)?;

        if verify {
            let remote_sha256 = head.checksum_sha256().unwrap_or_default();
            if remote_sha256 != local_sha256 {
                // The stored object does not match what we sent. Remove it so
                // nothing half-trusted remains listable.
                warn!(
                    key,
                    local = %local_sha256,
                    remote = %remote_sha256,
                    "Upload checksum mismatch, deleting remote object"
                );
                self.delete(key).await?;
                return Err(BackupError::Integrity(format!(
                    "upload checksum mismatch for {}",
                    key
                )));
            }
            debug!(key, "Upload checksum verified");
        }

        Ok(self.artifact_from_head(key, &head))
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let mut output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(transport)?;

        let mut file = tokio::fs::File::create(local).await?;
        while let Some(chunk) = output.body.try_next().await.map_err(transport)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BackupArtifact>> {
        let mut artifacts = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(transport)?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                artifacts.push(BackupArtifact {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    created_at: convert_timestamp(object.last_modified()),
                    // ListObjectsV2 does not return checksums, only the
                    // entity tag. `metadata()` has the real SHA-256 digest.
                    integrity_tag: object
                        .e_tag()
                        .unwrap_or_default()
                        .trim_matches('"')
                        .to_string(),
                });
            }
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(artifacts)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // S3 delete is idempotent: deleting a missing key succeeds.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn metadata(&self, key: &str) -> Result<Option<BackupArtifact>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
        {
            Ok(head) => Ok(Some(self.artifact_from_head(key, &head))),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(transport(service_err))
                }
            }
        }
    }
}
