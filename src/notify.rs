//! Operator notifications.
//!
//! Delivery is strictly best-effort: every implementation swallows and logs
//! its own failures, so a dead webhook can never fail a backup that already
//! succeeded. The orchestrating pipelines never observe notification errors.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::store::BackupArtifact;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce a successfully uploaded artifact. `encrypted_file` is the
    /// local copy of the encrypted artifact, still alive at this point, so
    /// implementations can deliver the artifact itself to the operator
    /// channel rather than just its metadata.
    async fn backup_succeeded(&self, artifact: &BackupArtifact, encrypted_file: &Path);

    /// Report a failed backup. The full diagnostic trace travels as an
    /// attached file, not inlined into the message.
    async fn backup_failed(&self, message: &str, trace_file: Option<&Path>);
}

/// Posts notifications to an operator webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn backup_succeeded(&self, artifact: &BackupArtifact, encrypted_file: &Path) {
        let payload = json!({
            "event": "backup_succeeded",
            "key": artifact.key,
            "size": artifact.size,
            "created_at": artifact.created_at,
        });

        let mut form = reqwest::multipart::Form::new()
            .text("payload", payload.to_string());

        // Deliver the encrypted artifact itself; it is safe to hand to the
        // operator channel precisely because it is encrypted. If the local
        // copy cannot be read, fall back to metadata only.
        match tokio::fs::read(encrypted_file).await {
            Ok(bytes) => {
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(artifact.key.clone());
                form = form.part("artifact", part);
            }
            Err(e) => {
                warn!(error = %e, "Could not read encrypted artifact for attachment");
            }
        }

        match self.client.post(&self.url).multipart(form).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(key = %artifact.key, "Backup notification delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "Backup notification rejected");
            }
            Err(e) => {
                warn!(error = %e, "Backup notification failed");
            }
        }
    }

    async fn backup_failed(&self, message: &str, trace_file: Option<&Path>) {
        let payload = json!({
            "event": "backup_failed",
            "message": message,
        });

        let mut form = reqwest::multipart::Form::new()
            .text("payload", payload.to_string());

        if let Some(path) = trace_file {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let part = reqwest::multipart::Part::bytes(bytes)
                        .file_name("backup-error.log");
                    form = form.part("trace", part);
                }
                Err(e) => {
                    warn!(error = %e, "Could not read failure trace for attachment");
                }
            }
        }

        match self.client.post(&self.url).multipart(form).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("Failure notification delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "Failure notification rejected");
            }
            Err(e) => {
                warn!(error = %e, "Failure notification failed");
            }
        }
    }
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn backup_succeeded(&self, artifact: &BackupArtifact, _encrypted_file: &Path) {
        info!(key = %artifact.key, "Backup complete (no notification channel configured)");
    }

    async fn backup_failed(&self, message: &str, _trace_file: Option<&Path>) {
        warn!(message, "Backup failed (no notification channel configured)");
    }
}
