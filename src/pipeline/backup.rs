//! Backup creation pipeline.
//!
//! `DUMP → COMPRESS → ENCRYPT → UPLOAD → NOTIFY → CLEANUP`, strictly linear
//! with failure as the only branch. The raw dump and the compressed plaintext
//! both contain personal data, so each is securely deleted the moment the
//! next stage has consumed it; whatever remains goes away with the scoped
//! temp directory.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::crypto::StreamCipher;
use crate::db::pg;
use crate::error::{BackupError, Result};
use crate::notify::Notifier;
use crate::pipeline::{error_trace, truncate_error};
use crate::secure_fs;
use crate::store::{BackupArtifact, ObjectStore};

/// zstd level 3: favors throughput over ratio for multi-gigabyte dumps.
const COMPRESSION_LEVEL: i32 = 3;

/// Outcome handed back to the caller. Never persisted.
#[derive(Debug, Serialize)]
pub struct BackupReport {
    pub success: bool,
    pub key: Option<String>,
    pub size: u64,
    pub duration_secs: u64,
    pub error: Option<String>,
}

/// Local copy of the encrypted artifact, kept alive (together with its
/// scoped directory) until the success notification has been sent.
struct StagedArtifact {
    path: PathBuf,
    _work: tempfile::TempDir,
}

/// Run one backup end to end and report the outcome to the operator channel.
/// Errors are converted into the report; they do not propagate.
pub async fn run_backup(
    config: &Config,
    store: &dyn ObjectStore,
    notifier: &dyn Notifier,
) -> BackupReport {
    let started = Instant::now();

    match execute(config, store).await {
        Ok((artifact, staged)) => {
            info!(
                key = %artifact.key,
                size = artifact.size,
                duration_secs = started.elapsed().as_secs(),
                "Backup complete"
            );
            info!("Stage 5/6: notify");
            notifier.backup_succeeded(&artifact, &staged.path).await;
            info!("Stage 6/6: cleanup");
            drop(staged);
            BackupReport {
                success: true,
                key: Some(artifact.key),
                size: artifact.size,
                duration_secs: started.elapsed().as_secs(),
                error: None,
            }
        }
        Err(e) => {
            let trace = error_trace(&e);
            error!(error = %trace, "Backup failed");

            // The full trace travels as an attached file; writing it fails
            // only in degenerate cases, in which case we notify without it.
            let trace_file = write_trace_file(&trace);
            notifier
                .backup_failed(&truncate_error(&e.to_string()), trace_file.as_ref().map(|f| f.path()))
                .await;

            BackupReport {
                success: false,
                key: None,
                size: 0,
                duration_secs: started.elapsed().as_secs(),
                error: Some(truncate_error(&e.to_string())),
            }
        }
    }
}

async fn execute(config: &Config, store: &dyn ObjectStore) -> Result<(BackupArtifact, StagedArtifact)> {
    let cipher = StreamCipher::new(config.crypto.master_key.clone())?;

    // Every intermediate artifact lives here and dies with this guard,
    // on success and on every error path alike. On success the guard is
    // handed to the caller so the encrypted file outlives the notify stage.
    let work = tempfile::TempDir::new()?;

    let dump_path = work.path().join("dump.pgdump");
    info!(dbname = %config.database.dbname, "Stage 1/6: dump");
    pg::run_dump(&config.database, &dump_path, work.path()).await?;

    let compressed_path = work.path().join("dump.zst");
    info!("Stage 2/6: compress");
    compress_and_scrub(dump_path.clone(), compressed_path.clone()).await?;

    let encrypted_path = work.path().join("dump.zst.enc");
    info!("Stage 3/6: encrypt");
    encrypt_and_scrub(cipher, compressed_path.clone(), encrypted_path.clone()).await?;

    let key = generate_key();
    info!(key = %key, "Stage 4/6: upload");
    store.ensure_bucket().await?;
    let artifact = store.upload(&encrypted_path, &key, true).await?;

    Ok((
        artifact,
        StagedArtifact {
            path: encrypted_path,
            _work: work,
        },
    ))
}

/// Compress `input` into `output`, then securely delete the raw dump.
/// Both the compression and the scrub are blocking, so they run off the
/// async executor.
async fn compress_and_scrub(input: PathBuf, output: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let reader = BufReader::new(File::open(&input)?);
        let mut writer = BufWriter::new(File::create(&output)?);
        zstd::stream::copy_encode(reader, &mut writer, COMPRESSION_LEVEL)?;
        writer.flush()?;

        secure_fs::secure_delete(&input)?;
        Ok(())
    })
    .await
    .map_err(|e| BackupError::Unknown(e.to_string()))?
}

/// Encrypt `input` into `output`, then securely delete the compressed
/// plaintext.
async fn encrypt_and_scrub(cipher: StreamCipher, input: PathBuf, output: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let reader = BufReader::new(File::open(&input)?);
        let mut writer = BufWriter::new(File::create(&output)?);
        cipher.encrypt(reader, &mut writer)?;
        writer.flush()?;

        secure_fs::secure_delete(&input)?;
        Ok(())
    })
    .await
    .map_err(|e| BackupError::Unknown(e.to_string()))?
}

/// `backup_{date}_{random-hex}.enc`. The random component keeps object names
/// from revealing exact backup timing to anyone who can list the bucket.
fn generate_key() -> String {
    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);
    format!(
        "backup_{}_{}.enc",
        Utc::now().format("%Y-%m-%d"),
        hex::encode(random)
    )
}

fn write_trace_file(trace: &str) -> Option<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new().ok()?;
    file.write_all(trace.as_bytes()).ok()?;
    file.flush().ok()?;
    Some(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_random_component() {
        let a = generate_key();
        let b = generate_key();

        let date = Utc::now().format("%Y-%m-%d").to_string();
        assert!(a.starts_with(&format!("backup_{}_", date)));
        assert!(a.ends_with(".enc"));
        // Same day, different keys.
        assert_ne!(a, b);
    }

    #[test]
    fn truncate_error_caps_long_messages() {
        let short = truncate_error("fits");
        assert_eq!(short, "fits");

        let long = truncate_error(&"x".repeat(2000));
        assert!(long.len() < 2000);
    }
}
