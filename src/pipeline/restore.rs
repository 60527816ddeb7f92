//! Restore and verification pipelines.
//!
//! `DOWNLOAD → VERIFY HEADER → DECRYPT → DECOMPRESS → RESTORE`. A full
//! restore is destructive and therefore gated: the caller must supply the
//! exact confirmation string `RESTORE-{key}`, checked before any I/O against
//! the store or the database. Verification runs the same stages but reads a
//! single decompressed byte instead of invoking the restore tool, giving a
//! non-destructive proof that the archive is intact and decryptable.
//!
//! Operational caveat: once the restore tool has started, aborting the
//! operation mid-flight leaves the database in a partially restored state.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crypto::StreamCipher;
use crate::db::pg;
use crate::error::{BackupError, Result};
use crate::pipeline::{error_trace, truncate_error};
use crate::secure_fs;
use crate::store::ObjectStore;

/// Outcome for automated callers: branch on `success`, no exception handling
/// required. Never persisted.
#[derive(Debug, Serialize)]
pub struct RestoreOutcome {
    pub success: bool,
    pub key: String,
    pub error: Option<String>,
}

impl RestoreOutcome {
    fn ok(key: &str) -> Self {
        Self {
            success: true,
            key: key.to_string(),
            error: None,
        }
    }

    fn failed(key: &str, e: &BackupError) -> Self {
        Self {
            success: false,
            key: key.to_string(),
            error: Some(truncate_error(&e.to_string())),
        }
    }
}

/// Restore an artifact into the configured database.
///
/// `confirmation` must be exactly `RESTORE-{key}`; anything else is rejected
/// fail-closed before a single byte moves. `drop_existing` maps to the
/// restore tool's `--clean` flag.
pub async fn restore_backup(
    config: &Config,
    store: &dyn ObjectStore,
    key: &str,
    drop_existing: bool,
    confirmation: &str,
) -> RestoreOutcome {
    let expected = format!("RESTORE-{}", key);
    if confirmation != expected {
        warn!(key, "Restore rejected: confirmation string mismatch");
        return RestoreOutcome::failed(
            key,
            &BackupError::Config(format!(
                "destructive restore requires confirmation string \"{}\"",
                expected
            )),
        );
    }

    match execute_restore(config, store, key, drop_existing).await {
        Ok(()) => {
            info!(key, "Restore complete");
            RestoreOutcome::ok(key)
        }
        Err(e) => {
            error!(key, error = %error_trace(&e), "Restore failed");
            RestoreOutcome::failed(key, &e)
        }
    }
}

/// Non-destructive canary: download, verify the header, fully decrypt, then
/// open the decompression stream and read one byte. The restore tool is
/// never invoked.
pub async fn verify_backup(config: &Config, store: &dyn ObjectStore, key: &str) -> RestoreOutcome {
    match execute_verify(config, store, key).await {
        Ok(()) => {
            info!(key, "Backup verified");
            RestoreOutcome::ok(key)
        }
        Err(e) => {
            error!(key, error = %error_trace(&e), "Backup verification failed");
            RestoreOutcome::failed(key, &e)
        }
    }
}

async fn execute_restore(
    config: &Config,
    store: &dyn ObjectStore,
    key: &str,
    drop_existing: bool,
) -> Result<()> {
    let cipher = StreamCipher::new(config.crypto.master_key.clone())?;
    let work = tempfile::TempDir::new()?;

    let dump_path = fetch_and_decrypt(store, &cipher, key, work.path()).await?;

    info!(key, "Stage 5/5: restore");
    pg::run_restore(&config.database, &dump_path, drop_existing, work.path()).await?;

    // The decompressed dump is plaintext personal data; scrub it rather
    // than leaving it to the temp dir's plain unlink.
    scrub_file(dump_path).await?;
    Ok(())
}

async fn execute_verify(config: &Config, store: &dyn ObjectStore, key: &str) -> Result<()> {
    let cipher = StreamCipher::new(config.crypto.master_key.clone())?;
    let work = tempfile::TempDir::new()?;

    let dump_path = fetch_and_decrypt(store, &cipher, key, work.path()).await?;

    // One byte through the decoder proves the compressed stream opens; the
    // decrypt above already authenticated every ciphertext chunk.
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut decoder = zstd::stream::read::Decoder::new(File::open(&dump_path)?)?;
        let mut first = [0u8; 1];
        decoder.read(&mut first)?;
        drop(decoder);

        secure_fs::secure_delete(&dump_path)?;
        Ok(())
    })
    .await
    .map_err(|e| BackupError::Unknown(e.to_string()))?
}

/// Shared front half of restore and verify:
/// download → structural header check → decrypt → decompress.
/// Returns the path of the decompressed dump inside `work`.
async fn fetch_and_decrypt(
    store: &dyn ObjectStore,
    cipher: &StreamCipher,
    key: &str,
    work: &Path,
) -> Result<PathBuf> {
    let encrypted_path = work.join("artifact.enc");
    info!(key, "Stage 1/5: download");
    store.download(key, &encrypted_path).await?;

    info!(key, "Stage 2/5: verify header");
    let version = StreamCipher::verify(&encrypted_path)?;
    info!(key, version, "Artifact header OK");

    let compressed_path = work.join("artifact.zst");
    info!(key, "Stage 3/5: decrypt");
    decrypt_file(cipher.clone(), encrypted_path, compressed_path.clone()).await?;

    let dump_path = work.join("artifact.pgdump");
    info!(key, "Stage 4/5: decompress");
    decompress_and_scrub(compressed_path, dump_path.clone()).await?;

    Ok(dump_path)
}

async fn decrypt_file(cipher: StreamCipher, input: PathBuf, output: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let reader = BufReader::new(File::open(&input)?);
        let mut writer = BufWriter::new(File::create(&output)?);
        cipher.decrypt(reader, &mut writer)?;
        writer.flush()?;
        Ok(())
    })
    .await
    .map_err(|e| BackupError::Unknown(e.to_string()))?
}

/// Decompress `input` into `output`, then securely delete the compressed
/// plaintext. Mirrors the backup pipeline's scrub-as-you-go handling of
/// intermediate plaintext files.
async fn decompress_and_scrub(input: PathBuf, output: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let reader = BufReader::new(File::open(&input)?);
        let mut writer = BufWriter::new(File::create(&output)?);
        zstd::stream::copy_decode(reader, &mut writer)?;
        writer.flush()?;

        secure_fs::secure_delete(&input)?;
        Ok(())
    })
    .await
    .map_err(|e| BackupError::Unknown(e.to_string()))?
}

async fn scrub_file(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || secure_fs::secure_delete(&path))
        .await
        .map_err(|e| BackupError::Unknown(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decompress_and_scrub_removes_compressed_plaintext() {
        let work = tempfile::tempdir().unwrap();
        let compressed = work.path().join("dump.zst");
        let output = work.path().join("dump.pgdump");

        let mut encoded = Vec::new();
        zstd::stream::copy_encode(&b"copyright 2026 course admin"[..], &mut encoded, 3).unwrap();
        std::fs::write(&compressed, &encoded).unwrap();

        decompress_and_scrub(compressed.clone(), output.clone())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"copyright 2026 course admin");
        assert!(!compressed.exists());
    }
}
