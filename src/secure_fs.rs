//! Secure handling of sensitive temporary files.
//!
//! Raw and compressed database dumps carry personal data; between pipeline
//! stages they are overwritten with random bytes before being unlinked so the
//! plaintext is not trivially recoverable from the disk afterwards.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;

const OVERWRITE_BUF: usize = 64 * 1024;

/// Overwrite a file with random bytes, then unlink it.
///
/// An overwrite failure degrades to a plain delete with a warning: data
/// remanence is a lower-severity problem than aborting a backup that is
/// otherwise succeeding.
pub fn secure_delete(path: &Path) -> Result<()> {
    if let Err(e) = overwrite_with_random(path) {
        warn!(path = %path.display(), error = %e, "Secure overwrite failed, falling back to plain delete");
    }
    fs::remove_file(path)?;
    Ok(())
}

fn overwrite_with_random(path: &Path) -> std::io::Result<()> {
    let len = fs::metadata(path)?.len();
    let mut file = OpenOptions::new().write(true).open(path)?;
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; OVERWRITE_BUF];

    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        rng.fill_bytes(&mut buf[..n]);
        file.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()
}

/// Streaming SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; OVERWRITE_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// SHA-256 of a file, base64-encoded the way S3 reports `ChecksumSHA256`.
pub fn sha256_file_base64(path: &Path) -> Result<String> {
    Ok(base64::engine::general_purpose::STANDARD.encode(sha256_file(path)?))
}

/// Create a file readable and writable only by the owner (0600) and write
/// `contents` into it. Fails if the file already exists.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        fs::write(&path, b"sensitive rows").unwrap();

        secure_delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"abc").unwrap();

        assert_eq!(
            hex::encode(sha256_file(&path).unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn write_private_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgpass");
        write_private(&path, b"host:5432:*:user:pw\n").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Refuses to clobber an existing file.
        assert!(write_private(&path, b"again").is_err());
    }
}
