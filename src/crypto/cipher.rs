//! Chunked authenticated encryption for streams too large to hold in memory.
//!
//! Current format (v1):
//!
//! ```text
//! [version:1][salt:16][base_nonce:8]  (chunk ciphertext ‖ 16-byte tag)*
//! ```
//!
//! Each plaintext chunk is sealed with AES-256-GCM under a per-chunk nonce of
//! `base_nonce ‖ be_u32(counter)`, counters starting at 0. The counter scheme
//! makes every nonce within an artifact provably unique, and the fresh
//! `(salt, base_nonce)` pair makes the derived key and nonce stream unique
//! across artifacts even though the master secret never changes. Nonce reuse
//! under one key breaks AES-GCM completely, so chunk order is a hard
//! correctness requirement here, not a performance detail.
//!
//! Legacy format (v0, still readable): `[salt:16][nonce:12][ciphertext‖tag]`,
//! one AEAD call over the whole body. Pre-existing archives were written this
//! way and must keep decrypting until every one of them is re-encrypted.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::MIN_MASTER_KEY_LEN;
use crate::error::{BackupError, Result};

/// Plaintext bytes per chunk (1 MiB). Bounds memory regardless of input size.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// AES-GCM authentication tag length.
pub const TAG_SIZE: usize = 16;

/// Legacy single-shot format.
pub const FORMAT_V0: u8 = 0;

/// Chunked format with a versioned header.
pub const FORMAT_V1: u8 = 1;

const SALT_SIZE: usize = 16;
const BASE_NONCE_SIZE: usize = 8;
const NONCE_SIZE: usize = 12;

/// PBKDF2-HMAC-SHA256 round count. Deliberately slow so an offline attacker
/// cannot cheaply grind a weak master secret.
const PBKDF2_ROUNDS: u32 = 310_000;

/// Parsed encryption header, resolved once at the start of decryption.
/// New formats are added as variants, never as branches inside a decrypt loop.
enum Format {
    V0 { salt: [u8; SALT_SIZE], nonce: [u8; NONCE_SIZE] },
    V1 { salt: [u8; SALT_SIZE], base_nonce: [u8; BASE_NONCE_SIZE] },
}

/// Chunked AEAD cipher keyed by a long-lived master secret.
#[derive(Clone)]
pub struct StreamCipher {
    master_secret: Zeroizing<Vec<u8>>,
    chunk_size: usize,
}

impl StreamCipher {
    pub fn new(master_secret: impl Into<Vec<u8>>) -> Result<Self> {
        let master_secret = Zeroizing::new(master_secret.into());
        if master_secret.len() < MIN_MASTER_KEY_LEN {
            return Err(BackupError::Config(format!(
                "master key must be at least {} bytes",
                MIN_MASTER_KEY_LEN
            )));
        }
        Ok(Self {
            master_secret,
            chunk_size: CHUNK_SIZE,
        })
    }

    /// Override the chunk size. Small chunks keep tests fast; production code
    /// uses the default.
    #[cfg(test)]
    fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        self.chunk_size = chunk_size;
        self
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(&self.master_secret, salt, PBKDF2_ROUNDS, key.as_mut());
        key
    }

    /// Encrypt `reader` into `writer` in the v1 chunked format.
    /// Returns the number of plaintext bytes consumed.
    pub fn encrypt<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut salt = [0u8; SALT_SIZE];
        let mut base_nonce = [0u8; BASE_NONCE_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut base_nonce);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));

        writer.write_all(&[FORMAT_V1])?;
        writer.write_all(&salt)?;
        writer.write_all(&base_nonce)?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut counter: u32 = 0;
        let mut total: u64 = 0;

        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }

            let nonce = chunk_nonce(&base_nonce, counter);
            let sealed = cipher
                .encrypt(Nonce::from_slice(&nonce), &buf[..n])
                .map_err(|_| BackupError::Integrity("chunk encryption failed".into()))?;
            writer.write_all(&sealed)?;

            total += n as u64;
            counter = counter
                .checked_add(1)
                .ok_or_else(|| BackupError::Integrity("chunk counter overflow".into()))?;

            if n < self.chunk_size {
                break;
            }
        }

        writer.flush()?;
        Ok(total)
    }

    /// Decrypt `reader` into `writer`, auto-detecting the format from the
    /// leading byte. A single failed tag aborts with `Integrity`; no
    /// unverified plaintext is ever written.
    pub fn decrypt<R: Read, W: Write>(&self, mut reader: R, writer: W) -> Result<u64> {
        match read_format(&mut reader)? {
            Format::V1 { salt, base_nonce } => self.decrypt_v1(&salt, &base_nonce, reader, writer),
            Format::V0 { salt, nonce } => self.decrypt_v0(&salt, &nonce, reader, writer),
        }
    }

    fn decrypt_v1<R: Read, W: Write>(
        &self,
        salt: &[u8],
        base_nonce: &[u8; BASE_NONCE_SIZE],
        mut reader: R,
        mut writer: W,
    ) -> Result<u64> {
        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));

        let window = self.chunk_size + TAG_SIZE;
        let mut buf = vec![0u8; window];
        let mut counter: u32 = 0;
        let mut total: u64 = 0;

        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            // A window that cannot hold a tag plus at least one byte is a
            // truncated or corrupted artifact, not a valid final chunk.
            if n <= TAG_SIZE {
                return Err(BackupError::Integrity("truncated ciphertext chunk".into()));
            }

            let nonce = chunk_nonce(base_nonce, counter);
            let plain = cipher
                .decrypt(Nonce::from_slice(&nonce), &buf[..n])
                .map_err(|_| {
                    BackupError::Integrity(format!("tag verification failed at chunk {}", counter))
                })?;
            writer.write_all(&plain)?;

            total += plain.len() as u64;
            counter = counter
                .checked_add(1)
                .ok_or_else(|| BackupError::Integrity("chunk counter overflow".into()))?;

            if n < window {
                break;
            }
        }

        writer.flush()?;
        Ok(total)
    }

    fn decrypt_v0<R: Read, W: Write>(
        &self,
        salt: &[u8],
        nonce: &[u8; NONCE_SIZE],
        mut reader: R,
        mut writer: W,
    ) -> Result<u64> {
        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        if body.len() < TAG_SIZE {
            return Err(BackupError::Integrity("legacy archive too short".into()));
        }

        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), body.as_slice())
            .map_err(|_| BackupError::Integrity("legacy tag verification failed".into()))?;
        writer.write_all(&plain)?;
        writer.flush()?;
        Ok(plain.len() as u64)
    }

    /// Cheap structural check: the header parses and the file is long enough
    /// to possibly be a valid artifact. Does not decrypt anything; used by
    /// health probes and the restore pipeline before committing to a full
    /// decrypt.
    pub fn verify(path: &Path) -> Result<u8> {
        let len = std::fs::metadata(path)?.len();
        let mut file = File::open(path)?;
        match read_format(&mut file)? {
            Format::V1 { .. } => {
                let header = (1 + SALT_SIZE + BASE_NONCE_SIZE) as u64;
                // Header-only is a valid empty artifact; anything between
                // header and header+tag is necessarily truncated.
                if len > header && len <= header + TAG_SIZE as u64 {
                    return Err(BackupError::Integrity("file too short for v1 format".into()));
                }
                Ok(FORMAT_V1)
            }
            Format::V0 { .. } => {
                let min = (SALT_SIZE + NONCE_SIZE + TAG_SIZE) as u64;
                if len < min {
                    return Err(BackupError::Integrity("file too short for legacy format".into()));
                }
                Ok(FORMAT_V0)
            }
        }
    }

    /// Format version byte of an artifact, for diagnostics and migration
    /// tooling.
    pub fn format_version(path: &Path) -> Result<u8> {
        let mut file = File::open(path)?;
        let mut first = [0u8; 1];
        file.read_exact(&mut first)
            .map_err(|_| BackupError::Integrity("empty artifact".into()))?;
        Ok(if first[0] == FORMAT_V1 { FORMAT_V1 } else { FORMAT_V0 })
    }
}

/// Read the header and resolve the format once. An unrecognized leading byte
/// means a legacy v0 archive, whose body starts with the 16-byte salt.
fn read_format<R: Read>(reader: &mut R) -> Result<Format> {
    let mut first = [0u8; 1];
    reader
        .read_exact(&mut first)
        .map_err(|_| BackupError::Integrity("empty artifact".into()))?;

    if first[0] == FORMAT_V1 {
        let mut salt = [0u8; SALT_SIZE];
        let mut base_nonce = [0u8; BASE_NONCE_SIZE];
        reader
            .read_exact(&mut salt)
            .and_then(|_| reader.read_exact(&mut base_nonce))
            .map_err(|_| BackupError::Integrity("truncated v1 header".into()))?;
        Ok(Format::V1 { salt, base_nonce })
    } else {
        let mut salt = [0u8; SALT_SIZE];
        salt[0] = first[0];
        let mut nonce = [0u8; NONCE_SIZE];
        reader
            .read_exact(&mut salt[1..])
            .and_then(|_| reader.read_exact(&mut nonce))
            .map_err(|_| BackupError::Integrity("truncated legacy header".into()))?;
        Ok(Format::V0 { salt, nonce })
    }
}

fn chunk_nonce(base: &[u8; BASE_NONCE_SIZE], counter: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..BASE_NONCE_SIZE].copy_from_slice(base);
    nonce[BASE_NONCE_SIZE..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Fill `buf` as far as possible, returning the number of bytes read.
/// Returns less than `buf.len()` only at end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;

    const TEST_KEY: &str = "unit-test-master-secret";
    const TEST_CHUNK: usize = 1024;

    fn test_cipher() -> StreamCipher {
        StreamCipher::new(TEST_KEY).unwrap().with_chunk_size(TEST_CHUNK)
    }

    fn pattern_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn roundtrip(cipher: &StreamCipher, plain: &[u8]) -> Vec<u8> {
        let mut sealed = Vec::new();
        cipher.encrypt(Cursor::new(plain), &mut sealed).unwrap();

        let mut out = Vec::new();
        cipher.decrypt(Cursor::new(&sealed), &mut out).unwrap();
        out
    }

    #[test]
    fn rejects_short_master_key() {
        assert!(matches!(
            StreamCipher::new("short"),
            Err(BackupError::Config(_))
        ));
    }

    #[test]
    fn roundtrip_boundary_lengths() {
        let cipher = test_cipher();
        for len in [
            0,
            1,
            TEST_CHUNK - 1,
            TEST_CHUNK,
            TEST_CHUNK + 1,
            3 * TEST_CHUNK + TEST_CHUNK / 2,
            5 * TEST_CHUNK,
            5 * TEST_CHUNK + 1,
        ] {
            let plain = pattern_bytes(len);
            assert_eq!(roundtrip(&cipher, &plain), plain, "length {}", len);
        }
    }

    #[test]
    fn fresh_salt_and_nonce_per_artifact() {
        let cipher = test_cipher();
        let mut a = Vec::new();
        let mut b = Vec::new();
        cipher.encrypt(Cursor::new(b"same input"), &mut a).unwrap();
        cipher.encrypt(Cursor::new(b"same input"), &mut b).unwrap();
        // Headers (and therefore derived keys and ciphertexts) must differ.
        assert_ne!(a[1..25], b[1..25]);
        assert_ne!(a[25..], b[25..]);
    }

    #[test]
    fn tamper_anywhere_in_body_is_detected() {
        let cipher = test_cipher();
        let plain = pattern_bytes(2 * TEST_CHUNK + 17);
        let mut sealed = Vec::new();
        cipher.encrypt(Cursor::new(&plain), &mut sealed).unwrap();

        let header = 1 + 16 + 8;
        // Flip one bit at a spread of body positions, including both tags.
        for pos in [
            header,
            header + 1,
            header + TEST_CHUNK / 2,
            header + TEST_CHUNK + TAG_SIZE, // second chunk
            sealed.len() - 1,               // final tag byte
        ] {
            let mut bad = sealed.clone();
            bad[pos] ^= 0x01;
            let mut out = Vec::new();
            let err = cipher.decrypt(Cursor::new(&bad), &mut out).unwrap_err();
            assert!(
                matches!(err, BackupError::Integrity(_)),
                "bit flip at {} not detected",
                pos
            );
        }
    }

    #[test]
    fn truncated_ciphertext_is_detected() {
        let cipher = test_cipher();
        let mut sealed = Vec::new();
        cipher
            .encrypt(Cursor::new(pattern_bytes(TEST_CHUNK)), &mut sealed)
            .unwrap();

        sealed.truncate(sealed.len() - 1);
        let mut out = Vec::new();
        assert!(matches!(
            cipher.decrypt(Cursor::new(&sealed), &mut out),
            Err(BackupError::Integrity(_))
        ));
    }

    #[test]
    fn chunk_nonces_are_pairwise_distinct() {
        let base = [7u8; 8];
        let nonces: HashSet<_> = (0..1000u32).map(|i| chunk_nonce(&base, i)).collect();
        assert_eq!(nonces.len(), 1000);
        // And the counter occupies the trailing four bytes, big-endian.
        assert_eq!(&chunk_nonce(&base, 0x01020304)[8..], &[1, 2, 3, 4]);
    }

    /// Build a v0 archive the way the old single-shot writer did and make
    /// sure it decrypts with no version hint from the caller.
    #[test]
    fn legacy_v0_archive_decrypts_automatically() {
        let cipher = test_cipher();
        let plain = b"legacy archive body";

        // salt must not start with the v1 version byte, matching real v0
        // archives which predate versioning.
        let salt = [0x5a; 16];
        let nonce = [0x2b; 12];
        let key = cipher.derive_key(&salt);
        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
        let body = aead.encrypt(Nonce::from_slice(&nonce), plain.as_ref()).unwrap();

        let mut archive = Vec::new();
        archive.extend_from_slice(&salt);
        archive.extend_from_slice(&nonce);
        archive.extend_from_slice(&body);

        let mut out = Vec::new();
        cipher.decrypt(Cursor::new(&archive), &mut out).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn verify_and_format_version() {
        let cipher = test_cipher();
        let dir = tempfile::tempdir().unwrap();

        let v1_path = dir.path().join("v1.enc");
        let mut sealed = Vec::new();
        cipher.encrypt(Cursor::new(b"hello"), &mut sealed).unwrap();
        std::fs::write(&v1_path, &sealed).unwrap();
        assert_eq!(StreamCipher::verify(&v1_path).unwrap(), FORMAT_V1);
        assert_eq!(StreamCipher::format_version(&v1_path).unwrap(), FORMAT_V1);

        // Structurally valid legacy file: salt + nonce + tag-sized body.
        let v0_path = dir.path().join("v0.enc");
        std::fs::write(&v0_path, vec![0x5a; 16 + 12 + 16]).unwrap();
        assert_eq!(StreamCipher::verify(&v0_path).unwrap(), FORMAT_V0);
        assert_eq!(StreamCipher::format_version(&v0_path).unwrap(), FORMAT_V0);

        // A v1 header with a dangling partial chunk fails the length check.
        let bad_path = dir.path().join("bad.enc");
        std::fs::write(&bad_path, &sealed[..1 + 16 + 8 + 4]).unwrap();
        assert!(StreamCipher::verify(&bad_path).is_err());
    }

    #[test]
    fn empty_input_roundtrips_to_header_only_artifact() {
        let cipher = test_cipher();
        let mut sealed = Vec::new();
        cipher.encrypt(Cursor::new(&[] as &[u8]), &mut sealed).unwrap();
        assert_eq!(sealed.len(), 1 + 16 + 8);

        let mut out = Vec::new();
        cipher.decrypt(Cursor::new(&sealed), &mut out).unwrap();
        assert!(out.is_empty());
    }
}
