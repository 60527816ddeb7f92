//! Encrypted backup/restore pipeline for the course administration backend.
//!
//! Takes an arbitrarily large database dump, compresses and encrypts it in
//! bounded memory, ships it to object storage with verified integrity, and
//! can later retrieve, verify and restore it. No unencrypted sensitive
//! artifact survives on local disk, and tampering is always detected rather
//! than silently accepted.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod health;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod secure_fs;
pub mod store;

pub use config::Config;
pub use crypto::StreamCipher;
pub use error::{BackupError, Result};
pub use pipeline::{cleanup_old, restore_backup, run_backup, verify_backup};
pub use store::{BackupArtifact, MemoryObjectStore, ObjectStore, S3ObjectStore};
