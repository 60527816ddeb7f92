//! Configuration for the backup pipeline.
//!
//! Everything is environment-driven (with `.env` support via dotenvy) so the
//! binary can run unmodified inside the scheduler container.

use crate::error::{BackupError, Result};

/// Minimum accepted master key length in bytes. Anything shorter is refused
/// outright rather than silently producing a weak derived key.
pub const MIN_MASTER_KEY_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub retention_days: i64,
    /// Operator webhook for backup notifications. Absent means notifications
    /// are silently skipped.
    pub notify_webhook: Option<String>,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub dbname: String,

    /// Dump tool binary (pg_dump or a compatible wrapper).
    pub dump_tool: String,
    /// Restore tool binary (pg_restore or a compatible wrapper).
    pub restore_tool: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO etc.).
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CryptoConfig {
    /// Long-lived master secret; per-artifact keys are derived from it.
    pub master_key: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            database: DatabaseConfig {
                host: env_or("DB_HOST", "localhost"),
                port: env_parse("DB_PORT", 5432),
                username: env_or("DB_USER", "postgres"),
                password: std::env::var("DB_PASSWORD").unwrap_or_default(),
                dbname: env_or("DB_NAME", "course_admin"),
                dump_tool: env_or("PG_DUMP_PATH", "pg_dump"),
                restore_tool: env_or("PG_RESTORE_PATH", "pg_restore"),
            },
            storage: StorageConfig {
                bucket: env_or("S3_BUCKET", "course-backups"),
                region: env_or("S3_REGION", "us-east-1"),
                endpoint: std::env::var("S3_ENDPOINT").ok(),
                access_key: std::env::var("S3_ACCESS_KEY").ok(),
                secret_key: std::env::var("S3_SECRET_KEY").ok(),
            },
            crypto: CryptoConfig {
                master_key: std::env::var("BACKUP_MASTER_KEY").unwrap_or_default(),
            },
            retention_days: env_parse("RETENTION_DAYS", 30),
            notify_webhook: std::env::var("NOTIFY_WEBHOOK_URL").ok(),
            log_level: env_or("LOG_LEVEL", "info"),
        }
    }

    /// Reject configurations that would fail at the worst possible moment.
    pub fn validate(&self) -> Result<()> {
        if self.crypto.master_key.is_empty() {
            return Err(BackupError::Config(
                "BACKUP_MASTER_KEY is not set".into(),
            ));
        }
        if self.crypto.master_key.len() < MIN_MASTER_KEY_LEN {
            return Err(BackupError::Config(format!(
                "BACKUP_MASTER_KEY must be at least {} bytes",
                MIN_MASTER_KEY_LEN
            )));
        }
        if self.retention_days <= 0 {
            return Err(BackupError::Config(
                "RETENTION_DAYS must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(master_key: &str) -> Config {
        Config {
            database: DatabaseConfig {
                host: "localhost".into(),
                port: 5432,
                username: "postgres".into(),
                password: "".into(),
                dbname: "course_admin".into(),
                dump_tool: "pg_dump".into(),
                restore_tool: "pg_restore".into(),
            },
            storage: StorageConfig {
                bucket: "course-backups".into(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key: None,
                secret_key: None,
            },
            crypto: CryptoConfig {
                master_key: master_key.into(),
            },
            retention_days: 30,
            notify_webhook: None,
            log_level: "info".into(),
        }
    }

    #[test]
    fn validate_rejects_missing_key() {
        let config = test_config("");
        assert!(matches!(
            config.validate(),
            Err(BackupError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_short_key() {
        let config = test_config("tooshort");
        assert!(matches!(
            config.validate(),
            Err(BackupError::Config(_))
        ));
    }

    #[test]
    fn validate_accepts_long_key() {
        let config = test_config("a-sufficiently-long-master-key");
        assert!(config.validate().is_ok());
    }
}
