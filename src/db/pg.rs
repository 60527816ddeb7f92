//! pg_dump / pg_restore subprocess wrappers.
//!
//! Credentials never appear on the command line (visible in process listings)
//! or in long-lived environment variables. Each invocation writes a 0600
//! passfile, points `PGPASSFILE` at it, and deletes it when the subprocess
//! has exited, success or failure.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{BackupError, Result};
use crate::secure_fs;

/// Scoped passfile: created 0600, removed on drop on every exit path.
struct PgPassFile {
    path: PathBuf,
}

impl PgPassFile {
    fn create_in(dir: &Path, db: &DatabaseConfig) -> Result<Self> {
        let path = dir.join(".pgpass");
        // pgpass line format: host:port:database:user:password
        let line = format!(
            "{}:{}:*:{}:{}\n",
            db.host, db.port, db.username, db.password
        );
        secure_fs::write_private(&path, line.as_bytes())?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PgPassFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove passfile");
        }
    }
}

/// Run the dump tool, writing a custom-format archive to `out`.
pub async fn run_dump(db: &DatabaseConfig, out: &Path, scratch_dir: &Path) -> Result<()> {
    let passfile = PgPassFile::create_in(scratch_dir, db)?;

    debug!(tool = %db.dump_tool, dbname = %db.dbname, "Invoking dump tool");
    let output = Command::new(&db.dump_tool)
        .arg("--format=custom")
        .arg(format!("--host={}", db.host))
        .arg(format!("--port={}", db.port))
        .arg(format!("--username={}", db.username))
        .arg(format!("--dbname={}", db.dbname))
        .arg(format!("--file={}", out.display()))
        .env("PGPASSFILE", passfile.path())
        .env_remove("PGPASSWORD")
        .output()
        .await?;

    if !output.status.success() {
        return Err(BackupError::ToolExecution {
            tool: db.dump_tool.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!(dbname = %db.dbname, "Database dump complete");
    Ok(())
}

/// Run the restore tool against the configured database.
///
/// With `drop_existing`, conflicting objects are dropped first (`--clean`).
/// pg_restore exits nonzero for "already exists" warnings when re-applying a
/// dump onto a live schema; those are tolerated as an idempotent re-apply,
/// anything else is fatal.
pub async fn run_restore(
    db: &DatabaseConfig,
    archive: &Path,
    drop_existing: bool,
    scratch_dir: &Path,
) -> Result<()> {
    let passfile = PgPassFile::create_in(scratch_dir, db)?;

    let mut cmd = Command::new(&db.restore_tool);
    cmd.arg(format!("--host={}", db.host))
        .arg(format!("--port={}", db.port))
        .arg(format!("--username={}", db.username))
        .arg(format!("--dbname={}", db.dbname));
    if drop_existing {
        cmd.arg("--clean");
    }
    cmd.arg(archive)
        .env("PGPASSFILE", passfile.path())
        .env_remove("PGPASSWORD");

    debug!(tool = %db.restore_tool, dbname = %db.dbname, drop_existing, "Invoking restore tool");
    let output = cmd.output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.to_lowercase().contains("already exists") {
            warn!(dbname = %db.dbname, "Restore reported pre-existing objects, continuing");
        } else {
            return Err(BackupError::ToolExecution {
                tool: db.restore_tool.clone(),
                stderr,
            });
        }
    }

    info!(dbname = %db.dbname, "Database restore complete");
    Ok(())
}

/// Whether a tool binary is present and runnable.
pub async fn tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    fn db_config(dump_tool: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: "localhost".into(),
            port: 5432,
            username: "postgres".into(),
            password: "hunter2".into(),
            dbname: "course_admin".into(),
            dump_tool: dump_tool.into(),
            restore_tool: "pg_restore".into(),
        }
    }

    #[test]
    fn passfile_is_scoped_to_its_guard() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_config("pg_dump");

        let path = {
            let passfile = PgPassFile::create_in(dir.path(), &db).unwrap();
            let contents = std::fs::read_to_string(passfile.path()).unwrap();
            assert_eq!(contents, "localhost:5432:*:postgres:hunter2\n");
            passfile.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_tool_surfaces_as_unavailable() {
        assert!(!tool_available("definitely-not-a-real-tool").await);
    }

    #[tokio::test]
    async fn dump_with_missing_tool_fails_and_cleans_passfile() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_config("definitely-not-a-real-tool");

        let result = run_dump(&db, &dir.path().join("out.pgdump"), dir.path()).await;
        assert!(result.is_err());
        assert!(!dir.path().join(".pgpass").exists());
    }
}
