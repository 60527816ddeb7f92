//! Health surface.
//!
//! Each dependency is probed independently so a partial outage (say, a
//! reachable store but a missing pg_restore binary) shows up as exactly the
//! field that is broken.

use serde::Serialize;

use crate::config::{Config, MIN_MASTER_KEY_LEN};
use crate::db::pg;
use crate::store::ObjectStore;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub encryption_key_configured: bool,
    pub object_store_reachable: bool,
    pub dump_tool_available: bool,
    pub restore_tool_available: bool,
    /// `None` when the store is unreachable.
    pub backup_count: Option<usize>,
    pub latest_backup: Option<String>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.encryption_key_configured
            && self.object_store_reachable
            && self.dump_tool_available
            && self.restore_tool_available
    }
}

pub async fn check(config: &Config, store: &dyn ObjectStore) -> HealthReport {
    let encryption_key_configured = config.crypto.master_key.len() >= MIN_MASTER_KEY_LEN;

    let (object_store_reachable, backup_count, latest_backup) = match store.list().await {
        Ok(artifacts) => {
            let latest = artifacts.first().map(|a| a.key.clone());
            (true, Some(artifacts.len()), latest)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Object store unreachable");
            (false, None, None)
        }
    };

    HealthReport {
        encryption_key_configured,
        object_store_reachable,
        dump_tool_available: pg::tool_available(&config.database.dump_tool).await,
        restore_tool_available: pg::tool_available(&config.database.restore_tool).await,
        backup_count,
        latest_backup,
    }
}
