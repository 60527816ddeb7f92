//! Retention sweep for aged-out artifacts.

use chrono::{Duration, Utc};
use tracing::info;

use crate::error::Result;
use crate::store::ObjectStore;

/// Delete every artifact older than `retention_days`, returning the number
/// deleted. Invocation cadence is the external scheduler's business.
pub async fn cleanup_old(store: &dyn ObjectStore, retention_days: i64) -> Result<usize> {
    let cutoff = Utc::now() - Duration::days(retention_days);

    let mut deleted = 0;
    for artifact in store.list().await? {
        if artifact.created_at < cutoff {
            store.delete(&artifact.key).await?;
            info!(key = %artifact.key, created_at = %artifact.created_at, "Removed expired backup");
            deleted += 1;
        }
    }

    info!(deleted, retention_days, "Retention sweep complete");
    Ok(deleted)
}
