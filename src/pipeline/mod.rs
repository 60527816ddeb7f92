//! Backup and restore orchestration.
//!
//! Each pipeline run is a single sequential flow through its stages, with
//! every intermediate artifact confined to one scoped temporary directory
//! that is removed on every exit path.

pub mod backup;
pub mod restore;
pub mod retention;

pub use backup::{run_backup, BackupReport};
pub use restore::{restore_backup, verify_backup, RestoreOutcome};
pub use retention::cleanup_old;

/// Cap on error text carried in result values handed to automated callers.
/// Full traces go to the log and the operator channel instead.
pub(crate) const ERROR_TRUNCATE_LEN: usize = 300;

pub(crate) fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_TRUNCATE_LEN {
        message.to_string()
    } else {
        let mut end = ERROR_TRUNCATE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &message[..end])
    }
}

/// Display text plus the chain of causes, one per line. Attached to failure
/// notifications as a file.
pub(crate) fn error_trace(e: &dyn std::error::Error) -> String {
    let mut trace = format!("{}\n", e);
    let mut source = e.source();
    while let Some(cause) = source {
        trace.push_str(&format!("caused by: {}\n", cause));
        source = cause.source();
    }
    trace
}
