//! course-backup - Main entry point
//!
//! Encrypted database backup/restore pipeline for the course administration
//! backend.

use anyhow::Result;
use clap::{Parser, Subcommand};
use course_backup::notify::{Notifier, NoopNotifier, WebhookNotifier};
use course_backup::store::{ObjectStore, S3ObjectStore};
use course_backup::{config::Config, health, logging, pipeline};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump, encrypt and upload a backup of the configured database
    Backup,

    /// Restore a backup into the configured database (destructive)
    Restore {
        /// Remote artifact key
        key: String,

        /// Drop conflicting database objects before restoring
        #[arg(long)]
        drop_existing: bool,

        /// Confirmation string; must be exactly "RESTORE-{key}"
        #[arg(long)]
        confirm: String,
    },

    /// Download, decrypt and check a backup without touching the database
    Verify {
        /// Remote artifact key
        key: String,
    },

    /// List stored backups, newest first
    List,

    /// Delete backups older than the retention window
    Cleanup {
        /// Override the configured retention window (days)
        #[arg(long)]
        days: Option<i64>,
    },

    /// Probe each external dependency and print a health report
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_env();
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    logging::init(log_level);

    tracing::info!("Starting course-backup v{}", env!("CARGO_PKG_VERSION"));

    let store = S3ObjectStore::connect(&config.storage).await?;

    match args.command {
        Command::Backup => {
            config.validate()?;
            let notifier: Box<dyn Notifier> = match &config.notify_webhook {
                Some(url) => Box::new(WebhookNotifier::new(url)),
                None => Box::new(NoopNotifier),
            };

            let report = pipeline::run_backup(&config, &store, notifier.as_ref()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
        }

        Command::Restore {
            key,
            drop_existing,
            confirm,
        } => {
            config.validate()?;
            let outcome =
                pipeline::restore_backup(&config, &store, &key, drop_existing, &confirm).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }

        Command::Verify { key } => {
            config.validate()?;
            let outcome = pipeline::verify_backup(&config, &store, &key).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }

        Command::List => {
            let artifacts = store.list().await?;
            println!("{}", serde_json::to_string_pretty(&artifacts)?);
        }

        Command::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let deleted = pipeline::cleanup_old(&store, days).await?;
            tracing::info!(deleted, days, "Cleanup finished");
        }

        Command::Health => {
            let report = health::check(&config, &store).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
