//! records-vault - command line entry point.
//!
//! Drives the vault engine for operators and scheduled jobs: snapshots,
//! restores, archive comparison, backup staleness and audit verification.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use records_vault::backup::BackupRequest;
use records_vault::config::VaultConfig;
use records_vault::logging;
use records_vault::model::Operator;
use records_vault::progress::format_bytes;
use records_vault::restore::RestoreRequest;
use records_vault::service::VaultService;

#[derive(Parser, Debug)]
#[command(author, version, about = "Backup, restore and disaster recovery for the records archive", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot the data tree into a backup archive
    Backup {
        /// Also archive the filed-email tree (can be very large)
        #[arg(long)]
        include_emails: bool,

        /// Write the archive here instead of the configured backups directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replace the live store with an archive's contents
    Restore {
        /// Backup archive to restore from
        archive: PathBuf,
    },
    /// Show per-module differences between an archive and the live store
    Compare {
        /// Backup archive to compare against
        archive: PathBuf,
    },
    /// Show when the last successful backup ran
    Status,
    /// Recompute the audit chain and report the first broken link
    VerifyAudit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => VaultConfig::from_file(path)?,
        None => VaultConfig::default_config(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    logging::init(log_level)?;

    tracing::info!("Starting records-vault v{}", env!("CARGO_PKG_VERSION"));

    let service = VaultService::open(&config)?;
    let operator = Operator::system();

    match args.command {
        Command::Backup {
            include_emails,
            output,
        } => {
            let printer = spawn_progress_printer(&service);
            let report = service
                .backup(BackupRequest {
                    operator,
                    include_emails,
                    output,
                })
                .await?;
            printer.abort();
            println!(
                "Backup written to {} ({}, {} files)",
                report.archive_path.display(),
                format_bytes(report.size_bytes),
                report.manifest.file_count
            );
        }
        Command::Restore { archive } => {
            println!("Do not close the application while the restore is running.");
            let printer = spawn_progress_printer(&service);
            let outcome = service
                .restore(RestoreRequest {
                    archive_path: archive,
                    operator,
                })
                .await;
            printer.abort();

            if outcome.success {
                println!("Restore completed.");
                if let Some(report) = &outcome.report {
                    println!("{} files restored.", report.extracted_files);
                    if report.repair.operator_recreated {
                        println!(
                            "Your account was missing from the restored data; a placeholder was created and a credential reset is required at next login."
                        );
                    }
                    if !report.repair.dangling.is_empty() {
                        println!(
                            "Warning: {} dangling references were found in the restored data (see log).",
                            report.repair.dangling.len()
                        );
                    }
                }
            } else {
                if outcome.rolled_back {
                    eprintln!("The previous data was automatically rolled back.");
                }
                anyhow::bail!(
                    "restore failed: {}",
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        Command::Compare { archive } => {
            let comparison = service.compare(archive).await?;
            if comparison.archive_predates_current {
                println!("Note: the archive is older than the live data.");
            }
            println!(
                "{:<12} {:>10} {:>10} {:>8}",
                "module", "archived", "current", "delta"
            );
            for module in &comparison.modules {
                println!(
                    "{:<12} {:>10} {:>10} {:>+8}",
                    module.module, module.archived_count, module.current_count, module.delta
                );
            }
        }
        Command::Status => match service.backup_status().await? {
            Some(record) => {
                println!(
                    "Last backup: {} by {} ({})",
                    record.last_backup_timestamp.to_rfc3339(),
                    record.last_backup_user,
                    format_bytes(record.last_backup_size_bytes)
                );
                println!("Archive: {}", record.last_backup_file_path.display());
                let days = record.days_since(chrono::Utc::now());
                if days >= 7 {
                    println!("Warning: {days} days since the last backup.");
                } else {
                    println!("{days} days since the last backup.");
                }
            }
            None => println!("No successful backup recorded yet."),
        },
        Command::VerifyAudit => {
            let check = service.verify_audit().await?;
            if check.ok {
                println!("Audit chain intact ({} entries).", check.entries);
            } else {
                anyhow::bail!(
                    "audit chain broken at entry {} of {}",
                    check.first_broken.unwrap_or_default(),
                    check.entries
                );
            }
        }
    }

    Ok(())
}

fn spawn_progress_printer(service: &VaultService) -> tokio::task::JoinHandle<()> {
    let mut progress = service.subscribe_progress();
    tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            match &event.current_file {
                Some(file) => println!("[{:>3}%] {} ({})", event.percentage, event.message, file),
                None => println!("[{:>3}%] {}", event.percentage, event.message),
            }
        }
    })
}
