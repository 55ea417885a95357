use anyhow::{bail, Context, Result};
use backup_engine::config::{self, BackupKind, Frequency};
use backup_engine::engine::{BackupEngine, Collaborators};
use backup_engine::managers::logging::{self, LoggingConfig};
use backup_engine::managers::notification::format_duration;
use backup_engine::managers::restore::{RestoreMode, RestoreOptions};
use backup_engine::registry::{BackupRecord, BackupStatus, RecordFilter};
use backup_engine::utils::cancel::CancelToken;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "backup-engine")]
#[command(about = "Capture, store, verify and restore backups", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/backup-engine/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one configured backup job
    Backup {
        /// Job name from the configuration
        #[arg(short, long)]
        job: String,
    },

    /// Run every enabled job
    BackupAll,

    /// Restore a backup
    Restore {
        /// Backup id
        #[arg(long)]
        id: String,

        /// Only fetch and verify; touch no target system
        #[arg(long)]
        verify_only: bool,

        /// Directory to extract file tree, media and config snapshot backups into
        #[arg(short, long)]
        target: Option<PathBuf>,

        /// Load a database backup into this database instead of the configured one
        #[arg(long)]
        database_url: Option<String>,

        /// Skip the confirmation prompt for destructive restores
        #[arg(short, long)]
        yes: bool,
    },

    /// Re-check a stored backup against its checksum
    Verify {
        /// Backup id
        #[arg(long)]
        id: String,
    },

    /// Delete backups past their retention
    Sweep {
        /// Backup kind, e.g. database or file_tree
        #[arg(short, long)]
        kind: BackupKind,

        /// Backup frequency, e.g. daily
        #[arg(short, long)]
        frequency: Frequency,

        /// Override the configured retention for this frequency
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// List recorded backups
    List {
        #[arg(short, long)]
        kind: Option<BackupKind>,

        #[arg(short, long)]
        status: Option<BackupStatus>,

        /// Only backups of this job
        #[arg(short, long)]
        job: Option<String>,
    },

    /// Delete one backup regardless of its age
    Purge {
        /// Backup id
        #[arg(long)]
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Drop the registry entry of a deleted or failed backup
    Forget {
        /// Backup id
        #[arg(long)]
        id: String,
    },

    /// Validate configuration file
    Validate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    if let Commands::Validate = cli.command {
        logging::init_console_logging();
        let jobs = config::resolve_all_jobs(&config)?;
        println!("Configuration is valid!");
        println!("Jobs: {}", jobs.len());
        let mut names: Vec<_> = jobs.keys().collect();
        names.sort();
        for name in names {
            let job = &jobs[name];
            println!(
                "  {} ({}, {}, {}, retention {} days)",
                name, job.kind, job.frequency, job.storage_provider, job.retention_days
            );
        }
        return Ok(());
    }

    // Setup logging with file rotation (must keep guard alive)
    let logging_config = LoggingConfig::from_global(&config.global);
    let _log_guard = logging::init_logging(&logging_config)?;

    let engine = BackupEngine::from_config(&config, Collaborators::default())?;
    let cancel = CancelToken::new();

    match cli.command {
        Commands::Backup { job } => {
            println!("Running backup job: {}", job);
            let record = engine.run_job(&job)?;
            println!("✓ Backup {} is {}", record.id, record.status);
            print_record(&record);
        }

        Commands::BackupAll => {
            println!("Running all configured jobs...");
            let outcomes = engine.backup_all(&cancel);
            let mut failed = 0;
            for (name, outcome) in &outcomes {
                match outcome {
                    Ok(record) => println!("  ✓ {}: {} ({})", name, record.id, record.status),
                    Err(e) => {
                        failed += 1;
                        println!("  ✗ {}: {}", name, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} jobs failed", failed, outcomes.len());
            }
            println!("✓ All {} jobs completed", outcomes.len());
        }

        Commands::Restore {
            id,
            verify_only,
            target,
            database_url,
            yes,
        } => {
            use dialoguer::Confirm;

            let record = engine.get(&id)?;
            let mode = if verify_only {
                RestoreMode::VerifyOnly
            } else {
                RestoreMode::Full
            };

            if mode == RestoreMode::Full && record.kind.is_destructive_restore() && !yes {
                println!(
                    "⚠️  Restoring {} backup {} overwrites the current {}.",
                    record.kind,
                    record.id,
                    if record.kind == BackupKind::Database { "database" } else { "user data" }
                );
                let confirmed = Confirm::new()
                    .with_prompt("Proceed with restore?")
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("Restore cancelled");
                    return Ok(());
                }
            }

            let options = RestoreOptions {
                mode,
                target_dir: target,
                database_url,
            };
            let result = engine.restore_with(&id, &options, &cancel)?;
            match result.mode {
                RestoreMode::VerifyOnly => println!("✓ Backup {} verified: {}", id, result.raw_checksum),
                RestoreMode::Full => println!(
                    "✓ Backup {} restored in {}",
                    id,
                    format_duration(result.duration.as_secs())
                ),
            }
            if let Some(sum) = result.pre_restore_checksum {
                println!("  State before restore: {}", sum);
            }
        }

        Commands::Verify { id } => {
            let result = engine.verify_integrity_with(&id, &cancel)?;
            if result.is_intact() {
                println!("✓ Backup {} is intact ({})", id, result.actual);
            } else {
                println!("✗ Backup {} is CORRUPTED", id);
                println!("  Expected: {}", result.expected);
                println!("  Actual:   {}", result.actual);
                std::process::exit(2);
            }
        }

        Commands::Sweep {
            kind,
            frequency,
            retention_days,
        } => {
            let days = retention_days.unwrap_or_else(|| engine.default_retention_days(frequency));
            println!("Sweeping {} {} backups older than {} days...", frequency, kind, days);
            let result = engine.sweep_with(kind, frequency, days, &cancel)?;
            for id in &result.deleted {
                println!("  ✓ deleted {}", id);
            }
            for (id, cause) in &result.failed {
                println!("  ✗ kept {}: {}", id, cause);
            }
            println!(
                "Deleted {}, failed {}, retained {}",
                result.deleted.len(),
                result.failed.len(),
                result.retained
            );
            if !result.is_clean() {
                bail!("{} backups could not be deleted", result.failed.len());
            }
        }

        Commands::List { kind, status, job } => {
            let mut filter = RecordFilter::new();
            if let Some(kind) = kind {
                filter = filter.kind(kind);
            }
            if let Some(status) = status {
                filter = filter.status(status);
            }
            if let Some(job) = job {
                filter = filter.job_name(job);
            }

            let records = engine.list(&filter)?;
            if records.is_empty() {
                println!("No backups found");
            }
            for record in &records {
                println!(
                    "{:<48} {:<10} {:<16} {:>12}  {}",
                    record.id,
                    record.status.to_string(),
                    record.kind.to_string(),
                    record.size_bytes,
                    record.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::Purge { id, yes } => {
            use dialoguer::Confirm;

            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!("Permanently delete backup {}?", id))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("Purge cancelled");
                    return Ok(());
                }
            }
            let record = engine.purge(&id)?;
            println!("✓ Backup {} is {}", record.id, record.status);
        }

        Commands::Forget { id } => {
            let record = engine.forget(&id)?;
            println!("✓ Forgot {} backup {}", record.status, record.id);
        }

        // Handled before logging is set up
        Commands::Validate => {}
    }

    Ok(())
}

fn print_record(record: &BackupRecord) {
    if let Some(uri) = &record.location_uri {
        println!("  Location: {}", uri);
    }
    if let Some(checksum) = &record.checksum {
        println!("  Checksum: {}", checksum);
    }
    println!("  Size:     {} bytes", record.size_bytes);
    println!("  Duration: {}", format_duration(record.duration_seconds as u64));
}
