use anyhow::Result;
use clap::{Parser, Subcommand};
use siap_core::SyncUnit;
use siap_storage::SchedulePatch;
use siap_sync::{StatusFilter, SyncConfig, SyncOptions};

#[derive(Debug, Parser)]
#[command(name = "siap-cli")]
#[command(about = "SIAP procurement-data archiver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one (dataset, period) unit, re-invoking until complete.
    Sync {
        dataset_id: String,
        period: String,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long, default_value_t = 10)]
        max_pages: usize,
    },
    /// Report sync state for all units, cross-checked against storage.
    Status {
        #[arg(long)]
        dataset_id: Option<String>,
        #[arg(long)]
        period: Option<String>,
        /// Skip storage cross-checks and report raw persisted state.
        #[arg(long)]
        no_verify: bool,
    },
    /// Show or patch the automatic-sync schedule.
    Schedule {
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        disable: bool,
        /// `daily` or `weekly`.
        #[arg(long)]
        cadence: Option<String>,
        /// Replace the dataset allow-list (repeatable).
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// Serve the JSON API (and the scheduler, when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            dataset_id,
            period,
            batch_size,
            max_pages,
        } => {
            let engine = siap_sync::build_engine(&SyncConfig::from_env())?;
            let unit = SyncUnit::new(dataset_id, period);
            let opts = SyncOptions {
                batch_size,
                max_pages,
            };

            loop {
                let report = engine.sync_unit(&unit, &opts).await?;
                println!(
                    "{}: new={} duplicates={} total={} complete={}",
                    unit,
                    report.new_records,
                    report.duplicates_skipped,
                    report.total_records,
                    report.is_complete
                );
                if let Some(error) = &report.error {
                    eprintln!("interrupted, resumable from stored cursor: {error}");
                    std::process::exit(1);
                }
                if report.is_complete {
                    if let Some(verification) = &report.verification {
                        println!("verification: {verification:?}");
                    }
                    break;
                }
            }
        }
        Commands::Status {
            dataset_id,
            period,
            no_verify,
        } => {
            let engine = siap_sync::build_engine(&SyncConfig::from_env())?;
            let filter = StatusFilter { dataset_id, period };
            for status in engine.list_status(&filter, !no_verify).await? {
                println!("{} ({})", status.dataset_id, status.label);
                for p in &status.periods {
                    println!(
                        "  {}: records={} cursor={:?} file_exists={}",
                        p.period, p.state.total_records, p.state.last_cursor, p.file_exists
                    );
                }
            }
        }
        Commands::Schedule {
            enable,
            disable,
            cadence,
            allow,
        } => {
            let engine = siap_sync::build_engine(&SyncConfig::from_env())?;
            let patch = SchedulePatch {
                enabled: match (enable, disable) {
                    (true, false) => Some(true),
                    (false, true) => Some(false),
                    _ => None,
                },
                cadence: match cadence.as_deref() {
                    Some("daily") => Some(siap_core::ScheduleCadence::Daily),
                    Some("weekly") => Some(siap_core::ScheduleCadence::Weekly),
                    Some(other) => anyhow::bail!("unknown cadence {other}, expected daily|weekly"),
                    None => None,
                },
                dataset_allow_list: if allow.is_empty() { None } else { Some(allow) },
            };
            let schedule = engine.state_store().update_schedule(patch).await?;
            println!(
                "enabled={} cadence={:?} last_run={:?} allow={:?}",
                schedule.enabled, schedule.cadence, schedule.last_run, schedule.dataset_allow_list
            );
        }
        Commands::Serve => {
            siap_web::serve_from_env().await?;
        }
    }

    Ok(())
}
