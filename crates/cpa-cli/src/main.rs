use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use cpa_core::{parse_date, DateRange};
use cpa_storage::PostgresRepository;
use cpa_sync::{SyncConfig, SyncPipeline};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cpa-cli")]
#[command(about = "Campaign CPA sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process an inclusive date range once.
    Run {
        /// First day to process (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        start_date: NaiveDate,
        /// Last day to process (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        end_date: NaiveDate,
        /// Use a throwaway in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Create the daily_stats tables if missing.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Schedule) {
        Commands::Run {
            start_date,
            end_date,
            dry_run,
        } => {
            // Rejected before logging or storage are touched.
            let range = DateRange::new(start_date, end_date).unwrap_or_else(|err| {
                Cli::command()
                    .error(ErrorKind::ArgumentConflict, err)
                    .exit()
            });
            let _log_guard = init_tracing(&config.log_dir)?;

            let pipeline = if dry_run {
                SyncPipeline::dry_run(config)
            } else {
                SyncPipeline::connect(config).await?
            };
            let run = pipeline.run_range(range).await?;
            println!("{}", run.summary_line());
            if let Some(path) = &run.report_path {
                println!("report: {path}");
            }
        }
        Commands::Schedule => {
            let _log_guard = init_tracing(&config.log_dir)?;
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            pipeline.run_scheduler_until_shutdown().await?;
        }
        Commands::Migrate => {
            let _log_guard = init_tracing(&config.log_dir)?;
            PostgresRepository::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?;
            println!("schema ready: daily_stats, daily_stats_batches");
        }
    }

    Ok(())
}

/// Console output plus a daily-rolling log file; the returned guard flushes the file on drop.
fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "cpa-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init()
        .context("initializing tracing")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_iso_dates() {
        let cli = Cli::try_parse_from([
            "cpa-cli",
            "run",
            "--start-date",
            "2025-06-04",
            "--end-date",
            "2025-06-06",
            "--dry-run",
        ])
        .expect("valid args");
        match cli.command {
            Some(Commands::Run {
                start_date,
                end_date,
                dry_run,
            }) => {
                assert_eq!(start_date, parse_date("2025-06-04").unwrap());
                assert_eq!(end_date, parse_date("2025-06-06").unwrap());
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_rejects_malformed_dates() {
        let err = Cli::try_parse_from([
            "cpa-cli",
            "run",
            "--start-date",
            "06/04/2025",
            "--end-date",
            "2025-06-06",
        ])
        .expect_err("malformed date");
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn bare_invocation_defaults_to_schedule() {
        let cli = Cli::try_parse_from(["cpa-cli"]).expect("no args");
        assert!(cli.command.is_none());
    }
}
