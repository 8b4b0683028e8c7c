use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;
use wxsync_storage::StoreKind;
use wxsync_sync::{ReconcileReport, SyncConfig, SyncRuntime};

#[derive(Debug, Parser)]
#[command(name = "wxsync")]
#[command(about = "Daily temperature archive reconciler")]
struct Cli {
    /// Store to reconcile against; overrides WXSYNC_TARGET.
    #[arg(long, global = true)]
    target: Option<StoreKind>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and store the dates missing from the target store.
    Sync {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Fetch every date of a contiguous range, overwriting stored records.
    Populate {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Move non-midnight timestamps to midnight of their date.
    Correlate,
    /// Delete same-date duplicate records.
    Dedup,
    /// Copy dates missing in one store from the other.
    Mirror {
        #[arg(long, default_value = "relational")]
        from: StoreKind,
        #[arg(long, default_value = "document")]
        to: StoreKind,
    },
    /// List records outside seasonal temperature bounds.
    Anomalies,
    Migrate,
    /// Run `sync` on WXSYNC_SYNC_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    // RUST_LOG wins over WXSYNC_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("WXSYNC_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .compact()
        .init();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight dates");
            token.cancel();
        }
    });
    cancel
}

fn print_run(report: &ReconcileReport, reports_dir: &std::path::Path) {
    println!(
        "{} complete: run_id={} range={} succeeded={} failed={} skipped={} written={} replaced={} failed_chunks={} reports={}",
        report.mode,
        report.run_id,
        report.range,
        report.succeeded.len(),
        report.dates_failed(),
        report.skipped.len(),
        report.records_written,
        report.replaced,
        report.failed_chunks.len(),
        reports_dir.display()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(target) = cli.target {
        config.target = target;
    }
    let command = cli.command.unwrap_or(Commands::Sync {
        from: None,
        to: None,
    });
    if matches!(command, Commands::Schedule) {
        config.scheduler_enabled = true;
    }

    let runtime = Arc::new(SyncRuntime::connect(config).await?);
    let cancel = cancel_on_ctrl_c();

    match command {
        Commands::Sync { from, to } => {
            let (report, dir) = runtime.sync(from, to, &cancel).await?;
            print_run(&report, &dir);
        }
        Commands::Populate { from, to } => match runtime.populate(from, to, &cancel).await? {
            Some((report, dir)) => print_run(&report, &dir),
            None => println!("populate: store already up to date"),
        },
        Commands::Correlate => {
            let report = runtime.correlate().await?;
            println!(
                "correlate complete: store={} scanned={} normalized={} failed_chunks={}",
                report.store,
                report.scanned,
                report.normalized,
                report.failed_chunks.len()
            );
        }
        Commands::Dedup => {
            let report = runtime.dedup().await?;
            println!(
                "dedup complete: store={} scanned={} non_midnight={} deleted={} failed_chunks={}",
                report.store,
                report.scanned,
                report.non_midnight,
                report.deleted,
                report.failed_chunks.len()
            );
        }
        Commands::Mirror { from, to } => {
            let (report, state) = runtime.mirror(from, to).await?;
            println!(
                "mirror complete: {} -> {} source_records={} copied={} failed_chunks={} latest={:?}",
                report.source,
                report.target,
                report.source_records,
                report.copied,
                report.failed_chunks.len(),
                state.latest_by_store
            );
        }
        Commands::Anomalies => {
            let anomalies = runtime.anomalies().await?;
            for a in &anomalies {
                println!(
                    "{} {:?}: min={:.1} max={:.1} outside [{}, {}]",
                    a.date, a.season, a.min, a.max, a.lower, a.upper
                );
            }
            println!("anomalies: {}", anomalies.len());
        }
        Commands::Migrate => {
            runtime.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let cron = runtime.config().sync_cron.clone();
            let mut sched = Arc::clone(&runtime)
                .maybe_build_scheduler(cancel.clone())
                .await?
                .context("scheduler disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            cancel.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
