use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use restock_waitlist::outbox::DrainReport;
use restock_waitlist::{config, db, Engine};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deliver all due notifications, optionally run one expiration sweep, and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also run one expiration sweep before draining
    #[arg(long)]
    sweep: bool,

    /// Stop after this many drain passes even if due jobs remain
    #[arg(long, default_value = "1000")]
    max_passes: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let engine = Engine::from_config(pool, &cfg)?;

    if args.sweep {
        let report = engine.sweep_expired(Utc::now()).await?;
        info!(?report, "sweep complete");
    }

    let mut total = DrainReport::default();
    let mut passes = 0;
    loop {
        if passes >= args.max_passes {
            warn!(passes, "pass limit reached with jobs still due");
            break;
        }
        let report = engine.queue().drain(Utc::now()).await?;
        passes += 1;
        if report.attempted == 0 {
            break;
        }
        total.released += report.released;
        total.attempted += report.attempted;
        total.sent += report.sent;
        total.retried += report.retried;
        total.failed += report.failed;
        total.skipped += report.skipped;
    }

    let stats = engine.queue_stats().await?;
    info!(
        attempted = total.attempted,
        sent = total.sent,
        retried = total.retried,
        failed = total.failed,
        ?stats,
        "drain complete"
    );
    Ok(())
}
