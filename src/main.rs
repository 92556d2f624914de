use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use restock_waitlist::{config, db, Engine};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run the notification drain and expiration sweep workers")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let engine = Arc::new(Engine::from_config(pool, &cfg)?);

    // Sweeper worker
    let sweeper = engine.clone();
    let sweep_every = Duration::from_secs(cfg.sweeper.interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            match sweeper.sweep_expired(Utc::now()).await {
                Ok(report) => info!(?report, "sweep complete"),
                Err(err) => error!(?err, "sweep failed"),
            }
        }
    });

    // Drain worker: keep draining while full batches come back, else sleep.
    let poll_sleep = Duration::from_millis(cfg.queue.poll_interval_ms);
    let batch_size = cfg.queue.batch_size as usize;
    info!(site = %cfg.app.site_name, "starting notification worker");
    loop {
        match engine.queue().drain(Utc::now()).await {
            Ok(report) => {
                if report.attempted < batch_size {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "notification drain error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
