use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use stocksync::batch;
use stocksync::config::{self, Config};
use stocksync::db;
use stocksync::discovery::{self, DiscoveryConfig};
use stocksync::model::JobKind;
use stocksync::store::StoreClient;
use stocksync::sync::{self, RetryPolicy, SyncContext};
use stocksync::warehouse::WarehouseClient;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the sync worker pool (and periodic discovery when configured)
    Run,
    /// Queue a batch of sync jobs for the given store product ids
    Batch {
        /// inventory, price or all
        #[arg(long, default_value = "all")]
        kind: String,
        /// Override the default location for inventory jobs
        #[arg(long)]
        location: Option<String>,
        /// Store product ids
        ids: Vec<String>,
    },
    /// Show aggregate progress for a batch
    Status { batch_id: String },
    /// Run one product discovery pass
    Discover,
    /// List all product mappings
    Mappings,
    /// Show the most recent audit events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

struct Services {
    pool: db::Pool,
    warehouse: WarehouseClient,
    store: StoreClient,
    ctx: SyncContext,
    policy: RetryPolicy,
}

async fn init(cfg: &Config) -> Result<Services> {
    cfg.ensure_dirs()?;
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/stocksync.db?mode=rwc", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let timeout = Duration::from_secs(cfg.app.http_timeout_seconds);
    let warehouse = WarehouseClient::new(
        Url::parse(&cfg.warehouse.api_base).context("invalid warehouse.api_base")?,
        cfg.warehouse.api_key.clone(),
        timeout,
    );
    let store = StoreClient::new(
        Url::parse(&cfg.store.api_base).context("invalid store.api_base")?,
        cfg.store.token.clone(),
        timeout,
    );
    let ctx = SyncContext {
        default_location_id: cfg.store.default_location_id.clone(),
        actor: "system".to_string(),
    };
    let policy = RetryPolicy::with_cap(cfg.app.max_backoff_seconds as i64);
    Ok(Services {
        pool,
        warehouse,
        store,
        ctx,
        policy,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;

    match args.command {
        Command::Run => run(&cfg).await,
        Command::Batch {
            kind,
            location,
            ids,
        } => {
            let kind = JobKind::parse(&kind)
                .with_context(|| format!("unknown job kind '{kind}' (inventory|price|all)"))?;
            let svc = init(&cfg).await?;
            let launch = batch::start_batch(
                &svc.pool,
                &ids,
                kind,
                location.as_deref(),
                &svc.policy,
                &svc.ctx.actor,
            )
            .await?;
            println!("batch {}", launch.batch_id);
            for job in &launch.queued {
                println!(
                    "  queued job {} store={} warehouse={}",
                    job.job_id, job.store_product_id, job.warehouse_product_id
                );
            }
            for (id, reason) in &launch.failures {
                println!("  failed {id}: {reason}");
            }
            Ok(())
        }
        Command::Status { batch_id } => {
            let svc = init(&cfg).await?;
            let status = batch::batch_status(&svc.pool, &batch_id).await?;
            let s = &status.stats;
            println!(
                "batch {batch_id}: total={} completed={} failed={} waiting={} active={} progress={:.1}%",
                s.total, s.completed, s.failed, s.waiting, s.active, s.progress
            );
            for job in &status.jobs {
                println!(
                    "  job {} [{}] {} -> {} ({})",
                    job.id,
                    job.kind.as_str(),
                    job.warehouse_product_id,
                    job.store_product_id,
                    job.state.as_str()
                );
            }
            Ok(())
        }
        Command::Discover => {
            let svc = init(&cfg).await?;
            let dcfg = DiscoveryConfig {
                window_days: cfg.warehouse.discover_window_days,
                vendor_tag: cfg.store.vendor_tag.clone(),
                actor: svc.ctx.actor.clone(),
            };
            let count = discovery::discover(&svc.pool, &svc.warehouse, &svc.store, &dcfg).await?;
            println!("discovered {count} products");
            Ok(())
        }
        Command::Mappings => {
            let svc = init(&cfg).await?;
            for m in db::list_mappings(&svc.pool).await? {
                println!(
                    "{} -> {} [{}]{}",
                    m.store_product_id,
                    m.warehouse_product_id().unwrap_or("?"),
                    m.status.as_str(),
                    m.last_error
                        .as_deref()
                        .map(|e| format!(" last_error: {e}"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Events { limit } => {
            let svc = init(&cfg).await?;
            for e in db::list_recent_events(&svc.pool, limit).await? {
                println!(
                    "{} [{}] {} {}{}",
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                    e.status.as_str(),
                    e.action.as_str(),
                    e.message,
                    e.mapping_id
                        .map(|id| format!(" (mapping {id})"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

async fn run(cfg: &Config) -> Result<()> {
    let svc = Arc::new(init(cfg).await?);
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    // Worker pool: each worker claims jobs independently; the claim is
    // atomic in SQL so two workers never share one job.
    let mut handles = Vec::new();
    for worker_id in 0..cfg.app.workers {
        let svc = Arc::clone(&svc);
        handles.push(tokio::spawn(async move {
            loop {
                let res = sync::process_next_job(
                    &svc.pool,
                    &svc.warehouse,
                    &svc.store,
                    &svc.ctx,
                    &svc.policy,
                )
                .await;
                match res {
                    Ok(processed) => {
                        if !processed {
                            tokio::time::sleep(poll_sleep).await;
                        }
                    }
                    Err(err) => {
                        error!(worker_id, ?err, "sync worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
    }

    if cfg.app.discover_interval_minutes > 0 {
        let svc = Arc::clone(&svc);
        let dcfg = DiscoveryConfig {
            window_days: cfg.warehouse.discover_window_days,
            vendor_tag: cfg.store.vendor_tag.clone(),
            actor: svc.ctx.actor.clone(),
        };
        let interval = Duration::from_secs(cfg.app.discover_interval_minutes * 60);
        handles.push(tokio::spawn(async move {
            loop {
                match discovery::discover(&svc.pool, &svc.warehouse, &svc.store, &dcfg).await {
                    Ok(count) => info!(count, "periodic discovery pass finished"),
                    Err(err) => error!(?err, "periodic discovery failed"),
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    info!(workers = cfg.app.workers, "stocksync running");
    futures::future::join_all(handles).await;
    Ok(())
}
