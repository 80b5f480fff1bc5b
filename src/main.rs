// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use dedupe_lib::config::{DedupConfig, OllamaConfig};
use dedupe_lib::cost::{CostTracker, LogCostTracker, PgCostTracker};
use dedupe_lib::db::{DedupStore, PgDedupStore};
use dedupe_lib::models::{businesses_checksum, BusinessId};
use dedupe_lib::orchestrator::DedupOrchestrator;
use dedupe_lib::utils::db_connect::{connect, get_pool_status};
use dedupe_lib::utils::env::init_env_and_logging;
use dedupe_lib::utils::get_memory_usage;
use dedupe_lib::utils::progress_config::ProgressConfig;
use dedupe_lib::verification::{DuplicateVerifier, OllamaBackend};

#[derive(Parser)]
#[command(author, version, about = "Nightly duplicate detection and merge pass over scraped businesses", long_about = None)]
struct DedupeArgs {
    /// Plan merges and escalations without committing anything
    #[arg(long)]
    dry_run: bool,

    /// Stop after this many candidate pairs
    #[arg(long)]
    limit: Option<usize>,

    /// Similarity pre-filter threshold
    #[arg(long)]
    threshold: Option<f64>,

    /// Only reprocess pairs touching this business id (repeatable)
    #[arg(long = "business-id")]
    business_ids: Vec<i64>,

    /// Only consider businesses scraped in this batch
    #[arg(long)]
    run_scope: Option<String>,
}

fn apply_args(config: &mut DedupConfig, args: &DedupeArgs) {
    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(limit) = args.limit {
        config.max_pairs = Some(limit);
    }
    if let Some(threshold) = args.threshold {
        config.candidates.threshold = threshold;
    }
    if !args.business_ids.is_empty() {
        config.business_ids = args.business_ids.iter().copied().map(BusinessId).collect();
    }
    if let Some(scope) = &args.run_scope {
        config.run_scope = Some(scope.clone());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env_and_logging();
    info!("Starting business deduplication pass");

    let args = DedupeArgs::parse();
    let mut config = DedupConfig::from_env().context("Invalid dedup configuration")?;
    apply_args(&mut config, &args);
    config.validate().context("Invalid dedup configuration")?;
    config.log_config();

    let progress = ProgressConfig::from_env();
    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    let store = Arc::new(PgDedupStore::new(
        pool.clone(),
        config.merge.dependent_tables.clone(),
    )?);

    let backend = OllamaBackend::new(OllamaConfig::from_env())?;
    if let Err(e) = backend.check_available().await {
        warn!(
            "Verifier backend is not reachable ({:#}); pairs will be escalated as verification_failed",
            e
        );
    }
    let cost_tracker: Arc<dyn CostTracker> = if config.dry_run {
        Arc::new(LogCostTracker)
    } else {
        Arc::new(PgCostTracker::new(pool.clone()))
    };
    let verifier = Arc::new(DuplicateVerifier::new(
        backend,
        config.verifier.clone(),
        cost_tracker,
    ));

    let orchestrator = DedupOrchestrator::new(store.clone(), verifier, config.clone())
        .with_progress(progress.clone());

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; stopping after the current pair");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let checksum_before = if config.dry_run {
        let businesses = store.fetch_all_businesses().await?;
        let checksum = businesses_checksum(&businesses);
        info!("Businesses checksum before dry run: {}", checksum);
        Some(checksum)
    } else {
        None
    };

    let run_id = Uuid::new_v4().to_string();
    let summary = orchestrator.run(&run_id, &cancel).await?;

    match checksum_before {
        Some(before) => {
            let after = businesses_checksum(&store.fetch_all_businesses().await?);
            if before == after {
                info!("Businesses checksum after dry run: {} (unchanged)", after);
            } else {
                warn!(
                    "Businesses changed during dry run ({} -> {}); another writer was active",
                    before, after
                );
            }
        }
        None => {
            let dangling = store
                .find_inactive_references()
                .await
                .context("Integrity scan failed")?;
            if dangling.is_empty() {
                info!("Integrity scan passed: no references to merged businesses");
            } else {
                for d in &dangling {
                    warn!(
                        "Integrity scan: {} row(s) in {}.{} still reference inactive business {}",
                        d.rows, d.table, d.column, d.business_id
                    );
                }
            }
        }
    }

    if progress.should_show_memory() {
        info!("Memory usage: {} MB", get_memory_usage().await);
    }
    if progress.should_show_db_connection_stats() {
        let (total, idle, in_use) = get_pool_status(&pool);
        info!(
            "DB pool: {} connections ({} idle, {} in use)",
            total, idle, in_use
        );
    }

    info!(
        "Deduplication run {} finished: {} merged, {} escalated, {} errors",
        summary.run_id,
        if summary.dry_run { summary.would_merge } else { summary.merged },
        summary.escalated,
        summary.errors
    );
    Ok(())
}
