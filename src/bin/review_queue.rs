// src/bin/review_queue.rs
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::sync::Arc;

use dedupe_lib::config::MergeConfig;
use dedupe_lib::db::{DedupStore, PgDedupStore};
use dedupe_lib::merge::MergeEngine;
use dedupe_lib::models::{ReviewItem, ReviewStatus};
use dedupe_lib::review::ReviewQueue;
use dedupe_lib::utils::db_connect::connect;
use dedupe_lib::utils::env::init_env_and_logging;

#[derive(Parser)]
#[command(author, version, about = "Inspect and resolve deduplication review items", long_about = None)]
struct ReviewArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List open review items, most similar first
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one review item with both businesses
    Show { id: String },
    /// Resolve an open review item
    Resolve {
        id: String,

        /// `merge` merges the pair without re-verification; `distinct` keeps
        /// both and excludes the pair from future runs
        #[arg(long = "as", value_enum)]
        resolution: Resolution,

        #[arg(long)]
        reviewer: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Resolution {
    Merge,
    Distinct,
}

impl Resolution {
    fn status(self) -> ReviewStatus {
        match self {
            Resolution::Merge => ReviewStatus::ResolvedMerge,
            Resolution::Distinct => ReviewStatus::ResolvedDistinct,
        }
    }
}

fn print_summary_line(item: &ReviewItem) {
    println!(
        "{}  ({}, {})  score {:.3}  {}  {}",
        item.id,
        item.pair.0,
        item.pair.1,
        item.similarity_score,
        item.reason.as_str(),
        item.updated_at.format("%Y-%m-%d %H:%M")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env_and_logging();
    let args = ReviewArgs::parse();

    let merge_config = MergeConfig::from_env().context("Invalid merge configuration")?;
    let pool = connect().await.context("Failed to connect to database")?;
    let store = Arc::new(PgDedupStore::new(pool, merge_config.dependent_tables.clone())?);
    let queue = ReviewQueue::new(store.clone());

    match args.command {
        Command::List { limit } => {
            let items = queue.list_open(Some(limit)).await?;
            if items.is_empty() {
                println!("No open review items.");
            }
            for item in &items {
                print_summary_line(item);
            }
        }
        Command::Show { id } => {
            let item = queue
                .get(&id)
                .await?
                .ok_or_else(|| anyhow!("review item {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&item)?);
            for business_id in [item.pair.0, item.pair.1] {
                match store.fetch_business(business_id).await? {
                    Some(business) => println!("{}", serde_json::to_string_pretty(&business)?),
                    None => println!("business {} no longer exists", business_id),
                }
            }
        }
        Command::Resolve {
            id,
            resolution,
            reviewer,
            notes,
        } => {
            let engine = MergeEngine::new(store.clone(), merge_config);
            let resolved = queue
                .resolve(
                    &id,
                    resolution.status(),
                    reviewer.as_deref(),
                    notes.as_deref(),
                    &engine,
                )
                .await?;
            info!("Resolved review item {}", resolved.item.id);
            print_summary_line(&resolved.item);
            if let Some(record) = resolved.merge {
                println!(
                    "Merged {} into {} (filled: {}; overridden: {})",
                    record.merged_business_id,
                    record.primary_business_id,
                    record.filled_fields.join(", "),
                    record.overridden_conflicts.len()
                );
            }
        }
    }
    Ok(())
}
