// src/cost.rs
//! Sink for per-call verification cost. Cost tracking belongs to the wider
//! pipeline; the engine only reports into it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;

use crate::utils::db_connect::PgPool;

pub const VERIFICATION_COST_CATEGORY: &str = "dedup_verification";

#[async_trait]
pub trait CostTracker: Send + Sync {
    async fn record_cost(&self, amount: f64, category: &str) -> Result<()>;
}

/// Writes costs to the log only. Used for dry runs and local backends.
#[derive(Debug, Default, Clone)]
pub struct LogCostTracker;

#[async_trait]
impl CostTracker for LogCostTracker {
    async fn record_cost(&self, amount: f64, category: &str) -> Result<()> {
        info!("💰 Cost recorded: {:.6} ({})", amount, category);
        Ok(())
    }
}

/// Appends one row per call to `dedup.api_costs`.
#[derive(Clone)]
pub struct PgCostTracker {
    pool: PgPool,
}

impl PgCostTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CostTracker for PgCostTracker {
    async fn record_cost(&self, amount: f64, category: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for record_cost")?;
        conn.execute(
            "INSERT INTO dedup.api_costs (category, amount, recorded_at) VALUES ($1, $2, CURRENT_TIMESTAMP)",
            &[&category, &amount],
        )
        .await
        .context("Failed to insert api_costs row")?;
        Ok(())
    }
}
