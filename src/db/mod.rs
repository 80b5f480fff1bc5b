// src/db/mod.rs
//! Persistence seam of the engine. `postgres` is the production store,
//! `memory` backs the test suite.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{
    Business, BusinessId, DedupRunSummary, FieldConflict, MergeOutcome, MergePlan, MergeRecord,
    NewReviewItem, PairKey, ReferenceRewrite, ReviewItem, ReviewStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgDedupStore;

/// Rows of a dependent table still pointing at an inactive business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanglingReference {
    pub table: String,
    pub column: String,
    pub business_id: BusinessId,
    pub rows: u64,
}

/// A planned merge and its audit entry, or the conflicts that forbid it.
pub type PlannedMerge = std::result::Result<(MergePlan, MergeRecord), Vec<FieldConflict>>;

/// Builds a merge from the two businesses as they stand under the row lock.
pub type MergePlanner<'a> = dyn Fn(&Business, &Business) -> PlannedMerge + Send + Sync + 'a;

/// Reviewer and notes written onto the merged pair's own open review item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReview {
    pub reviewer_id: Option<String>,
    pub notes: Option<String>,
}

pub fn superseded_note(secondary: BusinessId, primary: BusinessId) -> String {
    format!("business {} was merged into {}", secondary, primary)
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Active businesses, optionally limited to one scrape batch.
    async fn fetch_active_businesses(&self, run_scope: Option<&str>) -> Result<Vec<Business>>;

    /// Every business row, active or not. Used for checksums.
    async fn fetch_all_businesses(&self) -> Result<Vec<Business>>;

    async fn fetch_business(&self, id: BusinessId) -> Result<Option<Business>>;

    /// Pairs an operator resolved as distinct; never offered again.
    async fn fetch_distinct_pairs(&self) -> Result<HashSet<PairKey>>;

    /// Rows per dependent table that reference `id`. Read-only, used by dry runs.
    async fn count_references(&self, id: BusinessId) -> Result<Vec<ReferenceRewrite>>;

    /// Merges `first` and `second` in one transaction. Both rows are locked
    /// and re-read, `planner` runs on them, then: update of the primary,
    /// reference rewrite, deactivation of the secondary, audit insert, and
    /// review bookkeeping. The pair's own open item becomes `resolved_merge`
    /// with `review`; every other open item naming the secondary becomes
    /// `superseded`.
    ///
    /// Fails without side effects if either business is missing or inactive.
    /// Returns `Conflict` (nothing written) when the planner refuses, else
    /// `Merged` with `rewritten_references` filled in.
    async fn apply_merge(
        &self,
        first: BusinessId,
        second: BusinessId,
        planner: &MergePlanner<'_>,
        review: &MergeReview,
    ) -> Result<MergeOutcome>;

    async fn fetch_merge_records(&self, business_id: BusinessId) -> Result<Vec<MergeRecord>>;

    /// Integrity scan: dependent rows that still point at inactive businesses.
    async fn find_inactive_references(&self) -> Result<Vec<DanglingReference>>;

    /// Inserts or refreshes the item for `item.pair`. Resolved items are
    /// returned unchanged.
    async fn upsert_review_item(&self, item: &NewReviewItem) -> Result<ReviewItem>;

    async fn fetch_review_item(&self, id: &str) -> Result<Option<ReviewItem>>;

    async fn fetch_review_item_for_pair(&self, pair: PairKey) -> Result<Option<ReviewItem>>;

    /// Open items, most similar first.
    async fn fetch_open_review_items(&self, limit: Option<usize>) -> Result<Vec<ReviewItem>>;

    async fn set_review_status(
        &self,
        id: &str,
        status: ReviewStatus,
        reviewer_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<ReviewItem>;

    async fn record_run_start(&self, run_id: &str, description: &str, dry_run: bool) -> Result<()>;

    async fn record_run_finish(&self, summary: &DedupRunSummary) -> Result<()>;
}
