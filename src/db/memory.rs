// src/db/memory.rs
//! In-process `DedupStore`. Transactions work on a copy of the state that
//! replaces the original only when every step succeeded.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{default_dependent_tables, DependentTable};
use crate::db::{superseded_note, DanglingReference, DedupStore, MergePlanner, MergeReview};
use crate::models::{
    Business, BusinessId, BusinessStatus, DedupRunSummary, MergeOutcome, MergeRecord,
    NewReviewItem, PairKey, ReferenceRewrite, ReviewItem, ReviewStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub description: String,
    pub dry_run: bool,
    pub summary: Option<DedupRunSummary>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    businesses: BTreeMap<BusinessId, Business>,
    /// "table.column" -> one entry per dependent row
    dependents: BTreeMap<String, Vec<BusinessId>>,
    merge_records: Vec<MergeRecord>,
    review_items: BTreeMap<PairKey, ReviewItem>,
    runs: BTreeMap<String, RunRow>,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    dependent_tables: Vec<DependentTable>,
    failing_merges: AtomicUsize,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(default_dependent_tables())
    }
}

fn table_key(table: &DependentTable) -> String {
    format!("{}.{}", table.table, table.column)
}

impl MemoryStore {
    pub fn new(dependent_tables: Vec<DependentTable>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            dependent_tables,
            failing_merges: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("database unavailable");
        }
        Ok(())
    }

    fn dependent_table(&self, table: &str) -> Result<&DependentTable> {
        self.dependent_tables
            .iter()
            .find(|t| t.table == table)
            .ok_or_else(|| anyhow!("'{}' is not a dependent table", table))
    }

    pub async fn insert_business(&self, business: Business) {
        let mut state = self.state.lock().await;
        state.businesses.insert(business.id, business);
    }

    /// Adds one row to a dependent table pointing at `business_id`.
    pub async fn add_reference(&self, table: &str, business_id: BusinessId) -> Result<()> {
        let key = table_key(self.dependent_table(table)?);
        let mut state = self.state.lock().await;
        state.dependents.entry(key).or_default().push(business_id);
        Ok(())
    }

    pub async fn references(&self, table: &str) -> Result<Vec<BusinessId>> {
        let key = table_key(self.dependent_table(table)?);
        let state = self.state.lock().await;
        Ok(state.dependents.get(&key).cloned().unwrap_or_default())
    }

    pub async fn merge_records(&self) -> Vec<MergeRecord> {
        self.state.lock().await.merge_records.clone()
    }

    pub async fn review_items(&self) -> Vec<ReviewItem> {
        self.state.lock().await.review_items.values().cloned().collect()
    }

    pub async fn run(&self, run_id: &str) -> Option<RunRow> {
        self.state.lock().await.runs.get(run_id).cloned()
    }

    /// The next `n` merge transactions fail after rewriting references.
    pub fn fail_next_merges(&self, n: usize) {
        self.failing_merges.store(n, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_merges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn fetch_active_businesses(&self, run_scope: Option<&str>) -> Result<Vec<Business>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .businesses
            .values()
            .filter(|b| b.active)
            .filter(|b| match run_scope {
                Some(scope) => b.run_id.as_deref() == Some(scope),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn fetch_all_businesses(&self) -> Result<Vec<Business>> {
        self.check_available()?;
        Ok(self.state.lock().await.businesses.values().cloned().collect())
    }

    async fn fetch_business(&self, id: BusinessId) -> Result<Option<Business>> {
        self.check_available()?;
        Ok(self.state.lock().await.businesses.get(&id).cloned())
    }

    async fn fetch_distinct_pairs(&self) -> Result<HashSet<PairKey>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .review_items
            .values()
            .filter(|item| item.status == ReviewStatus::ResolvedDistinct)
            .map(|item| item.pair)
            .collect())
    }

    async fn count_references(&self, id: BusinessId) -> Result<Vec<ReferenceRewrite>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(self
            .dependent_tables
            .iter()
            .map(|t| ReferenceRewrite {
                table: t.table.clone(),
                column: t.column.clone(),
                rows: state
                    .dependents
                    .get(&table_key(t))
                    .map(|rows| rows.iter().filter(|r| **r == id).count() as u64)
                    .unwrap_or(0),
            })
            .collect())
    }

    async fn apply_merge(
        &self,
        first: BusinessId,
        second: BusinessId,
        planner: &MergePlanner<'_>,
        review: &MergeReview,
    ) -> Result<MergeOutcome> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mut tx = state.clone();

        let current = |id: BusinessId| {
            tx.businesses
                .get(&id)
                .filter(|b| b.active)
                .cloned()
                .ok_or_else(|| anyhow!("business {} is missing or inactive", id))
        };
        let (a, b) = (current(first)?, current(second)?);
        let (plan, mut record) = match planner(&a, &b) {
            Ok(planned) => planned,
            Err(conflicts) => return Ok(MergeOutcome::Conflict(conflicts)),
        };

        let merged = &plan.merged_primary;
        let primary = tx
            .businesses
            .get_mut(&plan.primary_id)
            .ok_or_else(|| anyhow!("primary {} is missing", plan.primary_id))?;
        primary.name = merged.name.clone();
        primary.phone = merged.phone.clone();
        primary.address = merged.address.clone();
        primary.email = merged.email.clone();
        primary.website = merged.website.clone();
        primary.category = merged.category.clone();
        primary.attributes = merged.attributes.clone();

        let mut rewrites = Vec::with_capacity(self.dependent_tables.len());
        for table in &self.dependent_tables {
            let mut rows = 0u64;
            if let Some(ids) = tx.dependents.get_mut(&table_key(table)) {
                for id in ids.iter_mut().filter(|id| **id == plan.secondary_id) {
                    *id = plan.primary_id;
                    rows += 1;
                }
            }
            rewrites.push(ReferenceRewrite {
                table: table.table.clone(),
                column: table.column.clone(),
                rows,
            });
        }

        if self.take_injected_failure() {
            bail!("injected failure while merging {} into {}", plan.secondary_id, plan.primary_id);
        }

        if let Some(secondary) = tx.businesses.get_mut(&plan.secondary_id) {
            secondary.active = false;
            secondary.status = BusinessStatus::Merged;
            secondary.merged_into = Some(plan.primary_id);
        }

        if tx
            .merge_records
            .iter()
            .any(|r| r.merged_business_id == plan.secondary_id)
        {
            bail!("merge record for {} already exists", plan.secondary_id);
        }
        record.rewritten_references = rewrites;
        tx.merge_records.push(record.clone());

        let now = Utc::now();
        let pair = PairKey::new(first, second);
        let note = superseded_note(plan.secondary_id, plan.primary_id);
        for item in tx.review_items.values_mut().filter(|i| i.is_open()) {
            if item.pair == pair {
                item.status = ReviewStatus::ResolvedMerge;
                item.reviewer_id = review.reviewer_id.clone();
                item.review_notes = review.notes.clone();
            } else if item.pair.0 == plan.secondary_id || item.pair.1 == plan.secondary_id {
                item.status = ReviewStatus::Superseded;
                item.review_notes = Some(note.clone());
            } else {
                continue;
            }
            item.updated_at = now;
            item.resolved_at = Some(now);
        }

        *state = tx;
        Ok(MergeOutcome::Merged(record))
    }

    async fn fetch_merge_records(&self, business_id: BusinessId) -> Result<Vec<MergeRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .merge_records
            .iter()
            .filter(|r| r.primary_business_id == business_id || r.merged_business_id == business_id)
            .cloned()
            .collect())
    }

    async fn find_inactive_references(&self) -> Result<Vec<DanglingReference>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut dangling = Vec::new();
        for table in &self.dependent_tables {
            let mut counts: BTreeMap<BusinessId, u64> = BTreeMap::new();
            for id in state.dependents.get(&table_key(table)).into_iter().flatten() {
                let active = state.businesses.get(id).map(|b| b.active).unwrap_or(false);
                if !active {
                    *counts.entry(*id).or_default() += 1;
                }
            }
            dangling.extend(counts.into_iter().map(|(business_id, rows)| DanglingReference {
                table: table.table.clone(),
                column: table.column.clone(),
                business_id,
                rows,
            }));
        }
        Ok(dangling)
    }

    async fn upsert_review_item(&self, item: &NewReviewItem) -> Result<ReviewItem> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(existing) = state.review_items.get_mut(&item.pair) {
            if existing.is_open() {
                existing.similarity_score = item.similarity_score;
                existing.similarity = item.similarity;
                existing.verification = item.verification.clone();
                existing.conflicts = item.conflicts.clone();
                existing.reason = item.reason;
                existing.details = item.details.clone();
                existing.pipeline_run_id = item.pipeline_run_id.clone();
                existing.updated_at = now;
            }
            return Ok(existing.clone());
        }
        let created = ReviewItem {
            id: Uuid::new_v4().to_string(),
            pair: item.pair,
            similarity_score: item.similarity_score,
            similarity: item.similarity,
            verification: item.verification.clone(),
            conflicts: item.conflicts.clone(),
            reason: item.reason,
            status: ReviewStatus::Open,
            details: item.details.clone(),
            pipeline_run_id: item.pipeline_run_id.clone(),
            reviewer_id: None,
            review_notes: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        state.review_items.insert(item.pair, created.clone());
        Ok(created)
    }

    async fn fetch_review_item(&self, id: &str) -> Result<Option<ReviewItem>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.review_items.values().find(|i| i.id == id).cloned())
    }

    async fn fetch_review_item_for_pair(&self, pair: PairKey) -> Result<Option<ReviewItem>> {
        self.check_available()?;
        Ok(self.state.lock().await.review_items.get(&pair).cloned())
    }

    async fn fetch_open_review_items(&self, limit: Option<usize>) -> Result<Vec<ReviewItem>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut open: Vec<ReviewItem> = state
            .review_items
            .values()
            .filter(|i| i.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            b.similarity_score
                .total_cmp(&a.similarity_score)
                .then_with(|| a.pair.cmp(&b.pair))
        });
        if let Some(limit) = limit {
            open.truncate(limit);
        }
        Ok(open)
    }

    async fn set_review_status(
        &self,
        id: &str,
        status: ReviewStatus,
        reviewer_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<ReviewItem> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let item = state
            .review_items
            .values_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| anyhow!("review item {} not found", id))?;
        let now = Utc::now();
        item.status = status;
        item.reviewer_id = reviewer_id.map(str::to_string);
        item.review_notes = notes.map(str::to_string);
        item.updated_at = now;
        item.resolved_at = if status == ReviewStatus::Open { None } else { Some(now) };
        Ok(item.clone())
    }

    async fn record_run_start(&self, run_id: &str, description: &str, dry_run: bool) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.runs.insert(
            run_id.to_string(),
            RunRow {
                description: description.to_string(),
                dry_run,
                summary: None,
            },
        );
        Ok(())
    }

    async fn record_run_finish(&self, summary: &DedupRunSummary) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let row = state
            .runs
            .get_mut(&summary.run_id)
            .ok_or_else(|| anyhow!("run {} was never started", summary.run_id))?;
        row.summary = Some(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeConfig;
    use crate::db::PlannedMerge;
    use crate::merge::{merge_record_for, plan_merge};
    use crate::models::{ConflictPolicy, ReviewReason, SimilarityBreakdown};
    use crate::testing::business;
    use serde_json::json;

    fn planner(a: &Business, b: &Business) -> PlannedMerge {
        let plan = plan_merge(
            a,
            b,
            SimilarityBreakdown::default(),
            &MergeConfig::default(),
            ConflictPolicy::Abort,
        )?;
        let record = merge_record_for(&plan, Some("run-test"));
        Ok((plan, record))
    }

    fn review_item(a: i64, b: i64) -> NewReviewItem {
        NewReviewItem {
            pair: PairKey::new(BusinessId(a), BusinessId(b)),
            similarity_score: 0.7,
            similarity: SimilarityBreakdown::default(),
            verification: None,
            conflicts: Vec::new(),
            reason: ReviewReason::VerificationUncertain,
            details: json!({}),
            pipeline_run_id: Some("run-1".to_string()),
        }
    }

    /// Business 1 is the more complete record and survives a merge with 2.
    async fn seeded() -> (MemoryStore, Business, Business) {
        let store = MemoryStore::default();
        let mut a = business(1, "Joe's HVAC");
        a.phone = Some("212-555-0101".to_string());
        a.email = Some("joe@joeshvac.com".to_string());
        let mut b = business(2, "Joes HVAC Inc");
        b.website = Some("https://joeshvac.com".to_string());
        store.insert_business(a.clone()).await;
        store.insert_business(b.clone()).await;
        store.add_reference("generated_assets", b.id).await.unwrap();
        store.add_reference("generated_assets", b.id).await.unwrap();
        store.add_reference("outreach_emails", a.id).await.unwrap();
        (store, a, b)
    }

    async fn merge(store: &MemoryStore, a: &Business, b: &Business) -> Result<MergeOutcome> {
        store
            .apply_merge(a.id, b.id, &planner, &MergeReview::default())
            .await
    }

    #[tokio::test]
    async fn test_apply_merge_commits_every_step() {
        let (store, a, b) = seeded().await;
        let MergeOutcome::Merged(committed) = merge(&store, &a, &b).await.unwrap() else {
            panic!("expected a committed merge");
        };

        assert_eq!(committed.primary_business_id, a.id);
        assert_eq!(committed.total_rows_rewritten(), 2);
        let secondary = store.fetch_business(b.id).await.unwrap().unwrap();
        assert!(!secondary.active);
        assert_eq!(secondary.status, BusinessStatus::Merged);
        assert_eq!(secondary.merged_into, Some(a.id));
        let primary = store.fetch_business(a.id).await.unwrap().unwrap();
        assert_eq!(primary.website.as_deref(), Some("https://joeshvac.com"));
        assert_eq!(store.references("generated_assets").await.unwrap(), vec![a.id, a.id]);
        assert!(store.find_inactive_references().await.unwrap().is_empty());
        assert_eq!(store.merge_records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_plans_on_rows_current_at_commit() {
        let (store, a, b) = seeded().await;
        // Another writer updates the primary after the caller last read it.
        let mut updated = a.clone();
        updated.category = Some("HVAC contractor".to_string());
        updated.attributes = json!({"rating": 4.8});
        store.insert_business(updated).await;

        let MergeOutcome::Merged(committed) = merge(&store, &a, &b).await.unwrap() else {
            panic!("expected a committed merge");
        };
        let primary = store.fetch_business(a.id).await.unwrap().unwrap();
        assert_eq!(primary.category.as_deref(), Some("HVAC contractor"));
        assert_eq!(primary.attributes["rating"], json!(4.8));
        assert_eq!(primary.website.as_deref(), Some("https://joeshvac.com"));
        assert_eq!(
            committed.primary_completeness.fields.get("category"),
            Some(&0.5)
        );
    }

    #[tokio::test]
    async fn test_conflict_on_current_rows_leaves_store_untouched() {
        let (store, a, b) = seeded().await;
        let mut changed = b.clone();
        changed.email = Some("office@joes-hvac-brooklyn.com".to_string());
        store.insert_business(changed).await;
        let before = store.fetch_all_businesses().await.unwrap();

        let outcome = merge(&store, &a, &b).await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflict(ref c) if c.len() == 1));
        assert_eq!(store.fetch_all_businesses().await.unwrap(), before);
        assert_eq!(store.references("generated_assets").await.unwrap(), vec![b.id, b.id]);
        assert!(store.merge_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_merge_rolls_back() {
        let (store, a, b) = seeded().await;
        let open = store.upsert_review_item(&review_item(1, 2)).await.unwrap();
        let before = store.fetch_all_businesses().await.unwrap();
        store.fail_next_merges(1);

        assert!(merge(&store, &a, &b).await.is_err());
        assert_eq!(store.fetch_all_businesses().await.unwrap(), before);
        assert_eq!(store.references("generated_assets").await.unwrap(), vec![b.id, b.id]);
        assert!(store.merge_records().await.is_empty());
        assert!(store.fetch_review_item(&open.id).await.unwrap().unwrap().is_open());

        // The injected failure is consumed; a retry succeeds.
        assert!(matches!(merge(&store, &a, &b).await, Ok(MergeOutcome::Merged(_))));
    }

    #[tokio::test]
    async fn test_merge_of_inactive_record_is_refused() {
        let (store, a, b) = seeded().await;
        merge(&store, &a, &b).await.unwrap();
        assert!(merge(&store, &a, &b).await.is_err());
        assert_eq!(store.merge_records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_closes_its_item_and_supersedes_items_of_the_secondary() {
        let (store, a, b) = seeded().await;
        store.insert_business(business(3, "Joe's Heating")).await;
        let own = store.upsert_review_item(&review_item(1, 2)).await.unwrap();
        let secondary_item = store.upsert_review_item(&review_item(2, 3)).await.unwrap();
        let primary_item = store.upsert_review_item(&review_item(1, 3)).await.unwrap();

        let review = MergeReview {
            reviewer_id: Some("ops".to_string()),
            notes: Some("same owner".to_string()),
        };
        store.apply_merge(a.id, b.id, &planner, &review).await.unwrap();

        let own = store.fetch_review_item(&own.id).await.unwrap().unwrap();
        assert_eq!(own.status, ReviewStatus::ResolvedMerge);
        assert_eq!(own.reviewer_id.as_deref(), Some("ops"));
        assert_eq!(own.review_notes.as_deref(), Some("same owner"));
        assert!(own.resolved_at.is_some());

        let superseded = store.fetch_review_item(&secondary_item.id).await.unwrap().unwrap();
        assert_eq!(superseded.status, ReviewStatus::Superseded);
        assert_eq!(
            superseded.review_notes.as_deref(),
            Some("business 2 was merged into 1")
        );

        let untouched = store.fetch_review_item(&primary_item.id).await.unwrap().unwrap();
        assert!(untouched.is_open());
        assert_eq!(store.fetch_open_review_items(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_rows_track_start_and_finish() {
        let store = MemoryStore::default();
        store.record_run_start("run-1", "nightly", false).await.unwrap();
        assert_eq!(
            store.run("run-1").await,
            Some(RunRow {
                description: "nightly".to_string(),
                dry_run: false,
                summary: None,
            })
        );

        let summary = DedupRunSummary::new("run-1", Utc::now(), false);
        store.record_run_finish(&summary).await.unwrap();
        assert_eq!(store.run("run-1").await.unwrap().summary, Some(summary));

        let unknown = DedupRunSummary::new("run-2", Utc::now(), false);
        assert!(store.record_run_finish(&unknown).await.is_err());
    }

    #[tokio::test]
    async fn test_integrity_scan_finds_dangling_rows() {
        let (store, _a, b) = seeded().await;
        let mut inactive = store.fetch_business(b.id).await.unwrap().unwrap();
        inactive.active = false;
        store.insert_business(inactive).await;

        let dangling = store.find_inactive_references().await.unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].table, "generated_assets");
        assert_eq!(dangling[0].rows, 2);
    }

    #[tokio::test]
    async fn test_review_upsert_keeps_resolved_items() {
        let store = MemoryStore::default();
        let item = review_item(5, 3);
        let first = store.upsert_review_item(&item).await.unwrap();

        let mut again = item.clone();
        again.similarity_score = 0.8;
        let refreshed = store.upsert_review_item(&again).await.unwrap();
        assert_eq!(refreshed.id, first.id);
        assert_eq!(refreshed.similarity_score, 0.8);
        assert_eq!(store.review_items().await.len(), 1);

        store
            .set_review_status(&first.id, ReviewStatus::ResolvedDistinct, Some("ops"), None)
            .await
            .unwrap();
        let after = store.upsert_review_item(&item).await.unwrap();
        assert_eq!(after.status, ReviewStatus::ResolvedDistinct);
        assert_eq!(after.similarity_score, 0.8);
        assert!(store
            .fetch_distinct_pairs()
            .await
            .unwrap()
            .contains(&PairKey::new(BusinessId(3), BusinessId(5))));
    }

    #[tokio::test]
    async fn test_unknown_dependent_table_is_rejected() {
        let store = MemoryStore::default();
        assert!(store.add_reference("users", BusinessId(1)).await.is_err());
    }
}
