// src/review/mod.rs
//! Review Queue: pairs the engine would not decide on its own, waiting for
//! an operator.

use anyhow::{anyhow, bail, Result};
use log::info;
use std::sync::Arc;

use crate::db::{DedupStore, MergeReview};
use crate::merge::{MergeEngine, MergeRequest};
use crate::models::{
    ConflictPolicy, MergeOutcome, MergeRecord, NewReviewItem, ReviewItem, ReviewStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub item: ReviewItem,
    /// Set when the item was resolved as a merge.
    pub merge: Option<MergeRecord>,
}

pub struct ReviewQueue<S: DedupStore> {
    store: Arc<S>,
}

impl<S: DedupStore> ReviewQueue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Upserts the item for the pair; an item an operator already resolved is
    /// left as it is.
    pub async fn escalate(&self, item: &NewReviewItem) -> Result<ReviewItem> {
        let stored = self.store.upsert_review_item(item).await?;
        if !stored.is_open() {
            info!(
                "Pair ({}, {}) was already resolved as {}; review item left unchanged",
                item.pair.0,
                item.pair.1,
                stored.status.as_str()
            );
        }
        Ok(stored)
    }

    pub async fn list_open(&self, limit: Option<usize>) -> Result<Vec<ReviewItem>> {
        self.store.fetch_open_review_items(limit).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ReviewItem>> {
        self.store.fetch_review_item(id).await
    }

    /// Closes an open item. `ResolvedMerge` runs the merge directly, without
    /// re-verification, keeping the primary's values where the records
    /// conflict; the item is closed inside the merge transaction and stays
    /// open if that merge fails. `ResolvedDistinct` excludes the pair from
    /// every later run.
    pub async fn resolve(
        &self,
        id: &str,
        status: ReviewStatus,
        reviewer_id: Option<&str>,
        notes: Option<&str>,
        engine: &MergeEngine<S>,
    ) -> Result<Resolution> {
        let item = self
            .store
            .fetch_review_item(id)
            .await?
            .ok_or_else(|| anyhow!("review item {} not found", id))?;
        if !item.is_open() {
            bail!("review item {} is already {}", id, item.status.as_str());
        }

        let (item, merge) = match status {
            ReviewStatus::Open | ReviewStatus::Superseded => {
                bail!("cannot resolve a review item as {}", status.as_str())
            }
            ReviewStatus::ResolvedDistinct => {
                let item = self
                    .store
                    .set_review_status(id, status, reviewer_id, notes)
                    .await?;
                (item, None)
            }
            ReviewStatus::ResolvedMerge => {
                // The merge transaction closes the item itself.
                let request = MergeRequest {
                    first: item.pair.0,
                    second: item.pair.1,
                    similarity: item.similarity,
                    pipeline_run_id: item.pipeline_run_id.clone(),
                    dry_run: false,
                    policy: ConflictPolicy::PreferPrimary,
                    review: MergeReview {
                        reviewer_id: reviewer_id.map(str::to_string),
                        notes: notes.map(str::to_string),
                    },
                };
                let record = match engine.merge_pair(&request).await? {
                    MergeOutcome::Merged(record) => record,
                    other => bail!("operator merge of {} did not commit: {:?}", id, other),
                };
                let item = self
                    .store
                    .fetch_review_item(id)
                    .await?
                    .ok_or_else(|| anyhow!("review item {} vanished after merge", id))?;
                (item, Some(record))
            }
        };

        info!(
            "Review item {} for ({}, {}) resolved as {}{}",
            item.id,
            item.pair.0,
            item.pair.1,
            status.as_str(),
            reviewer_id
                .map(|r| format!(" by {}", r))
                .unwrap_or_default()
        );
        Ok(Resolution { item, merge })
    }
}
