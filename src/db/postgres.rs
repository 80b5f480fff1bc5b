// src/db/postgres.rs
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use postgres_types::Json;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::config::DependentTable;
use crate::db::{superseded_note, DanglingReference, DedupStore, MergePlanner, MergeReview};
use crate::models::{
    Business, BusinessId, BusinessStatus, CompletenessScore, DedupRunSummary, FieldConflict,
    MergeOutcome, MergeRecord, NewReviewItem, PairKey, ReferenceRewrite, ReviewItem, ReviewReason,
    ReviewStatus, SimilarityBreakdown, VerificationResult,
};
use crate::utils::db_connect::PgPool;

const BUSINESS_COLUMNS: &str = "id, name, phone, address, email, website, category, attributes, \
     active, status, merged_into, run_id, created_at";

const REVIEW_COLUMNS: &str = "id, business_id_1, business_id_2, similarity_score, similarity, \
     verification, conflicts, reason, status, details, pipeline_run_id, reviewer_id, review_notes, \
     created_at, updated_at, resolved_at";

const MERGE_RECORD_COLUMNS: &str = "id, primary_business_id, merged_business_id, merged_at, \
     primary_completeness, secondary_completeness, filled_fields, rewritten_references, \
     similarity, overridden_conflicts, pipeline_run_id";

fn row_to_business(row: &Row) -> Result<Business> {
    let status: Option<String> = row.try_get("status")?;
    let attributes: Option<JsonValue> = row.try_get("attributes")?;
    let merged_into: Option<i64> = row.try_get("merged_into")?;
    let name: Option<String> = row.try_get("name")?;
    Ok(Business {
        id: BusinessId(row.try_get("id")?),
        name: name.unwrap_or_default(),
        phone: row.try_get("phone")?,
        address: row.try_get("address")?,
        email: row.try_get("email")?,
        website: row.try_get("website")?,
        category: row.try_get("category")?,
        attributes: attributes.unwrap_or_else(|| JsonValue::Object(serde_json::Map::new())),
        active: row.try_get("active")?,
        status: BusinessStatus::from_str(status.as_deref().unwrap_or("pending")),
        merged_into: merged_into.map(BusinessId),
        run_id: row.try_get("run_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_review_item(row: &Row) -> Result<ReviewItem> {
    let reason: String = row.try_get("reason")?;
    let status: String = row.try_get("status")?;
    let similarity: Json<SimilarityBreakdown> = row.try_get("similarity")?;
    let verification: Option<Json<VerificationResult>> = row.try_get("verification")?;
    let conflicts: Json<Vec<FieldConflict>> = row.try_get("conflicts")?;
    Ok(ReviewItem {
        id: row.try_get("id")?,
        pair: PairKey::new(
            BusinessId(row.try_get("business_id_1")?),
            BusinessId(row.try_get("business_id_2")?),
        ),
        similarity_score: row.try_get("similarity_score")?,
        similarity: similarity.0,
        verification: verification.map(|v| v.0),
        conflicts: conflicts.0,
        reason: ReviewReason::from_str(&reason)
            .ok_or_else(|| anyhow!("Unknown review reason '{}'", reason))?,
        status: ReviewStatus::from_str(&status)
            .ok_or_else(|| anyhow!("Unknown review status '{}'", status))?,
        details: row.try_get("details")?,
        pipeline_run_id: row.try_get("pipeline_run_id")?,
        reviewer_id: row.try_get("reviewer_id")?,
        review_notes: row.try_get("review_notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn row_to_merge_record(row: &Row) -> Result<MergeRecord> {
    let primary_completeness: Json<CompletenessScore> = row.try_get("primary_completeness")?;
    let secondary_completeness: Json<CompletenessScore> = row.try_get("secondary_completeness")?;
    let filled_fields: Json<Vec<String>> = row.try_get("filled_fields")?;
    let rewritten_references: Json<Vec<ReferenceRewrite>> = row.try_get("rewritten_references")?;
    let similarity: Json<SimilarityBreakdown> = row.try_get("similarity")?;
    let overridden_conflicts: Json<Vec<FieldConflict>> = row.try_get("overridden_conflicts")?;
    let merged_at: DateTime<Utc> = row.try_get("merged_at")?;
    Ok(MergeRecord {
        id: row.try_get("id")?,
        primary_business_id: BusinessId(row.try_get("primary_business_id")?),
        merged_business_id: BusinessId(row.try_get("merged_business_id")?),
        merged_at,
        primary_completeness: primary_completeness.0,
        secondary_completeness: secondary_completeness.0,
        filled_fields: filled_fields.0,
        rewritten_references: rewritten_references.0,
        overridden_conflicts: overridden_conflicts.0,
        similarity: similarity.0,
        pipeline_run_id: row.try_get("pipeline_run_id")?,
    })
}

fn locked_active(locked: &[Business], id: BusinessId) -> Result<&Business> {
    locked
        .iter()
        .find(|b| b.id == id && b.active)
        .ok_or_else(|| anyhow!("business {} is missing or inactive", id))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<JsonValue> {
    serde_json::to_value(value).with_context(|| format!("Failed to serialize {}", what))
}

/// `DedupStore` over the shared Postgres pool.
#[derive(Clone)]
pub struct PgDedupStore {
    pool: PgPool,
    dependent_tables: Vec<DependentTable>,
}

impl PgDedupStore {
    /// Identifiers are re-validated here since they are spliced into SQL.
    pub fn new(pool: PgPool, dependent_tables: Vec<DependentTable>) -> Result<Self> {
        let dependent_tables = dependent_tables
            .iter()
            .map(|t| DependentTable::new(&t.table, &t.column))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pool,
            dependent_tables,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn fetch_active_businesses(&self, run_scope: Option<&str>) -> Result<Vec<Business>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_active_businesses")?;
        let sql = format!(
            "SELECT {} FROM public.businesses
             WHERE active = true AND ($1::text IS NULL OR run_id = $1)
             ORDER BY id",
            BUSINESS_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&run_scope])
            .await
            .context("Failed to query active businesses")?;
        rows.iter().map(row_to_business).collect()
    }

    async fn fetch_all_businesses(&self) -> Result<Vec<Business>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_all_businesses")?;
        let sql = format!("SELECT {} FROM public.businesses ORDER BY id", BUSINESS_COLUMNS);
        let rows = conn
            .query(sql.as_str(), &[])
            .await
            .context("Failed to query businesses")?;
        rows.iter().map(row_to_business).collect()
    }

    async fn fetch_business(&self, id: BusinessId) -> Result<Option<Business>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_business")?;
        let sql = format!("SELECT {} FROM public.businesses WHERE id = $1", BUSINESS_COLUMNS);
        let row = conn
            .query_opt(sql.as_str(), &[&id.0])
            .await
            .with_context(|| format!("Failed to fetch business {}", id))?;
        row.as_ref().map(row_to_business).transpose()
    }

    async fn fetch_distinct_pairs(&self) -> Result<HashSet<PairKey>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_distinct_pairs")?;
        let rows = conn
            .query(
                "SELECT business_id_1, business_id_2 FROM dedup.review_items WHERE status = $1",
                &[&ReviewStatus::ResolvedDistinct.as_str()],
            )
            .await
            .context("Failed to query resolved_distinct pairs")?;
        Ok(rows
            .iter()
            .map(|row| PairKey::new(BusinessId(row.get(0)), BusinessId(row.get(1))))
            .collect())
    }

    async fn count_references(&self, id: BusinessId) -> Result<Vec<ReferenceRewrite>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for count_references")?;
        let mut counts = Vec::with_capacity(self.dependent_tables.len());
        for table in &self.dependent_tables {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE {} = $1",
                table.table, table.column
            );
            let row = conn
                .query_one(sql.as_str(), &[&id.0])
                .await
                .with_context(|| format!("Failed to count references in {}", table.table))?;
            let rows: i64 = row.get(0);
            counts.push(ReferenceRewrite {
                table: table.table.clone(),
                column: table.column.clone(),
                rows: rows.max(0) as u64,
            });
        }
        Ok(counts)
    }

    async fn apply_merge(
        &self,
        first: BusinessId,
        second: BusinessId,
        planner: &MergePlanner<'_>,
        review: &MergeReview,
    ) -> Result<MergeOutcome> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for apply_merge")?;
        // Dropping `tx` without commit rolls everything back.
        let tx = conn
            .transaction()
            .await
            .context("Failed to start merge transaction")?;

        let ids = vec![first.0, second.0];
        let lock_sql = format!(
            "SELECT {} FROM public.businesses WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            BUSINESS_COLUMNS
        );
        let locked = tx
            .query(lock_sql.as_str(), &[&ids])
            .await
            .context("Failed to lock businesses for merge")?
            .iter()
            .map(row_to_business)
            .collect::<Result<Vec<_>>>()?;
        let a = locked_active(&locked, first)?;
        let b = locked_active(&locked, second)?;

        let (plan, mut record) = match planner(a, b) {
            Ok(planned) => planned,
            Err(conflicts) => return Ok(MergeOutcome::Conflict(conflicts)),
        };

        let merged = &plan.merged_primary;
        tx.execute(
            "UPDATE public.businesses
             SET name = $2, phone = $3, address = $4, email = $5, website = $6, category = $7,
                 attributes = $8, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
            &[
                &plan.primary_id.0,
                &merged.name,
                &merged.phone,
                &merged.address,
                &merged.email,
                &merged.website,
                &merged.category,
                &merged.attributes,
            ],
        )
        .await
        .context("Failed to update primary business")?;

        let mut rewrites = Vec::with_capacity(self.dependent_tables.len());
        for table in &self.dependent_tables {
            let sql = format!(
                "UPDATE {} SET {} = $1 WHERE {} = $2",
                table.table, table.column, table.column
            );
            let rows = tx
                .execute(sql.as_str(), &[&plan.primary_id.0, &plan.secondary_id.0])
                .await
                .with_context(|| format!("Failed to rewrite references in {}", table.table))?;
            debug!(
                "Rewrote {} rows in {}.{} from {} to {}",
                rows, table.table, table.column, plan.secondary_id, plan.primary_id
            );
            rewrites.push(ReferenceRewrite {
                table: table.table.clone(),
                column: table.column.clone(),
                rows,
            });
        }

        tx.execute(
            "UPDATE public.businesses
             SET active = false, status = $2, merged_into = $3, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
            &[
                &plan.secondary_id.0,
                &BusinessStatus::Merged.as_str(),
                &plan.primary_id.0,
            ],
        )
        .await
        .context("Failed to deactivate secondary business")?;

        record.rewritten_references = rewrites;
        let insert_sql = format!(
            "INSERT INTO dedup.merge_records ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            MERGE_RECORD_COLUMNS
        );
        tx.execute(
            insert_sql.as_str(),
            &[
                &record.id,
                &record.primary_business_id.0,
                &record.merged_business_id.0,
                &record.merged_at,
                &to_json(&record.primary_completeness, "primary completeness")?,
                &to_json(&record.secondary_completeness, "secondary completeness")?,
                &to_json(&record.filled_fields, "filled fields")?,
                &to_json(&record.rewritten_references, "rewritten references")?,
                &to_json(&record.similarity, "similarity breakdown")?,
                &to_json(&record.overridden_conflicts, "overridden conflicts")?,
                &record.pipeline_run_id,
            ],
        )
        .await
        .context("Failed to insert merge record")?;

        let pair = PairKey::new(first, second);
        tx.execute(
            "UPDATE dedup.review_items
             SET status = $3, reviewer_id = $4, review_notes = $5,
                 updated_at = CURRENT_TIMESTAMP, resolved_at = CURRENT_TIMESTAMP
             WHERE business_id_1 = $1 AND business_id_2 = $2 AND status = 'open'",
            &[
                &pair.0 .0,
                &pair.1 .0,
                &ReviewStatus::ResolvedMerge.as_str(),
                &review.reviewer_id,
                &review.notes,
            ],
        )
        .await
        .context("Failed to close review item of merged pair")?;
        let superseded = tx
            .execute(
                "UPDATE dedup.review_items
                 SET status = $2, review_notes = $3,
                     updated_at = CURRENT_TIMESTAMP, resolved_at = CURRENT_TIMESTAMP
                 WHERE status = 'open' AND (business_id_1 = $1 OR business_id_2 = $1)",
                &[
                    &plan.secondary_id.0,
                    &ReviewStatus::Superseded.as_str(),
                    &superseded_note(plan.secondary_id, plan.primary_id),
                ],
            )
            .await
            .context("Failed to supersede review items of merged business")?;
        if superseded > 0 {
            debug!(
                "Superseded {} open review item(s) naming business {}",
                superseded, plan.secondary_id
            );
        }

        tx.commit().await.context("Failed to commit merge transaction")?;
        Ok(MergeOutcome::Merged(record))
    }

    async fn fetch_merge_records(&self, business_id: BusinessId) -> Result<Vec<MergeRecord>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_merge_records")?;
        let sql = format!(
            "SELECT {} FROM dedup.merge_records
             WHERE primary_business_id = $1 OR merged_business_id = $1
             ORDER BY merged_at",
            MERGE_RECORD_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&business_id.0])
            .await
            .context("Failed to query merge records")?;
        rows.iter().map(row_to_merge_record).collect()
    }

    async fn find_inactive_references(&self) -> Result<Vec<DanglingReference>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for find_inactive_references")?;
        let mut dangling = Vec::new();
        for table in &self.dependent_tables {
            let sql = format!(
                "SELECT d.{col}, COUNT(*)
                 FROM {table} d
                 LEFT JOIN public.businesses b ON b.id = d.{col}
                 WHERE d.{col} IS NOT NULL AND (b.id IS NULL OR b.active = false)
                 GROUP BY d.{col}
                 ORDER BY d.{col}",
                col = table.column,
                table = table.table
            );
            let rows = conn
                .query(sql.as_str(), &[])
                .await
                .with_context(|| format!("Failed to scan {} for dangling references", table.table))?;
            for row in rows {
                let count: i64 = row.get(1);
                dangling.push(DanglingReference {
                    table: table.table.clone(),
                    column: table.column.clone(),
                    business_id: BusinessId(row.get(0)),
                    rows: count.max(0) as u64,
                });
            }
        }
        Ok(dangling)
    }

    async fn upsert_review_item(&self, item: &NewReviewItem) -> Result<ReviewItem> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for upsert_review_item")?;

        let verification = item
            .verification
            .as_ref()
            .map(|v| to_json(v, "verification result"))
            .transpose()?;

        // Resolved items are left as the operator closed them.
        let sql = format!(
            "INSERT INTO dedup.review_items (
                id, business_id_1, business_id_2, similarity_score, similarity,
                verification, conflicts, reason, status, details, pipeline_run_id,
                created_at, updated_at
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'open', $9, $10, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
             ON CONFLICT (business_id_1, business_id_2) DO UPDATE SET
                similarity_score = EXCLUDED.similarity_score,
                similarity = EXCLUDED.similarity,
                verification = EXCLUDED.verification,
                conflicts = EXCLUDED.conflicts,
                reason = EXCLUDED.reason,
                details = EXCLUDED.details,
                pipeline_run_id = EXCLUDED.pipeline_run_id,
                updated_at = CURRENT_TIMESTAMP
             WHERE dedup.review_items.status = 'open'
             RETURNING {}",
            REVIEW_COLUMNS
        );
        let row = conn
            .query_opt(
                sql.as_str(),
                &[
                    &Uuid::new_v4().to_string(),
                    &item.pair.0 .0,
                    &item.pair.1 .0,
                    &item.similarity_score,
                    &to_json(&item.similarity, "similarity breakdown")?,
                    &verification,
                    &to_json(&item.conflicts, "conflicts")?,
                    &item.reason.as_str(),
                    &item.details,
                    &item.pipeline_run_id,
                ],
            )
            .await
            .context("Failed to upsert review item")?;

        match row {
            Some(row) => row_to_review_item(&row),
            None => self
                .fetch_review_item_for_pair(item.pair)
                .await?
                .ok_or_else(|| anyhow!("review item for pair {:?} vanished after upsert", item.pair)),
        }
    }

    async fn fetch_review_item(&self, id: &str) -> Result<Option<ReviewItem>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_review_item")?;
        let sql = format!("SELECT {} FROM dedup.review_items WHERE id = $1", REVIEW_COLUMNS);
        let row = conn
            .query_opt(sql.as_str(), &[&id])
            .await
            .context("Failed to fetch review item")?;
        row.as_ref().map(row_to_review_item).transpose()
    }

    async fn fetch_review_item_for_pair(&self, pair: PairKey) -> Result<Option<ReviewItem>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_review_item_for_pair")?;
        let sql = format!(
            "SELECT {} FROM dedup.review_items WHERE business_id_1 = $1 AND business_id_2 = $2",
            REVIEW_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&pair.0 .0, &pair.1 .0])
            .await
            .context("Failed to fetch review item by pair")?;
        row.as_ref().map(row_to_review_item).transpose()
    }

    async fn fetch_open_review_items(&self, limit: Option<usize>) -> Result<Vec<ReviewItem>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_open_review_items")?;
        let sql = format!(
            "SELECT {} FROM dedup.review_items
             WHERE status = 'open'
             ORDER BY similarity_score DESC, business_id_1, business_id_2
             LIMIT $1",
            REVIEW_COLUMNS
        );
        // LIMIT NULL means no limit.
        let limit = limit.map(|l| l as i64);
        let rows = conn
            .query(sql.as_str(), &[&limit])
            .await
            .context("Failed to query open review items")?;
        rows.iter().map(row_to_review_item).collect()
    }

    async fn set_review_status(
        &self,
        id: &str,
        status: ReviewStatus,
        reviewer_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<ReviewItem> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for set_review_status")?;
        let sql = format!(
            "UPDATE dedup.review_items
             SET status = $2, reviewer_id = $3, review_notes = $4, updated_at = CURRENT_TIMESTAMP,
                 resolved_at = CASE WHEN $2 = 'open' THEN NULL ELSE CURRENT_TIMESTAMP END
             WHERE id = $1
             RETURNING {}",
            REVIEW_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&id, &status.as_str(), &reviewer_id, &notes])
            .await
            .context("Failed to update review item status")?
            .ok_or_else(|| anyhow!("review item {} not found", id))?;
        row_to_review_item(&row)
    }

    async fn record_run_start(&self, run_id: &str, description: &str, dry_run: bool) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for record_run_start")?;
        conn.execute(
            "INSERT INTO dedup.pipeline_run (
                id, run_timestamp, description, dry_run, state,
                pairs_considered, merged, escalated, rejected, skipped, errors, total_processing_time
             )
             VALUES ($1, CURRENT_TIMESTAMP, $2, $3, 'started', 0, 0, 0, 0, 0, 0, 0.0)",
            &[&run_id, &description, &dry_run],
        )
        .await
        .context("Failed to insert initial pipeline_run record")?;
        info!("Created initial pipeline_run record with ID: {}", run_id);
        Ok(())
    }

    async fn record_run_finish(&self, summary: &DedupRunSummary) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for record_run_finish")?;
        let updated = conn
            .execute(
                "UPDATE dedup.pipeline_run
                 SET state = $2, cancelled = $3, pairs_considered = $4, merged = $5,
                     escalated = $6, rejected = $7, skipped = $8, errors = $9,
                     total_processing_time = $10, failure = $11, finished_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
                &[
                    &summary.run_id,
                    &summary.state.as_str(),
                    &summary.cancelled,
                    &(summary.pairs_considered as i64),
                    &(summary.merged as i64),
                    &(summary.escalated as i64),
                    &(summary.rejected as i64),
                    &(summary.skipped as i64),
                    &(summary.errors as i64),
                    &summary.total_processing_time,
                    &summary.failure,
                ],
            )
            .await
            .context("Failed to update pipeline_run record")?;
        if updated == 0 {
            bail!("pipeline_run {} not found", summary.run_id);
        }
        Ok(())
    }
}
