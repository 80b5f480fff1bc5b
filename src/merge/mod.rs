// src/merge/mod.rs
//! Merge Engine: choose the surviving record, refuse to discard conflicting
//! authoritative data, fill the survivor's gaps and commit everything in one
//! store transaction.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{debug, info};
use serde_json::{json, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::MergeConfig;
use crate::db::{DedupStore, MergePlanner, MergeReview, PlannedMerge};
use crate::matching::normalize::{
    normalize_address, normalize_email, normalize_name, normalize_phone, normalize_website,
};
use crate::matching::similarity::field_similarity;
use crate::models::core::attribute_is_populated;
use crate::models::{
    Business, BusinessField, BusinessId, CompletenessScore, ConflictPolicy, FieldConflict,
    FieldFill, MergeOutcome, MergePlan, MergeRecord, SimilarityBreakdown,
};

/// Fields with downstream dependents weigh more.
const FIELD_WEIGHTS: [(BusinessField, f64); 6] = [
    (BusinessField::Email, 3.0),
    (BusinessField::Website, 2.5),
    (BusinessField::Phone, 2.0),
    (BusinessField::Address, 1.0),
    (BusinessField::Name, 1.0),
    (BusinessField::Category, 0.5),
];
const ATTRIBUTE_WEIGHT: f64 = 0.25;
const ATTRIBUTE_WEIGHT_CAP: f64 = 2.0;

pub fn completeness(business: &Business) -> CompletenessScore {
    let mut fields = BTreeMap::new();
    for (field, weight) in FIELD_WEIGHTS {
        if business.populated(field).is_some() {
            fields.insert(field.as_str().to_string(), weight);
        }
    }
    let attribute_count = business.populated_attribute_keys().len();
    if attribute_count > 0 {
        let weight = (attribute_count as f64 * ATTRIBUTE_WEIGHT).min(ATTRIBUTE_WEIGHT_CAP);
        fields.insert("attributes".to_string(), weight);
    }
    CompletenessScore {
        total: fields.values().sum(),
        fields,
    }
}

/// Higher completeness wins; ties go to the earlier created, then lower id.
fn first_is_primary(a: &Business, a_score: f64, b: &Business, b_score: f64) -> bool {
    match a_score.total_cmp(&b_score) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => (a.created_at, a.id) <= (b.created_at, b.id),
    }
}

/// Returns `(primary, secondary)`.
pub fn select_primary<'a>(a: &'a Business, b: &'a Business) -> (&'a Business, &'a Business) {
    if first_is_primary(a, completeness(a).total, b, completeness(b).total) {
        (a, b)
    } else {
        (b, a)
    }
}

/// Whether two populated values of `field` describe the same thing.
pub fn values_equivalent(field: BusinessField, a: &str, b: &str, address_threshold: f64) -> bool {
    match field {
        BusinessField::Email => normalize_email(a) == normalize_email(b),
        BusinessField::Website => normalize_website(a) == normalize_website(b),
        BusinessField::Phone => {
            let (x, y) = (normalize_phone(a), normalize_phone(b));
            if x.is_empty() || y.is_empty() {
                a.trim().eq_ignore_ascii_case(b.trim())
            } else {
                x == y
            }
        }
        BusinessField::Address => {
            field_similarity(&normalize_address(a), &normalize_address(b)) >= address_threshold
        }
        BusinessField::Name => normalize_name(a) == normalize_name(b),
        BusinessField::Category => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

/// Authoritative fields populated on both sides with non-equivalent values.
pub fn find_conflicts(
    primary: &Business,
    secondary: &Business,
    config: &MergeConfig,
) -> Vec<FieldConflict> {
    config
        .authoritative_fields
        .iter()
        .filter_map(|&field| {
            let p = primary.populated(field)?;
            let s = secondary.populated(field)?;
            if values_equivalent(field, p, s, config.address_conflict_threshold) {
                None
            } else {
                Some(FieldConflict {
                    field,
                    primary_value: p.to_string(),
                    secondary_value: s.to_string(),
                })
            }
        })
        .collect()
}

/// Copies secondary attributes whose key is missing, null or a placeholder on the primary.
fn fill_attributes(merged: &mut Business, secondary: &Business, fills: &mut Vec<FieldFill>) {
    let JsonValue::Object(source) = &secondary.attributes else {
        return;
    };
    if !merged.attributes.is_object() {
        merged.attributes = JsonValue::Object(serde_json::Map::new());
    }
    if let JsonValue::Object(target) = &mut merged.attributes {
        for (key, value) in source {
            if !attribute_is_populated(value) {
                continue;
            }
            let missing = target.get(key).map(|v| !attribute_is_populated(v)).unwrap_or(true);
            if missing {
                target.insert(key.clone(), value.clone());
                fills.push(FieldFill {
                    field: format!("attributes.{}", key),
                    value: value.clone(),
                });
            }
        }
    }
}

/// Pure part of a merge: primary selection, conflict check and fill-gaps.
/// `Err` carries the conflicts that aborted the merge under `ConflictPolicy::Abort`.
pub fn plan_merge(
    a: &Business,
    b: &Business,
    similarity: SimilarityBreakdown,
    config: &MergeConfig,
    policy: ConflictPolicy,
) -> std::result::Result<MergePlan, Vec<FieldConflict>> {
    let (a_score, b_score) = (completeness(a), completeness(b));
    let (primary, secondary, primary_completeness, secondary_completeness) =
        if first_is_primary(a, a_score.total, b, b_score.total) {
            (a, b, a_score, b_score)
        } else {
            (b, a, b_score, a_score)
        };

    let conflicts = find_conflicts(primary, secondary, config);
    if !conflicts.is_empty() && policy == ConflictPolicy::Abort {
        return Err(conflicts);
    }

    let mut merged_primary = primary.clone();
    let mut fills = Vec::new();
    for field in BusinessField::ALL {
        if merged_primary.populated(field).is_some() {
            continue;
        }
        if let Some(value) = secondary.populated(field) {
            merged_primary.set_field(field, value.to_string());
            fills.push(FieldFill {
                field: field.as_str().to_string(),
                value: json!(value),
            });
        }
    }
    fill_attributes(&mut merged_primary, secondary, &mut fills);

    Ok(MergePlan {
        primary_id: primary.id,
        secondary_id: secondary.id,
        primary_completeness,
        secondary_completeness,
        fills,
        overridden_conflicts: conflicts,
        merged_primary,
        similarity,
    })
}

/// The audit entry for a plan, before references are rewritten.
pub fn merge_record_for(plan: &MergePlan, pipeline_run_id: Option<&str>) -> MergeRecord {
    MergeRecord {
        id: Uuid::new_v4().to_string(),
        primary_business_id: plan.primary_id,
        merged_business_id: plan.secondary_id,
        merged_at: Utc::now(),
        primary_completeness: plan.primary_completeness.clone(),
        secondary_completeness: plan.secondary_completeness.clone(),
        filled_fields: plan.filled_field_names(),
        rewritten_references: Vec::new(),
        overridden_conflicts: plan.overridden_conflicts.clone(),
        similarity: plan.similarity,
        pipeline_run_id: pipeline_run_id.map(str::to_string),
    }
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub first: BusinessId,
    pub second: BusinessId,
    pub similarity: SimilarityBreakdown,
    pub pipeline_run_id: Option<String>,
    pub dry_run: bool,
    pub policy: ConflictPolicy,
    /// Written onto the pair's open review item when the merge commits.
    pub review: MergeReview,
}

/// Releases the business ids of an in-flight merge when dropped.
struct InFlightGuard<'a> {
    held: &'a Mutex<HashSet<BusinessId>>,
    ids: [BusinessId; 2],
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            for id in &self.ids {
                held.remove(id);
            }
        }
    }
}

pub struct MergeEngine<S: DedupStore> {
    store: Arc<S>,
    config: MergeConfig,
    in_flight: Mutex<HashSet<BusinessId>>,
}

impl<S: DedupStore> MergeEngine<S> {
    pub fn new(store: Arc<S>, config: MergeConfig) -> Self {
        Self {
            store,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    fn acquire(&self, a: BusinessId, b: BusinessId) -> Result<InFlightGuard<'_>> {
        let mut held = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("in-flight merge registry is poisoned"))?;
        if held.contains(&a) || held.contains(&b) {
            bail!("a merge touching {} or {} is already in flight", a, b);
        }
        held.insert(a);
        held.insert(b);
        Ok(InFlightGuard {
            held: &self.in_flight,
            ids: [a, b],
        })
    }

    async fn load_active(&self, id: BusinessId) -> Result<Business> {
        let business = self
            .store
            .fetch_business(id)
            .await
            .with_context(|| format!("Failed to load business {} for merge", id))?
            .ok_or_else(|| anyhow!("business {} does not exist", id))?;
        if !business.active {
            bail!("business {} is no longer active", id);
        }
        Ok(business)
    }

    /// Dry-run counterpart of `DedupStore::apply_merge`: plans on the rows
    /// as read now and counts the references a merge would rewrite.
    async fn preview(
        &self,
        request: &MergeRequest,
        planner: &MergePlanner<'_>,
    ) -> Result<MergeOutcome> {
        let a = self.load_active(request.first).await?;
        let b = self.load_active(request.second).await?;
        let (plan, mut preview) = match planner(&a, &b) {
            Ok(planned) => planned,
            Err(conflicts) => return Ok(MergeOutcome::Conflict(conflicts)),
        };
        preview.rewritten_references = self
            .store
            .count_references(plan.secondary_id)
            .await
            .context("Failed to count references for dry-run preview")?;
        Ok(MergeOutcome::DryRun { plan, preview })
    }

    /// Runs the full merge algorithm. Conflicts are an `Ok` outcome; `Err`
    /// means nothing was committed and the pair can be retried. A real merge
    /// is planned inside the store transaction, on the locked rows.
    pub async fn merge_pair(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        if request.first == request.second {
            bail!("cannot merge business {} into itself", request.first);
        }
        let _guard = self.acquire(request.first, request.second)?;

        let config = &self.config;
        let run_id = request.pipeline_run_id.as_deref();
        let planner = move |a: &Business, b: &Business| -> PlannedMerge {
            let plan = plan_merge(a, b, request.similarity, config, request.policy)?;
            let record = merge_record_for(&plan, run_id);
            Ok((plan, record))
        };

        let outcome = if request.dry_run {
            self.preview(request, &planner).await?
        } else {
            self.store
                .apply_merge(request.first, request.second, &planner, &request.review)
                .await
                .with_context(|| {
                    format!(
                        "Merge transaction for ({}, {}) rolled back",
                        request.first, request.second
                    )
                })?
        };

        match &outcome {
            MergeOutcome::Merged(committed) => info!(
                "Merged {} into {} (filled {:?}, rewrote {} references)",
                committed.merged_business_id,
                committed.primary_business_id,
                committed.filled_fields,
                committed.total_rows_rewritten()
            ),
            MergeOutcome::DryRun { plan, preview } => info!(
                "[DRY RUN] Would merge {} into {} (fills: {:?}, {} references)",
                plan.secondary_id,
                plan.primary_id,
                preview.filled_fields,
                preview.total_rows_rewritten()
            ),
            MergeOutcome::Conflict(conflicts) => debug!(
                "Merge of ({}, {}) aborted on {} conflicting field(s)",
                request.first,
                request.second,
                conflicts.len()
            ),
        }
        Ok(outcome)
    }
}
