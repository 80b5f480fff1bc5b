// src/models/merge.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::core::{Business, BusinessField, BusinessId};
use super::matching::SimilarityBreakdown;

/// Weighted count of populated fields; `fields` holds each contribution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletenessScore {
    pub total: f64,
    pub fields: BTreeMap<String, f64>,
}

/// A value copied from the secondary onto an empty primary field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFill {
    pub field: String,
    pub value: JsonValue,
}

/// Both records carry a populated, non-equivalent value for an authoritative field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: BusinessField,
    pub primary_value: String,
    pub secondary_value: String,
}

/// How the merge engine treats authoritative-field conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Abort and route the pair to review. Used for every automatic merge.
    Abort,
    /// Keep the primary's values and record the overridden ones. Used only
    /// when an operator resolves a review item as a merge.
    PreferPrimary,
}

/// Everything decided before anything is written: who survives, what gets copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub primary_id: BusinessId,
    pub secondary_id: BusinessId,
    pub primary_completeness: CompletenessScore,
    pub secondary_completeness: CompletenessScore,
    pub fills: Vec<FieldFill>,
    pub overridden_conflicts: Vec<FieldConflict>,
    /// The primary row as it will look after the fill-gaps merge.
    pub merged_primary: Business,
    pub similarity: SimilarityBreakdown,
}

impl MergePlan {
    pub fn filled_field_names(&self) -> Vec<String> {
        self.fills.iter().map(|f| f.field.clone()).collect()
    }
}

/// Foreign-key column rewritten from the secondary id to the primary id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRewrite {
    pub table: String,
    pub column: String,
    pub rows: u64,
}

/// Immutable audit entry, one per committed merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: String,
    pub primary_business_id: BusinessId,
    pub merged_business_id: BusinessId,
    pub merged_at: DateTime<Utc>,
    pub primary_completeness: CompletenessScore,
    pub secondary_completeness: CompletenessScore,
    pub filled_fields: Vec<String>,
    pub rewritten_references: Vec<ReferenceRewrite>,
    pub overridden_conflicts: Vec<FieldConflict>,
    pub similarity: SimilarityBreakdown,
    pub pipeline_run_id: Option<String>,
}

impl MergeRecord {
    pub fn total_rows_rewritten(&self) -> u64 {
        self.rewritten_references.iter().map(|r| r.rows).sum()
    }
}

/// What happened to a merge request.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(MergeRecord),
    /// Dry run: the plan and the would-be audit entry; nothing was written.
    DryRun { plan: MergePlan, preview: MergeRecord },
    Conflict(Vec<FieldConflict>),
}
