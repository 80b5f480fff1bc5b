// src/models/review.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::matching::{PairKey, SimilarityBreakdown};
use super::merge::FieldConflict;
use super::verification::VerificationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    VerificationUncertain,
    VerificationFailed,
    ConflictingAuthoritativeField,
    MergeFailed,
    /// The pair could not be loaded or evaluated.
    ProcessingError,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::VerificationUncertain => "verification_uncertain",
            ReviewReason::VerificationFailed => "verification_failed",
            ReviewReason::ConflictingAuthoritativeField => "conflicting_authoritative_field",
            ReviewReason::MergeFailed => "merge_failed",
            ReviewReason::ProcessingError => "processing_error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "verification_uncertain" => Some(ReviewReason::VerificationUncertain),
            "verification_failed" => Some(ReviewReason::VerificationFailed),
            "conflicting_authoritative_field" => Some(ReviewReason::ConflictingAuthoritativeField),
            "merge_failed" => Some(ReviewReason::MergeFailed),
            "processing_error" => Some(ReviewReason::ProcessingError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Open,
    ResolvedMerge,
    ResolvedDistinct,
    /// Closed because one of its businesses was merged into a third record.
    Superseded,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Open => "open",
            ReviewStatus::ResolvedMerge => "resolved_merge",
            ReviewStatus::ResolvedDistinct => "resolved_distinct",
            ReviewStatus::Superseded => "superseded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ReviewStatus::Open),
            "resolved_merge" => Some(ReviewStatus::ResolvedMerge),
            "resolved_distinct" => Some(ReviewStatus::ResolvedDistinct),
            "superseded" => Some(ReviewStatus::Superseded),
            _ => None,
        }
    }
}

/// Data for one escalation. Upserted by pair, so a pair has at most one item.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReviewItem {
    pub pair: PairKey,
    pub similarity_score: f64,
    pub similarity: SimilarityBreakdown,
    pub verification: Option<VerificationResult>,
    pub conflicts: Vec<FieldConflict>,
    pub reason: ReviewReason,
    /// Free-form diagnostics (error text, dry-run notes, ...).
    pub details: JsonValue,
    pub pipeline_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub pair: PairKey,
    pub similarity_score: f64,
    pub similarity: SimilarityBreakdown,
    pub verification: Option<VerificationResult>,
    pub conflicts: Vec<FieldConflict>,
    pub reason: ReviewReason,
    pub status: ReviewStatus,
    pub details: JsonValue,
    pub pipeline_run_id: Option<String>,
    pub reviewer_id: Option<String>,
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewItem {
    pub fn is_open(&self) -> bool {
        self.status == ReviewStatus::Open
    }
}
