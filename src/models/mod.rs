pub mod core;
pub mod matching;
pub mod merge;
pub mod review;
pub mod stats_models;
pub mod verification;

pub use self::core::{businesses_checksum, Business, BusinessField, BusinessId, BusinessStatus};
pub use self::matching::{CandidatePair, PairKey, SimilarityBreakdown, SimilarityScore};
pub use self::merge::{
    CompletenessScore, ConflictPolicy, FieldConflict, FieldFill, MergeOutcome, MergePlan,
    MergeRecord, ReferenceRewrite,
};
pub use self::review::{NewReviewItem, ReviewItem, ReviewReason, ReviewStatus};
pub use self::stats_models::{DedupRunSummary, RunState};
pub use self::verification::{VerificationDecision, VerificationResult};
