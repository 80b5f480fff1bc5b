// src/models/matching.rs
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::core::BusinessId;

/// Unordered pair of business ids, stored with the lower id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey(pub BusinessId, pub BusinessId);

impl PairKey {
    pub fn new(a: BusinessId, b: BusinessId) -> Self {
        if a <= b {
            PairKey(a, b)
        } else {
            PairKey(b, a)
        }
    }

    pub fn contains(&self, id: BusinessId) -> bool {
        self.0 == id || self.1 == id
    }
}

/// Per-field similarity in [0,1]. `None` means the field was missing on at
/// least one side and did not contribute to the weighted score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimilarityBreakdown {
    pub name: Option<f64>,
    pub phone: Option<f64>,
    pub address: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub score: f64,
    pub breakdown: SimilarityBreakdown,
}

/// Two active businesses whose cheap similarity warrants verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub pair: PairKey,
    pub score: f64,
    pub breakdown: SimilarityBreakdown,
}

impl CandidatePair {
    pub fn first(&self) -> BusinessId {
        self.pair.0
    }

    pub fn second(&self) -> BusinessId {
        self.pair.1
    }
}

impl Eq for CandidatePair {}

impl PartialOrd for CandidatePair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Higher score sorts greater; ties go to the lower pair key so that the
/// order is deterministic.
impl Ord for CandidatePair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.pair.cmp(&self.pair))
    }
}
