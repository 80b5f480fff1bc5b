pub mod candidates;
pub mod normalize;
pub mod similarity;

pub use candidates::{CandidatePairGenerator, CandidatePairs, CandidateStats};
pub use similarity::{NormalizedBusiness, SimilarityScorer};
