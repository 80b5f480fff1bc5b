// src/matching/candidates.rs
//! Blocking-based candidate generation.
//!
//! Records are bucketed by normalized phone and by a short prefix of the
//! normalized name; only pairs sharing at least one bucket are scored. Pairs
//! that share no bucket are never scored at all. That trades a little recall
//! (e.g. a renamed business that also changed its number) for avoiding the
//! quadratic scan.

use log::{debug, info, warn};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::config::CandidateConfig;
use crate::matching::similarity::{NormalizedBusiness, SimilarityScorer};
use crate::models::{Business, BusinessId, CandidatePair, PairKey};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub businesses: usize,
    pub buckets: usize,
    pub oversized_buckets: usize,
    pub pairs_compared: usize,
    pub pairs_excluded: usize,
    pub pairs_below_threshold: usize,
    pub candidates: usize,
}

/// Candidate pairs in descending score order, handed out one at a time.
#[derive(Debug)]
pub struct CandidatePairs {
    heap: BinaryHeap<CandidatePair>,
    pub stats: CandidateStats,
}

impl CandidatePairs {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Iterator for CandidatePairs {
    type Item = CandidatePair;

    fn next(&mut self) -> Option<Self::Item> {
        self.heap.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), Some(self.heap.len()))
    }
}

pub struct CandidatePairGenerator {
    config: CandidateConfig,
    scorer: SimilarityScorer,
}

impl CandidatePairGenerator {
    pub fn new(config: CandidateConfig) -> Self {
        let scorer = SimilarityScorer::new(config.weights);
        Self { config, scorer }
    }

    fn blocking_keys(&self, business: &NormalizedBusiness) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(phone) = &business.phone {
            keys.push(format!("phone:{}", phone));
        }
        if let Some(name) = &business.name {
            let prefix: String = name
                .chars()
                .filter(|c| !c.is_whitespace())
                .take(self.config.name_prefix_len.max(1))
                .collect();
            if !prefix.is_empty() {
                keys.push(format!("name:{}", prefix));
            }
        }
        keys
    }

    /// Scores every same-bucket pair of active businesses and keeps those
    /// above the threshold. `excluded` pairs (operator-confirmed distinct) are
    /// never scored. When `targets` is non-empty only pairs touching one of
    /// those ids are kept.
    pub fn generate(
        &self,
        businesses: &[Business],
        excluded: &HashSet<PairKey>,
        targets: &[BusinessId],
    ) -> CandidatePairs {
        let normalized: Vec<NormalizedBusiness> = businesses
            .iter()
            .filter(|b| b.active)
            .map(NormalizedBusiness::from_business)
            .collect();
        let target_set: HashSet<BusinessId> = targets.iter().copied().collect();

        let mut stats = CandidateStats {
            businesses: normalized.len(),
            ..Default::default()
        };

        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, business) in normalized.iter().enumerate() {
            for key in self.blocking_keys(business) {
                buckets.entry(key).or_default().push(idx);
            }
        }
        stats.buckets = buckets.len();

        let mut seen: HashSet<PairKey> = HashSet::new();
        let mut heap = BinaryHeap::new();

        for (key, members) in &buckets {
            if members.len() < 2 {
                continue;
            }
            if members.len() > self.config.max_bucket_size {
                stats.oversized_buckets += 1;
                warn!(
                    "Skipping blocking bucket '{}' with {} members (max {})",
                    key,
                    members.len(),
                    self.config.max_bucket_size
                );
                continue;
            }

            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let a = &normalized[members[i]];
                    let b = &normalized[members[j]];
                    if a.id == b.id {
                        continue;
                    }
                    let pair = PairKey::new(a.id, b.id);
                    if !seen.insert(pair) {
                        continue;
                    }
                    if !target_set.is_empty()
                        && !target_set.contains(&pair.0)
                        && !target_set.contains(&pair.1)
                    {
                        continue;
                    }
                    if excluded.contains(&pair) {
                        stats.pairs_excluded += 1;
                        continue;
                    }

                    stats.pairs_compared += 1;
                    let similarity = self.scorer.score_normalized(a, b);
                    if similarity.score > self.config.threshold {
                        heap.push(CandidatePair {
                            pair,
                            score: similarity.score,
                            breakdown: similarity.breakdown,
                        });
                    } else {
                        stats.pairs_below_threshold += 1;
                        debug!(
                            "Pair ({}, {}) below threshold: {:.3}",
                            pair.0, pair.1, similarity.score
                        );
                    }
                }
            }
        }

        stats.candidates = heap.len();
        info!(
            "Candidate generation: {} businesses → {} buckets → {} pairs compared → {} candidates ({} excluded, {} oversized buckets)",
            stats.businesses,
            stats.buckets,
            stats.pairs_compared,
            stats.candidates,
            stats.pairs_excluded,
            stats.oversized_buckets
        );

        CandidatePairs { heap, stats }
    }
}
