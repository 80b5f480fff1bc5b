// src/matching/similarity.rs
use strsim::normalized_levenshtein;

use crate::config::SimilarityWeights;
use crate::matching::normalize::{normalize_address, normalize_name, normalize_phone};
use crate::models::{Business, BusinessField, BusinessId, SimilarityBreakdown, SimilarityScore};

/// The three matched fields of a business after normalization. Absent or
/// unusable values are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBusiness {
    pub id: BusinessId,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl NormalizedBusiness {
    pub fn from_business(business: &Business) -> Self {
        let name = {
            let n = normalize_name(&business.name);
            if n.is_empty() {
                // Names made only of punctuation or suffixes still compare on raw text.
                let folded = business
                    .name
                    .to_lowercase()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                Some(folded).filter(|s| !s.is_empty())
            } else {
                Some(n)
            }
        };
        let phone = business
            .populated(BusinessField::Phone)
            .map(normalize_phone)
            .filter(|p| !p.is_empty());
        let address = business
            .populated(BusinessField::Address)
            .map(normalize_address)
            .filter(|a| !a.is_empty());
        Self {
            id: business.id,
            name,
            phone,
            address,
        }
    }
}

/// Edit-distance similarity in [0,1]: 1 for identical strings, 0 when every
/// character of the longer string must change.
pub fn field_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b).clamp(0.0, 1.0)
}

fn compare(a: &Option<String>, b: &Option<String>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(field_similarity(a, b)),
        _ => None,
    }
}

/// Weighted name/phone/address similarity. Pure and deterministic.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityScorer {
    weights: SimilarityWeights,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new(SimilarityWeights::default())
    }
}

impl SimilarityScorer {
    pub fn new(weights: SimilarityWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, a: &Business, b: &Business) -> SimilarityScore {
        self.score_normalized(
            &NormalizedBusiness::from_business(a),
            &NormalizedBusiness::from_business(b),
        )
    }

    /// Fields missing on either side drop out and the remaining weights are
    /// renormalized, so the score stays in [0,1].
    pub fn score_normalized(&self, a: &NormalizedBusiness, b: &NormalizedBusiness) -> SimilarityScore {
        let breakdown = SimilarityBreakdown {
            name: compare(&a.name, &b.name),
            phone: compare(&a.phone, &b.phone),
            address: compare(&a.address, &b.address),
        };

        let weighted = [
            (breakdown.name, self.weights.name),
            (breakdown.phone, self.weights.phone),
            (breakdown.address, self.weights.address),
        ];

        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for (similarity, weight) in weighted {
            if let Some(s) = similarity {
                if weight > 0.0 {
                    total += s * weight;
                    weight_sum += weight;
                }
            }
        }

        let score = if weight_sum > 0.0 {
            (total / weight_sum).clamp(0.0, 1.0)
        } else {
            0.0
        };

        SimilarityScore { score, breakdown }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::business;

    fn scorer() -> SimilarityScorer {
        SimilarityScorer::default()
    }

    #[test]
    fn test_symmetric() {
        let mut a = business(1, "Joe's HVAC");
        a.phone = Some("212-555-0101".into());
        a.address = Some("100 Main St, Springfield".into());
        let mut b = business(2, "Joe Heating and Cooling");
        b.phone = Some("212 555 0199".into());
        let mut c = business(3, "Springfield Roofing Co");
        c.address = Some("12 Elm Street".into());

        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            let xy = scorer().score(x, y);
            let yx = scorer().score(y, x);
            assert_eq!(xy.score, yx.score);
            assert_eq!(xy.breakdown, yx.breakdown);
        }
    }

    #[test]
    fn test_reflexive() {
        let mut a = business(1, "Joe's HVAC");
        a.phone = Some("212-555-0101".into());
        a.address = Some("100 Main St".into());
        let s = scorer().score(&a, &a);
        assert_eq!(s.score, 1.0);
        assert_eq!(s.breakdown.name, Some(1.0));
        assert_eq!(s.breakdown.phone, Some(1.0));
        assert_eq!(s.breakdown.address, Some(1.0));
    }

    #[test]
    fn test_missing_fields_renormalize() {
        let mut a = business(1, "Alpha Plumbing");
        a.phone = Some("212-555-0101".into());
        let mut b = business(2, "Alpha Plumbing");
        b.address = Some("1 Main St".into());

        let s = scorer().score(&a, &b);
        assert_eq!(s.breakdown.phone, None);
        assert_eq!(s.breakdown.address, None);
        assert_eq!(s.score, 1.0);
    }

    #[test]
    fn test_placeholder_phone_is_missing() {
        let mut a = business(1, "Alpha Plumbing");
        a.phone = Some("N/A".into());
        let mut b = business(2, "Alpha Plumbing");
        b.phone = Some("212-555-0101".into());
        assert_eq!(scorer().score(&a, &b).breakdown.phone, None);
    }

    #[test]
    fn test_phone_formatting_scenario() {
        let mut a = business(1, "Joe's HVAC");
        a.phone = Some("212-555-0101".into());
        let mut b = business(2, "Joes HVAC Inc");
        b.phone = Some("(212) 555-0101".into());
        let s = scorer().score(&a, &b);
        assert!(s.score >= 0.85, "score was {}", s.score);
    }

    #[test]
    fn test_dissimilar_records_score_low() {
        let mut a = business(1, "Alpha Plumbing");
        a.phone = Some("212-555-0101".into());
        let mut b = business(2, "Zenith Dental Studio");
        b.phone = Some("415-867-5309".into());
        let s = scorer().score(&a, &b);
        assert!(s.score < 0.5, "score was {}", s.score);
        assert!((0.0..=1.0).contains(&s.score));
    }

    #[test]
    fn test_zero_weight_field_ignored() {
        let scorer = SimilarityScorer::new(SimilarityWeights {
            name: 1.0,
            phone: 0.0,
            address: 0.0,
        });
        let mut a = business(1, "Alpha Plumbing");
        a.phone = Some("212-555-0101".into());
        let mut b = business(2, "Alpha Plumbing");
        b.phone = Some("415-867-5309".into());
        assert_eq!(scorer.score(&a, &b).score, 1.0);
    }
}
