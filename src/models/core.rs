// src/models/core.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fmt;

/// Primary key of a row in `public.businesses`. Lower ids are older rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessId(pub i64);

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusinessStatus {
    Pending,
    NeedsReview,
    Merged,
    /// Statuses owned by other pipeline stages (scored, emailed, ...).
    Custom(String),
}

impl BusinessStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BusinessStatus::Pending => "pending",
            BusinessStatus::NeedsReview => "needs_review",
            BusinessStatus::Merged => "merged",
            BusinessStatus::Custom(s) => s.as_str(),
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => BusinessStatus::Pending,
            "needs_review" => BusinessStatus::NeedsReview,
            "merged" => BusinessStatus::Merged,
            _ => BusinessStatus::Custom(s.to_string()),
        }
    }
}

/// Scalar columns of a business that take part in completeness scoring,
/// conflict checks and fill-gaps merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BusinessField {
    Name,
    Phone,
    Address,
    Email,
    Website,
    Category,
}

impl BusinessField {
    pub const ALL: [BusinessField; 6] = [
        BusinessField::Name,
        BusinessField::Phone,
        BusinessField::Address,
        BusinessField::Email,
        BusinessField::Website,
        BusinessField::Category,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessField::Name => "name",
            BusinessField::Phone => "phone",
            BusinessField::Address => "address",
            BusinessField::Email => "email",
            BusinessField::Website => "website",
            BusinessField::Category => "category",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "name" => Some(BusinessField::Name),
            "phone" => Some(BusinessField::Phone),
            "address" => Some(BusinessField::Address),
            "email" => Some(BusinessField::Email),
            "website" => Some(BusinessField::Website),
            "category" => Some(BusinessField::Category),
            _ => None,
        }
    }
}

/// Values scrapers write when a listing has no real data for a field.
const PLACEHOLDER_VALUES: [&str; 14] = [
    "", "-", "--", "n/a", "na", "none", "null", "nil", "unknown", "tbd", "placeholder",
    "not available", "no website", "no email",
];

/// True when a value carries no information (empty, whitespace, or a known placeholder).
pub fn is_placeholder(value: &str) -> bool {
    let folded = value.trim().to_lowercase();
    PLACEHOLDER_VALUES.contains(&folded.as_str())
}

/// A scraped business listing, as stored in `public.businesses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
    pub id: BusinessId,
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub category: Option<String>,
    /// Free-form enrichment output (tech stack, score, ...). Always a JSON object.
    pub attributes: JsonValue,
    pub active: bool,
    pub status: BusinessStatus,
    pub merged_into: Option<BusinessId>,
    /// Scrape batch that produced the row.
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Business {
    pub fn new(id: i64, name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: BusinessId(id),
            name: name.to_string(),
            phone: None,
            address: None,
            email: None,
            website: None,
            category: None,
            attributes: JsonValue::Object(serde_json::Map::new()),
            active: true,
            status: BusinessStatus::Pending,
            merged_into: None,
            run_id: None,
            created_at,
        }
    }

    /// Raw value of a field, `None` if the column is null.
    pub fn field(&self, field: BusinessField) -> Option<&str> {
        match field {
            BusinessField::Name => Some(self.name.as_str()),
            BusinessField::Phone => self.phone.as_deref(),
            BusinessField::Address => self.address.as_deref(),
            BusinessField::Email => self.email.as_deref(),
            BusinessField::Website => self.website.as_deref(),
            BusinessField::Category => self.category.as_deref(),
        }
    }

    /// Value of a field if it carries information (placeholders count as empty).
    pub fn populated(&self, field: BusinessField) -> Option<&str> {
        self.field(field).filter(|v| !is_placeholder(v))
    }

    pub fn set_field(&mut self, field: BusinessField, value: String) {
        match field {
            BusinessField::Name => self.name = value,
            BusinessField::Phone => self.phone = Some(value),
            BusinessField::Address => self.address = Some(value),
            BusinessField::Email => self.email = Some(value),
            BusinessField::Website => self.website = Some(value),
            BusinessField::Category => self.category = Some(value),
        }
    }

    /// Attribute keys with a non-null, non-placeholder value.
    pub fn populated_attribute_keys(&self) -> Vec<String> {
        match &self.attributes {
            JsonValue::Object(map) => map
                .iter()
                .filter(|(_, v)| attribute_is_populated(v))
                .map(|(k, _)| k.clone())
                .collect(),
            _ => Vec::new(),
        }
    }
}

pub fn attribute_is_populated(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !is_placeholder(s),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// SHA-256 over the canonical JSON of every business row, ordered by id.
/// Two snapshots with the same checksum hold identical business data.
pub fn businesses_checksum(businesses: &[Business]) -> String {
    let mut sorted: Vec<&Business> = businesses.iter().collect();
    sorted.sort_by_key(|b| b.id);
    let mut hasher = Sha256::new();
    for business in sorted {
        // Struct field order is fixed, so serialization is stable.
        let row = serde_json::to_vec(business).unwrap_or_default();
        hasher.update(&row);
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_placeholders_count_as_empty() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("  N/A "));
        assert!(is_placeholder("Unknown"));
        assert!(!is_placeholder("joe@joeshvac.com"));

        let mut b = Business::new(1, "Joe's HVAC", at(0));
        b.website = Some("none".to_string());
        b.email = Some("joe@joeshvac.com".to_string());
        assert_eq!(b.populated(BusinessField::Website), None);
        assert_eq!(b.populated(BusinessField::Email), Some("joe@joeshvac.com"));
        assert_eq!(b.populated(BusinessField::Phone), None);
    }

    #[test]
    fn test_status_round_trips_custom_values() {
        assert_eq!(BusinessStatus::from_str("merged"), BusinessStatus::Merged);
        assert_eq!(BusinessStatus::from_str("scored").as_str(), "scored");
    }

    #[test]
    fn test_checksum_ignores_input_order_but_not_content() {
        let a = Business::new(1, "Alpha Plumbing", at(0));
        let b = Business::new(2, "Beta Roofing", at(10));
        let forward = businesses_checksum(&[a.clone(), b.clone()]);
        let backward = businesses_checksum(&[b.clone(), a.clone()]);
        assert_eq!(forward, backward);

        let mut changed = b;
        changed.active = false;
        assert_ne!(forward, businesses_checksum(&[a, changed]));
    }
}
