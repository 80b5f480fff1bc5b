// src/config.rs
//! Thresholds, weights and table lists for a dedup run. Everything is read
//! once from the environment and then passed down explicitly.

use anyhow::{bail, Result};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{BusinessField, BusinessId};

static SQL_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)?$").expect("valid regex"));

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable value for {}: '{}'", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

/// Field weights of the similarity scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityWeights {
    pub name: f64,
    pub phone: f64,
    pub address: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            name: 0.5,
            phone: 0.3,
            address: 0.2,
        }
    }
}

impl SimilarityWeights {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: env_or("DEDUP_WEIGHT_NAME", defaults.name),
            phone: env_or("DEDUP_WEIGHT_PHONE", defaults.phone),
            address: env_or("DEDUP_WEIGHT_ADDRESS", defaults.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateConfig {
    /// Pairs must score strictly above this to become candidates.
    pub threshold: f64,
    /// Length of the normalized-name prefix used as a blocking key.
    pub name_prefix_len: usize,
    /// Buckets larger than this are not expanded into pairs.
    pub max_bucket_size: usize,
    pub weights: SimilarityWeights,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            name_prefix_len: 4,
            max_bucket_size: 250,
            weights: SimilarityWeights::default(),
        }
    }
}

impl CandidateConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            threshold: env_or("DEDUP_SIMILARITY_THRESHOLD", defaults.threshold),
            name_prefix_len: env_or("DEDUP_NAME_PREFIX_LEN", defaults.name_prefix_len),
            max_bucket_size: env_or("DEDUP_MAX_BUCKET_SIZE", defaults.max_bucket_size),
            weights: SimilarityWeights::from_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Attempt `n` waits `n * retry_backoff` before the next one.
    pub retry_backoff: Duration,
    pub cost_per_1k_tokens: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.85,
            low_threshold: 0.5,
            max_attempts: 3,
            timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(1000),
            cost_per_1k_tokens: 0.0,
        }
    }
}

impl VerifierConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            high_threshold: env_or("DEDUP_HIGH_CONFIDENCE", defaults.high_threshold),
            low_threshold: env_or("DEDUP_LOW_CONFIDENCE", defaults.low_threshold),
            max_attempts: env_or("DEDUP_VERIFY_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            timeout: Duration::from_secs(env_or("DEDUP_VERIFY_TIMEOUT_SECS", 60u64)),
            retry_backoff: Duration::from_millis(env_or("DEDUP_VERIFY_RETRY_BACKOFF_MS", 1000u64)),
            cost_per_1k_tokens: env_or("DEDUP_COST_PER_1K_TOKENS", defaults.cost_per_1k_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
    pub temperature: f32,
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        Self {
            url: env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.1".to_string()),
            temperature: env_or("OLLAMA_TEMPERATURE", 0.1f32),
        }
    }
}

/// A foreign-key column that points at `businesses.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentTable {
    pub table: String,
    pub column: String,
}

impl DependentTable {
    pub fn new(table: &str, column: &str) -> Result<Self> {
        if !SQL_IDENTIFIER.is_match(table) {
            bail!("Invalid dependent table identifier: '{}'", table);
        }
        if !SQL_IDENTIFIER.is_match(column) || column.contains('.') {
            bail!("Invalid dependent column identifier: '{}'", column);
        }
        Ok(Self {
            table: table.to_string(),
            column: column.to_string(),
        })
    }

    /// Parses `table.column` or `schema.table.column`.
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        match entry.rsplit_once('.') {
            Some((table, column)) => Self::new(table, column),
            None => bail!("Dependent table entry must be table.column, got '{}'", entry),
        }
    }
}

pub fn default_dependent_tables() -> Vec<DependentTable> {
    [
        ("enrichment_features", "business_id"),
        ("generated_assets", "business_id"),
        ("outreach_emails", "business_id"),
        ("api_costs", "business_id"),
    ]
    .iter()
    .map(|(t, c)| DependentTable {
        table: t.to_string(),
        column: c.to_string(),
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    /// Fields whose differing populated values abort an automatic merge.
    pub authoritative_fields: Vec<BusinessField>,
    /// Populated addresses whose normalized similarity falls below this conflict.
    pub address_conflict_threshold: f64,
    pub dependent_tables: Vec<DependentTable>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            authoritative_fields: vec![
                BusinessField::Email,
                BusinessField::Website,
                BusinessField::Phone,
                BusinessField::Address,
            ],
            address_conflict_threshold: 0.7,
            dependent_tables: default_dependent_tables(),
        }
    }
}

impl MergeConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let authoritative_fields = match env::var("DEDUP_AUTHORITATIVE_FIELDS") {
            Ok(raw) => {
                let mut fields = Vec::new();
                for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    match BusinessField::parse(part) {
                        Some(BusinessField::Name) => {
                            warn!("Name cannot be an authoritative field; ignoring");
                        }
                        Some(field) => fields.push(field),
                        None => bail!("Unknown authoritative field '{}'", part),
                    }
                }
                fields
            }
            Err(_) => defaults.authoritative_fields,
        };

        let dependent_tables = match env::var("DEDUP_DEPENDENT_TABLES") {
            Ok(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(DependentTable::parse)
                .collect::<Result<Vec<_>>>()?,
            Err(_) => defaults.dependent_tables,
        };

        Ok(Self {
            authoritative_fields,
            address_conflict_threshold: env_or(
                "DEDUP_ADDRESS_CONFLICT_THRESHOLD",
                defaults.address_conflict_threshold,
            ),
            dependent_tables,
        })
    }
}

/// Top-level configuration of one batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    pub candidates: CandidateConfig,
    pub verifier: VerifierConfig,
    pub merge: MergeConfig,
    pub dry_run: bool,
    /// Stop after this many candidate pairs.
    pub max_pairs: Option<usize>,
    /// Targeted reprocessing: only pairs touching one of these ids.
    pub business_ids: Vec<BusinessId>,
    /// Only consider businesses scraped in this batch.
    pub run_scope: Option<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            candidates: CandidateConfig::default(),
            verifier: VerifierConfig::default(),
            merge: MergeConfig::default(),
            dry_run: false,
            max_pairs: None,
            business_ids: Vec::new(),
            run_scope: None,
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            candidates: CandidateConfig::from_env(),
            verifier: VerifierConfig::from_env(),
            merge: MergeConfig::from_env()?,
            dry_run: env_or("DEDUP_DRY_RUN", false),
            max_pairs: env_opt("DEDUP_MAX_PAIRS"),
            business_ids: Vec::new(),
            run_scope: env::var("DEDUP_RUN_SCOPE").ok().filter(|s| !s.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let v = &self.verifier;
        if !(0.0..=1.0).contains(&v.low_threshold) || !(0.0..=1.0).contains(&v.high_threshold) {
            bail!("Verifier thresholds must lie in [0,1]");
        }
        if v.low_threshold > v.high_threshold {
            bail!(
                "Low confidence threshold ({}) exceeds high threshold ({})",
                v.low_threshold,
                v.high_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.candidates.threshold) {
            bail!("Similarity threshold must lie in [0,1]");
        }
        let w = &self.candidates.weights;
        let weights = [w.name, w.phone, w.address];
        if weights.iter().any(|x| !x.is_finite() || *x < 0.0)
            || weights.iter().sum::<f64>() <= 0.0
        {
            bail!("Similarity weights must be finite, non-negative and not all zero");
        }
        if !v.cost_per_1k_tokens.is_finite() || v.cost_per_1k_tokens < 0.0 {
            bail!("Cost per 1k tokens must be a finite, non-negative number");
        }
        if !(0.0..=1.0).contains(&self.merge.address_conflict_threshold) {
            bail!("Address conflict threshold must lie in [0,1]");
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!("⚙️  Dedup configuration:");
        info!(
            "   Similarity threshold: {:.2} (weights name={:.2} phone={:.2} address={:.2})",
            self.candidates.threshold,
            self.candidates.weights.name,
            self.candidates.weights.phone,
            self.candidates.weights.address
        );
        info!(
            "   Verifier confidence: high={:.2} low={:.2}, {} attempts, {:?} timeout",
            self.verifier.high_threshold,
            self.verifier.low_threshold,
            self.verifier.max_attempts,
            self.verifier.timeout
        );
        info!(
            "   Authoritative fields: {:?}, address conflict below {:.2}",
            self.merge.authoritative_fields, self.merge.address_conflict_threshold
        );
        info!(
            "   Dependent tables: {}",
            self.merge
                .dependent_tables
                .iter()
                .map(|d| format!("{}.{}", d.table, d.column))
                .collect::<Vec<_>>()
                .join(", ")
        );
        if self.dry_run {
            info!("   🧪 DRY RUN: merges are planned but not committed");
        }
        if let Some(limit) = self.max_pairs {
            info!("   Pair limit: {}", limit);
        }
        if !self.business_ids.is_empty() {
            info!("   Targeted business ids: {:?}", self.business_ids);
        }
        if let Some(scope) = &self.run_scope {
            info!("   Scoped to scrape batch: {}", scope);
        }
    }
}
