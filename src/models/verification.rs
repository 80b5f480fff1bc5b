// src/models/verification.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationDecision {
    Duplicate,
    NotDuplicate,
    Uncertain,
}

impl VerificationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationDecision::Duplicate => "duplicate",
            VerificationDecision::NotDuplicate => "not_duplicate",
            VerificationDecision::Uncertain => "uncertain",
        }
    }
}

/// Outcome of verifying one candidate pair. Logged and attached to review
/// items; never treated as authoritative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub decision: VerificationDecision,
    pub confidence: f64,
    pub rationale: String,
    /// Label the backend returned before thresholds were applied.
    pub raw_decision: Option<VerificationDecision>,
    pub model: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
    pub attempts: u32,
    /// Set when every attempt timed out, errored or returned unparseable output.
    pub backend_failed: bool,
}

impl VerificationResult {
    pub fn failed(cause: &str, model: Option<String>, attempts: u32) -> Self {
        Self {
            decision: VerificationDecision::Uncertain,
            confidence: 0.0,
            rationale: format!("verification_failed: {}", cause),
            raw_decision: None,
            model,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            attempts,
            backend_failed: true,
        }
    }

    pub fn is_confirmed_duplicate(&self) -> bool {
        self.decision == VerificationDecision::Duplicate
    }
}
