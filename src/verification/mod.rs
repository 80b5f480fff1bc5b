// src/verification/mod.rs
//! Duplicate Verifier: asks a generative backend whether a candidate pair is
//! the same business and maps the answer onto a three-state decision.

pub mod ollama;
pub mod parsing;
pub mod prompt;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::time::{sleep, timeout};

use crate::config::VerifierConfig;
use crate::cost::{CostTracker, VERIFICATION_COST_CATEGORY};
use crate::models::{Business, CandidatePair, VerificationDecision, VerificationResult};

pub use ollama::OllamaBackend;
pub use parsing::{parse_verdict, RawVerdict};

/// A candidate pair together with both full records.
#[derive(Debug, Clone, Copy)]
pub struct PairContext<'a> {
    pub candidate: &'a CandidatePair,
    pub first: &'a Business,
    pub second: &'a Business,
}

#[async_trait]
pub trait PairVerifier: Send + Sync {
    /// Never fails: backend problems come back as an `Uncertain` result with
    /// `backend_failed` set.
    async fn verify(&self, context: &PairContext<'_>) -> VerificationResult;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Text generation behind a narrow interface so tests can script it.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str, schema: &JsonValue) -> Result<GenerationOutput>;
}

/// Maps a parsed verdict onto the final decision.
pub fn apply_thresholds(verdict: &RawVerdict, config: &VerifierConfig) -> VerificationDecision {
    if verdict.confidence < config.low_threshold {
        return VerificationDecision::Uncertain;
    }
    if verdict.confidence >= config.high_threshold {
        verdict.decision
    } else {
        VerificationDecision::Uncertain
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    cost: f64,
}

pub struct DuplicateVerifier<B: GenerativeBackend> {
    backend: B,
    config: VerifierConfig,
    cost_tracker: Arc<dyn CostTracker>,
}

impl<B: GenerativeBackend> DuplicateVerifier<B> {
    pub fn new(backend: B, config: VerifierConfig, cost_tracker: Arc<dyn CostTracker>) -> Self {
        Self {
            backend,
            config,
            cost_tracker,
        }
    }

    fn call_cost(&self, output: &GenerationOutput) -> f64 {
        let tokens = output.prompt_tokens as f64 + output.completion_tokens as f64;
        tokens / 1000.0 * self.config.cost_per_1k_tokens
    }

    async fn report_cost(&self, amount: f64) {
        if let Err(e) = self
            .cost_tracker
            .record_cost(amount, VERIFICATION_COST_CATEGORY)
            .await
        {
            warn!("Failed to record verification cost {:.6}: {:#}", amount, e);
        }
    }
}

#[async_trait]
impl<B: GenerativeBackend> PairVerifier for DuplicateVerifier<B> {
    async fn verify(&self, context: &PairContext<'_>) -> VerificationResult {
        let prompt = prompt::build_prompt(context);
        let schema = prompt::response_schema();
        let model = self.backend.model_name().to_string();
        let max_attempts = self.config.max_attempts.max(1);

        let mut usage = Usage::default();
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=max_attempts {
            match timeout(self.config.timeout, self.backend.generate(&prompt, &schema)).await {
                Err(_) => {
                    last_error = format!("timeout after {}s", self.config.timeout.as_secs_f64());
                }
                Ok(Err(e)) => {
                    last_error = format!("backend error: {:#}", e);
                }
                Ok(Ok(output)) => {
                    let cost = self.call_cost(&output);
                    usage.prompt_tokens += output.prompt_tokens;
                    usage.completion_tokens += output.completion_tokens;
                    usage.cost += cost;
                    self.report_cost(cost).await;

                    match parse_verdict(&output.text) {
                        Ok(verdict) => {
                            let decision = apply_thresholds(&verdict, &self.config);
                            debug!(
                                "Verified pair ({}, {}): raw={} confidence={:.3} -> {}",
                                context.candidate.first(),
                                context.candidate.second(),
                                verdict.decision.as_str(),
                                verdict.confidence,
                                decision.as_str()
                            );
                            return VerificationResult {
                                decision,
                                confidence: verdict.confidence,
                                rationale: verdict.rationale,
                                raw_decision: Some(verdict.decision),
                                model: Some(model),
                                prompt_tokens: usage.prompt_tokens,
                                completion_tokens: usage.completion_tokens,
                                cost: usage.cost,
                                attempts: attempt,
                                backend_failed: false,
                            };
                        }
                        Err(e) => {
                            last_error = format!("{:#}", e);
                        }
                    }
                }
            }

            debug!(
                "Verification attempt {}/{} for pair ({}, {}) failed: {}",
                attempt,
                max_attempts,
                context.candidate.first(),
                context.candidate.second(),
                last_error
            );
            if attempt < max_attempts {
                sleep(self.config.retry_backoff * attempt).await;
            }
        }

        let mut result = VerificationResult::failed(&last_error, Some(model), max_attempts);
        result.prompt_tokens = usage.prompt_tokens;
        result.completion_tokens = usage.completion_tokens;
        result.cost = usage.cost;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PairKey, SimilarityBreakdown};
    use crate::testing::{business, RecordingCostTracker, Scripted, ScriptedBackend};
    use std::time::Duration;

    fn fast_config() -> VerifierConfig {
        VerifierConfig {
            timeout: Duration::from_millis(20),
            retry_backoff: Duration::ZERO,
            cost_per_1k_tokens: 0.5,
            ..VerifierConfig::default()
        }
    }

    fn verdict(decision: VerificationDecision, confidence: f64) -> RawVerdict {
        RawVerdict {
            decision,
            confidence,
            rationale: String::new(),
        }
    }

    async fn run(
        backend: ScriptedBackend,
        tracker: Arc<RecordingCostTracker>,
    ) -> VerificationResult {
        let a = business(1, "Joe's HVAC");
        let b = business(2, "Joes HVAC Inc");
        let candidate = CandidatePair {
            pair: PairKey::new(a.id, b.id),
            score: 0.9,
            breakdown: SimilarityBreakdown::default(),
        };
        let verifier = DuplicateVerifier::new(backend, fast_config(), tracker);
        verifier
            .verify(&PairContext {
                candidate: &candidate,
                first: &a,
                second: &b,
            })
            .await
    }

    #[test]
    fn test_thresholds() {
        let config = VerifierConfig::default();
        use VerificationDecision::*;
        assert_eq!(apply_thresholds(&verdict(Duplicate, 0.85), &config), Duplicate);
        assert_eq!(apply_thresholds(&verdict(Duplicate, 0.84), &config), Uncertain);
        assert_eq!(apply_thresholds(&verdict(Duplicate, 0.2), &config), Uncertain);
        assert_eq!(apply_thresholds(&verdict(NotDuplicate, 0.95), &config), NotDuplicate);
        assert_eq!(apply_thresholds(&verdict(NotDuplicate, 0.6), &config), Uncertain);
        assert_eq!(apply_thresholds(&verdict(Uncertain, 0.99), &config), Uncertain);
    }

    #[tokio::test]
    async fn test_confident_duplicate_reports_cost() {
        let backend = ScriptedBackend::new(vec![Scripted::reply(
            r#"{"decision": "duplicate", "confidence": 0.95, "rationale": "same phone"}"#,
        )]);
        let tracker = Arc::new(RecordingCostTracker::default());
        let result = run(backend, tracker.clone()).await;

        assert!(result.is_confirmed_duplicate());
        assert!(!result.backend_failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.model.as_deref(), Some("scripted"));
        let recorded = tracker.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1, VERIFICATION_COST_CATEGORY);
        assert!(recorded[0].0 > 0.0);
    }

    #[tokio::test]
    async fn test_three_timeouts_become_one_failed_result() {
        let backend = ScriptedBackend::new(vec![Scripted::Hang, Scripted::Hang, Scripted::Hang]);
        let calls = backend.calls();
        let result = run(backend, Arc::new(RecordingCostTracker::default())).await;

        assert_eq!(result.decision, VerificationDecision::Uncertain);
        assert!(result.backend_failed);
        assert_eq!(result.attempts, 3);
        assert!(result.rationale.starts_with("verification_failed: timeout"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_output_is_retried() {
        let backend = ScriptedBackend::new(vec![
            Scripted::reply("I think these are the same."),
            Scripted::Fail("rate limited".to_string()),
            Scripted::reply(r#"{"decision": "uncertain", "confidence": 0.7, "rationale": "unclear"}"#),
        ]);
        let tracker = Arc::new(RecordingCostTracker::default());
        let result = run(backend, tracker.clone()).await;

        assert_eq!(result.decision, VerificationDecision::Uncertain);
        assert!(!result.backend_failed);
        assert_eq!(result.attempts, 3);
        // Two responses came back, so two costs; the failed call reported none.
        assert_eq!(tracker.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_persistently_malformed_output_fails() {
        let backend = ScriptedBackend::new(vec![
            Scripted::reply("nope"),
            Scripted::reply("{\"decision\": \"maybe\", \"confidence\": 0.9}"),
            Scripted::reply("still nope"),
        ]);
        let result = run(backend, Arc::new(RecordingCostTracker::default())).await;

        assert!(result.backend_failed);
        assert!(result.rationale.starts_with("verification_failed: malformed verifier response"));
        assert!(result.prompt_tokens > 0);
    }

    #[tokio::test]
    async fn test_cost_tracker_failure_does_not_fail_verification() {
        let backend = ScriptedBackend::new(vec![Scripted::reply(
            r#"{"decision": "not_duplicate", "confidence": 0.9, "rationale": "different cities"}"#,
        )]);
        let tracker = Arc::new(RecordingCostTracker::failing());
        let result = run(backend, tracker).await;
        assert_eq!(result.decision, VerificationDecision::NotDuplicate);
    }
}
