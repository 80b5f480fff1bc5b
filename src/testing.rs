// src/testing.rs
//! Deterministic stand-ins for the verifier, generative backend and cost sink.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cost::CostTracker;
use crate::models::{Business, PairKey, VerificationDecision, VerificationResult};
use crate::verification::{GenerationOutput, GenerativeBackend, PairContext, PairVerifier};

/// An active business whose `created_at` grows with its id.
pub fn business(id: i64, name: &str) -> Business {
    let created_at = Utc
        .timestamp_opt(1_700_000_000 + id * 60, 0)
        .single()
        .unwrap();
    Business::new(id, name, created_at)
}

pub fn verification(decision: VerificationDecision, confidence: f64) -> VerificationResult {
    VerificationResult {
        decision,
        confidence,
        rationale: format!("stub: {}", decision.as_str()),
        raw_decision: Some(decision),
        model: Some("stub".to_string()),
        prompt_tokens: 0,
        completion_tokens: 0,
        cost: 0.0,
        attempts: 1,
        backend_failed: false,
    }
}

/// Returns a fixed result per pair, or a default one.
pub struct StubVerifier {
    default: VerificationResult,
    overrides: HashMap<PairKey, VerificationResult>,
    calls: Mutex<Vec<PairKey>>,
}

impl StubVerifier {
    pub fn always(decision: VerificationDecision, confidence: f64) -> Self {
        Self {
            default: verification(decision, confidence),
            overrides: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, pair: PairKey, decision: VerificationDecision, confidence: f64) -> Self {
        self.overrides.insert(pair, verification(decision, confidence));
        self
    }

    pub fn calls(&self) -> Vec<PairKey> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PairVerifier for StubVerifier {
    async fn verify(&self, context: &PairContext<'_>) -> VerificationResult {
        let pair = context.candidate.pair;
        self.calls.lock().unwrap().push(pair);
        self.overrides
            .get(&pair)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

pub enum Scripted {
    Reply(GenerationOutput),
    Fail(String),
    /// Never answers within any sane timeout.
    Hang,
}

impl Scripted {
    pub fn reply(text: &str) -> Self {
        Scripted::Reply(GenerationOutput {
            text: text.to_string(),
            prompt_tokens: 100,
            completion_tokens: 20,
        })
    }
}

/// Plays back one scripted step per `generate` call.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Scripted>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _prompt: &str, _schema: &JsonValue) -> Result<GenerationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Scripted::Reply(output)) => Ok(output),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            Some(Scripted::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                bail!("hung call returned")
            }
            None => bail!("script exhausted"),
        }
    }
}

#[derive(Default)]
pub struct RecordingCostTracker {
    recorded: Mutex<Vec<(f64, String)>>,
    fail: bool,
}

impl RecordingCostTracker {
    pub fn failing() -> Self {
        Self {
            recorded: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn recorded(&self) -> Vec<(f64, String)> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl CostTracker for RecordingCostTracker {
    async fn record_cost(&self, amount: f64, category: &str) -> Result<()> {
        if self.fail {
            bail!("cost sink unavailable");
        }
        self.recorded
            .lock()
            .unwrap()
            .push((amount, category.to_string()));
        Ok(())
    }
}
