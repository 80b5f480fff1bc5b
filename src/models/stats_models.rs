// src/models/stats_models.rs
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::review::ReviewReason;

/// Lifecycle of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Started,
    GeneratingCandidates,
    Verifying,
    Merging,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Started => "started",
            RunState::GeneratingCandidates => "generating_candidates",
            RunState::Verifying => "verifying",
            RunState::Merging => "merging",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Verifying and Merging alternate once per pair; any live state may fail.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Started, GeneratingCandidates) => true,
            (GeneratingCandidates, Verifying) | (GeneratingCandidates, Completed) => true,
            (Verifying, Verifying) | (Verifying, Merging) | (Verifying, Completed) => true,
            (Merging, Verifying) | (Merging, Completed) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.can_transition_to(next) {
            bail!(
                "Invalid run state transition: {} -> {}",
                self.as_str(),
                next.as_str()
            );
        }
        *self = next;
        Ok(())
    }
}

/// Counters reported at the end of a run, one per outcome category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub dry_run: bool,
    pub cancelled: bool,
    pub active_businesses: usize,
    pub candidates_generated: usize,
    pub pairs_considered: usize,
    pub merged: usize,
    /// Dry-run only: merges that would have been committed.
    pub would_merge: usize,
    pub escalated: usize,
    /// Verified as distinct with high confidence.
    pub rejected: usize,
    /// One side was no longer active when the pair came up.
    pub skipped: usize,
    pub errors: usize,
    pub escalations_by_reason: BTreeMap<String, usize>,
    pub references_rewritten: u64,
    pub total_processing_time: f64,
    pub failure: Option<String>,
}

impl DedupRunSummary {
    pub fn new(run_id: &str, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at,
            finished_at: None,
            state: RunState::Started,
            dry_run,
            cancelled: false,
            active_businesses: 0,
            candidates_generated: 0,
            pairs_considered: 0,
            merged: 0,
            would_merge: 0,
            escalated: 0,
            rejected: 0,
            skipped: 0,
            errors: 0,
            escalations_by_reason: BTreeMap::new(),
            references_rewritten: 0,
            total_processing_time: 0.0,
            failure: None,
        }
    }

    pub fn record_escalation(&mut self, reason: ReviewReason) {
        self.escalated += 1;
        *self
            .escalations_by_reason
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
    }
}
