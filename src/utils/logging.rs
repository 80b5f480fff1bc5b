// src/utils/logging.rs - Logging helpers for a dedup batch run
use log::{debug, info, warn};
use std::time::Instant;

use crate::matching::CandidateStats;
use crate::models::{CandidatePair, DedupRunSummary, ReviewReason, RunState};

/// Phase banners with elapsed time, in the same shape for every run.
#[derive(Clone)]
pub struct DedupLogger {
    run_id: String,
    start_time: Instant,
}

impl DedupLogger {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            start_time: Instant::now(),
        }
    }

    fn elapsed(&self) -> f32 {
        self.start_time.elapsed().as_secs_f32()
    }

    pub fn log_start(&self, dry_run: bool) {
        info!(
            "[DEDUP] 🚀 Starting deduplication run {}{}",
            self.run_id,
            if dry_run { " (dry run, nothing will be committed)" } else { "" }
        );
    }

    pub fn log_state(&self, state: RunState) {
        info!(
            "[DEDUP] 🔄 State: {} [+{:.1}s]",
            state.as_str(),
            self.elapsed()
        );
    }

    pub fn log_data_loaded(&self, active: usize, excluded_pairs: usize) {
        info!(
            "[DEDUP] 📊 Loaded {} active businesses, {} operator-confirmed distinct pairs",
            active, excluded_pairs
        );
    }

    pub fn log_candidates(&self, stats: &CandidateStats) {
        let percent_kept = if stats.pairs_compared > 0 {
            (stats.candidates as f64 / stats.pairs_compared as f64) * 100.0
        } else {
            0.0
        };
        info!(
            "[DEDUP] 🎯 Candidates: {} pairs compared → {} above threshold ({:.1}% kept) [+{:.1}s]",
            stats.pairs_compared,
            stats.candidates,
            percent_kept,
            self.elapsed()
        );
    }

    pub fn log_pair(&self, index: usize, total: usize, candidate: &CandidatePair) {
        debug!(
            "[DEDUP] Pair {}/{}: ({}, {}) score {:.3} name={:?} phone={:?} address={:?}",
            index,
            total,
            candidate.first(),
            candidate.second(),
            candidate.score,
            candidate.breakdown.name,
            candidate.breakdown.phone,
            candidate.breakdown.address
        );
    }

    pub fn log_escalation(&self, candidate: &CandidatePair, reason: ReviewReason) {
        info!(
            "[DEDUP] 📝 Escalated ({}, {}) to review: {}",
            candidate.first(),
            candidate.second(),
            reason.as_str()
        );
    }

    pub fn log_pair_error(&self, candidate: &CandidatePair, stage: &str, error: &anyhow::Error) {
        warn!(
            "[DEDUP] ⚠️  {} failed for pair ({}, {}): {:#}",
            stage,
            candidate.first(),
            candidate.second(),
            error
        );
    }

    pub fn log_completion(&self, summary: &DedupRunSummary) {
        info!("=== Deduplication Summary ===");
        info!("Run ID: {}", summary.run_id);
        info!("Final state: {}", summary.state.as_str());
        if summary.cancelled {
            warn!("Run was cancelled before all candidates were processed");
        }
        info!("Active businesses: {}", summary.active_businesses);
        info!("Candidates generated: {}", summary.candidates_generated);
        info!("Pairs considered: {}", summary.pairs_considered);
        if summary.dry_run {
            info!("Would merge (dry run): {}", summary.would_merge);
        } else {
            info!("Merged: {}", summary.merged);
            info!("References rewritten: {}", summary.references_rewritten);
        }
        info!("Escalated to review: {}", summary.escalated);
        for (reason, count) in &summary.escalations_by_reason {
            info!("   {}: {}", reason, count);
        }
        info!("Verified distinct: {}", summary.rejected);
        info!("Skipped (already merged): {}", summary.skipped);
        if summary.errors > 0 {
            warn!("Errors: {}", summary.errors);
        } else {
            info!("Errors: 0");
        }
        info!("Total time: {:.2}s", summary.total_processing_time);
    }
}
