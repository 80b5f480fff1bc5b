// src/orchestrator.rs
//! Deduplication Orchestrator: one batch pass from candidate generation to
//! merges and escalations, with per-pair failure isolation.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::DedupConfig;
use crate::db::{DedupStore, MergeReview};
use crate::matching::CandidatePairGenerator;
use crate::merge::{MergeEngine, MergeRequest};
use crate::models::{
    Business, CandidatePair, ConflictPolicy, DedupRunSummary, FieldConflict, MergeOutcome,
    NewReviewItem, PairKey, ReviewReason, RunState, VerificationDecision, VerificationResult,
};
use crate::review::ReviewQueue;
use crate::utils::logging::DedupLogger;
use crate::utils::progress_config::ProgressConfig;
use crate::verification::{PairContext, PairVerifier};

pub struct DedupOrchestrator<S: DedupStore> {
    store: Arc<S>,
    verifier: Arc<dyn PairVerifier>,
    generator: CandidatePairGenerator,
    merge_engine: MergeEngine<S>,
    review_queue: ReviewQueue<S>,
    config: DedupConfig,
    progress: ProgressConfig,
}

/// Run-local state threaded through pair processing.
struct RunContext<'a> {
    run_id: &'a str,
    logger: &'a DedupLogger,
    summary: DedupRunSummary,
}

impl<S: DedupStore> DedupOrchestrator<S> {
    pub fn new(store: Arc<S>, verifier: Arc<dyn PairVerifier>, config: DedupConfig) -> Self {
        Self {
            generator: CandidatePairGenerator::new(config.candidates.clone()),
            merge_engine: MergeEngine::new(store.clone(), config.merge.clone()),
            review_queue: ReviewQueue::new(store.clone()),
            store,
            verifier,
            config,
            progress: ProgressConfig::disabled(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    pub fn review_queue(&self) -> &ReviewQueue<S> {
        &self.review_queue
    }

    pub fn merge_engine(&self) -> &MergeEngine<S> {
        &self.merge_engine
    }

    fn run_description(&self) -> String {
        let mut description = format!(
            "Dedup pass (threshold {:.2}, confidence {:.2}/{:.2})",
            self.config.candidates.threshold,
            self.config.verifier.low_threshold,
            self.config.verifier.high_threshold
        );
        if let Some(scope) = &self.config.run_scope {
            description.push_str(&format!(", scope {}", scope));
        }
        if !self.config.business_ids.is_empty() {
            description.push_str(&format!(", {} targeted ids", self.config.business_ids.len()));
        }
        description
    }

    async fn load_inputs(&self) -> Result<(Vec<Business>, HashSet<PairKey>)> {
        let businesses = self
            .store
            .fetch_active_businesses(self.config.run_scope.as_deref())
            .await
            .context("Failed to load active businesses")?;
        let excluded = self
            .store
            .fetch_distinct_pairs()
            .await
            .context("Failed to load resolved_distinct pairs")?;
        Ok((businesses, excluded))
    }

    /// Runs one batch pass. `Err` only when the store fails before any pair
    /// is processed; the run is then recorded as `failed`. Setting `cancel`
    /// stops the run between pairs.
    pub async fn run(&self, run_id: &str, cancel: &AtomicBool) -> Result<DedupRunSummary> {
        let start_time = Instant::now();
        let logger = DedupLogger::new(run_id);
        let dry_run = self.config.dry_run;
        let mut ctx = RunContext {
            run_id,
            logger: &logger,
            summary: DedupRunSummary::new(run_id, Utc::now(), dry_run),
        };

        logger.log_start(dry_run);
        logger.log_state(ctx.summary.state);

        if !dry_run {
            if let Err(e) = self
                .store
                .record_run_start(run_id, &self.run_description(), dry_run)
                .await
            {
                return Err(self.fail(ctx, start_time, e, false).await);
            }
        }

        ctx.summary.state.transition(RunState::GeneratingCandidates)?;
        logger.log_state(ctx.summary.state);
        let (businesses, excluded) = match self.load_inputs().await {
            Ok(inputs) => inputs,
            Err(e) => return Err(self.fail(ctx, start_time, e, !dry_run).await),
        };
        logger.log_data_loaded(businesses.len(), excluded.len());
        ctx.summary.active_businesses = businesses.len();

        let candidates = self
            .generator
            .generate(&businesses, &excluded, &self.config.business_ids);
        logger.log_candidates(&candidates.stats);
        ctx.summary.candidates_generated = candidates.len();
        drop(businesses);

        let total = match self.config.max_pairs {
            Some(limit) => candidates.len().min(limit),
            None => candidates.len(),
        };
        let pb = self.progress.pairs_bar(total as u64);

        for (index, candidate) in candidates.take(total).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                warn!(
                    "Cancellation requested; stopping after {} of {} pairs",
                    index, total
                );
                ctx.summary.cancelled = true;
                break;
            }
            if ctx.summary.state != RunState::Verifying {
                ctx.summary.state.transition(RunState::Verifying)?;
            }
            logger.log_pair(index + 1, total, &candidate);
            self.process_pair(&candidate, &mut ctx).await?;
            if let Some(pb) = &pb {
                pb.inc(1);
                pb.set_message(format!(
                    "merged {} | review {} | errors {}",
                    ctx.summary.merged + ctx.summary.would_merge,
                    ctx.summary.escalated,
                    ctx.summary.errors
                ));
            }
        }
        if let Some(pb) = pb {
            pb.finish_with_message("Pairs processed");
        }

        ctx.summary.state.transition(RunState::Completed)?;
        logger.log_state(ctx.summary.state);
        ctx.summary.finished_at = Some(Utc::now());
        ctx.summary.total_processing_time = start_time.elapsed().as_secs_f64();

        if !dry_run {
            if let Err(e) = self.store.record_run_finish(&ctx.summary).await {
                warn!("Failed to record completion of run {}: {:#}", run_id, e);
            }
        }
        logger.log_completion(&ctx.summary);
        Ok(ctx.summary)
    }

    async fn fail(
        &self,
        mut ctx: RunContext<'_>,
        start_time: Instant,
        error: anyhow::Error,
        record: bool,
    ) -> anyhow::Error {
        if ctx.summary.state.transition(RunState::Failed).is_ok() {
            ctx.logger.log_state(ctx.summary.state);
        }
        ctx.summary.failure = Some(format!("{:#}", error));
        ctx.summary.finished_at = Some(Utc::now());
        ctx.summary.total_processing_time = start_time.elapsed().as_secs_f64();
        if record {
            if let Err(e) = self.store.record_run_finish(&ctx.summary).await {
                warn!("Failed to record failure of run {}: {:#}", ctx.run_id, e);
            }
        }
        ctx.logger.log_completion(&ctx.summary);
        error.context(format!("Deduplication run {} failed", ctx.run_id))
    }

    /// Both records as they are now, or `None` if either is gone or inactive.
    async fn load_pair(&self, candidate: &CandidatePair) -> Result<Option<(Business, Business)>> {
        let first = self.store.fetch_business(candidate.first()).await?;
        let second = self.store.fetch_business(candidate.second()).await?;
        match (first, second) {
            (Some(a), Some(b)) if a.active && b.active => Ok(Some((a, b))),
            _ => Ok(None),
        }
    }

    /// Only state-machine misuse escapes as `Err`; every pair-level failure
    /// is counted and escalated here.
    async fn process_pair(&self, candidate: &CandidatePair, ctx: &mut RunContext<'_>) -> Result<()> {
        let (first, second) = match self.load_pair(candidate).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!(
                    "Skipping pair ({}, {}): a record was merged earlier in this run",
                    candidate.first(),
                    candidate.second()
                );
                ctx.summary.skipped += 1;
                return Ok(());
            }
            Err(e) => {
                ctx.summary.errors += 1;
                ctx.logger.log_pair_error(candidate, "Loading", &e);
                let details = json!({ "error": format!("{:#}", e) });
                self.escalate(candidate, None, Vec::new(), ReviewReason::ProcessingError, details, ctx)
                    .await;
                return Ok(());
            }
        };
        ctx.summary.pairs_considered += 1;

        let verification = self
            .verifier
            .verify(&PairContext {
                candidate,
                first: &first,
                second: &second,
            })
            .await;

        if verification.backend_failed {
            ctx.summary.errors += 1;
            self.escalate(
                candidate,
                Some(verification),
                Vec::new(),
                ReviewReason::VerificationFailed,
                json!({}),
                ctx,
            )
            .await;
            return Ok(());
        }

        match verification.decision {
            VerificationDecision::NotDuplicate => {
                debug!(
                    "Pair ({}, {}) verified distinct ({:.2})",
                    candidate.first(),
                    candidate.second(),
                    verification.confidence
                );
                ctx.summary.rejected += 1;
            }
            VerificationDecision::Uncertain => {
                self.escalate(
                    candidate,
                    Some(verification),
                    Vec::new(),
                    ReviewReason::VerificationUncertain,
                    json!({}),
                    ctx,
                )
                .await;
            }
            VerificationDecision::Duplicate => {
                ctx.summary.state.transition(RunState::Merging)?;
                self.merge_confirmed(candidate, verification, ctx).await;
            }
        }
        Ok(())
    }

    async fn merge_confirmed(
        &self,
        candidate: &CandidatePair,
        verification: VerificationResult,
        ctx: &mut RunContext<'_>,
    ) {
        let request = MergeRequest {
            first: candidate.first(),
            second: candidate.second(),
            similarity: candidate.breakdown,
            pipeline_run_id: Some(ctx.run_id.to_string()),
            dry_run: self.config.dry_run,
            policy: ConflictPolicy::Abort,
            review: MergeReview {
                reviewer_id: None,
                notes: Some(format!("merged automatically in run {}", ctx.run_id)),
            },
        };

        match self.merge_engine.merge_pair(&request).await {
            Ok(MergeOutcome::Merged(record)) => {
                ctx.summary.merged += 1;
                ctx.summary.references_rewritten += record.total_rows_rewritten();
            }
            Ok(MergeOutcome::DryRun { .. }) => {
                ctx.summary.would_merge += 1;
            }
            Ok(MergeOutcome::Conflict(conflicts)) => {
                self.escalate(
                    candidate,
                    Some(verification),
                    conflicts,
                    ReviewReason::ConflictingAuthoritativeField,
                    json!({}),
                    ctx,
                )
                .await;
            }
            Err(e) => {
                ctx.summary.errors += 1;
                ctx.logger.log_pair_error(candidate, "Merge", &e);
                let details = json!({ "error": format!("{:#}", e) });
                self.escalate(
                    candidate,
                    Some(verification),
                    Vec::new(),
                    ReviewReason::MergeFailed,
                    details,
                    ctx,
                )
                .await;
            }
        }
    }

    /// Dry runs count the escalation but persist nothing.
    async fn escalate(
        &self,
        candidate: &CandidatePair,
        verification: Option<VerificationResult>,
        conflicts: Vec<FieldConflict>,
        reason: ReviewReason,
        details: serde_json::Value,
        ctx: &mut RunContext<'_>,
    ) {
        if self.config.dry_run {
            info!(
                "[DRY RUN] Would escalate ({}, {}) to review: {}",
                candidate.first(),
                candidate.second(),
                reason.as_str()
            );
            ctx.summary.record_escalation(reason);
            return;
        }

        let item = NewReviewItem {
            pair: candidate.pair,
            similarity_score: candidate.score,
            similarity: candidate.breakdown,
            verification,
            conflicts,
            reason,
            details,
            pipeline_run_id: Some(ctx.run_id.to_string()),
        };
        match self.review_queue.escalate(&item).await {
            Ok(_) => {
                ctx.logger.log_escalation(candidate, reason);
                ctx.summary.record_escalation(reason);
            }
            Err(e) => {
                ctx.summary.errors += 1;
                ctx.logger.log_pair_error(candidate, "Escalation", &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierConfig;
    use crate::db::MemoryStore;
    use crate::models::{businesses_checksum, BusinessField, BusinessId, ReviewStatus};
    use crate::testing::{business, RecordingCostTracker, Scripted, ScriptedBackend, StubVerifier};
    use crate::verification::DuplicateVerifier;
    use std::time::Duration;

    fn orchestrator(
        store: &Arc<MemoryStore>,
        verifier: Arc<dyn PairVerifier>,
        config: DedupConfig,
    ) -> DedupOrchestrator<MemoryStore> {
        DedupOrchestrator::new(store.clone(), verifier, config)
    }

    fn duplicate_verifier() -> Arc<dyn PairVerifier> {
        Arc::new(StubVerifier::always(VerificationDecision::Duplicate, 0.95))
    }

    async fn joes_hvac_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        let mut a = business(1, "Joe's HVAC");
        a.phone = Some("212-555-0101".to_string());
        let mut b = business(2, "Joes HVAC Inc");
        b.phone = Some("(212) 555-0101".to_string());
        b.attributes = json!({"rating": 4.8, "review_count": 112});
        store.insert_business(a).await;
        store.insert_business(b).await;
        store.add_reference("generated_assets", BusinessId(1)).await.unwrap();
        store.add_reference("outreach_emails", BusinessId(1)).await.unwrap();
        store.add_reference("enrichment_features", BusinessId(2)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_joes_hvac_is_merged_into_more_complete_record() {
        let store = joes_hvac_store().await;
        let cancel = AtomicBool::new(false);
        let summary = orchestrator(&store, duplicate_verifier(), DedupConfig::default())
            .run("run-hvac", &cancel)
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.candidates_generated, 1);
        assert_eq!(summary.pairs_considered, 1);
        assert_eq!(summary.merged, 1);
        assert_eq!(summary.escalated, 0);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.references_rewritten, 2);

        let survivor = store.fetch_business(BusinessId(2)).await.unwrap().unwrap();
        let merged = store.fetch_business(BusinessId(1)).await.unwrap().unwrap();
        assert!(survivor.active);
        assert_eq!(survivor.attributes["rating"], json!(4.8));
        assert!(!merged.active);
        assert_eq!(merged.merged_into, Some(BusinessId(2)));

        // Referential integrity: nothing points at the merged-away id.
        assert!(store.find_inactive_references().await.unwrap().is_empty());
        assert_eq!(
            store.references("generated_assets").await.unwrap(),
            vec![BusinessId(2)]
        );

        let records = store.merge_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pipeline_run_id.as_deref(), Some("run-hvac"));

        let run = store.run("run-hvac").await.unwrap();
        assert_eq!(run.summary.unwrap().state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_rerun_never_merges_same_pair_twice() {
        let store = joes_hvac_store().await;
        let cancel = AtomicBool::new(false);
        let engine = orchestrator(&store, duplicate_verifier(), DedupConfig::default());
        engine.run("run-1", &cancel).await.unwrap();
        let second = engine.run("run-2", &cancel).await.unwrap();

        assert_eq!(second.candidates_generated, 0);
        assert_eq!(second.merged, 0);
        assert_eq!(store.merge_records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_websites_go_to_review() {
        let store = Arc::new(MemoryStore::default());
        let mut a = business(1, "Acme Plumbing");
        a.address = Some("12 Main St, Springfield".to_string());
        a.website = Some("https://acme-springfield.com".to_string());
        let mut b = business(2, "Acme Plumbing");
        b.address = Some("400 Oak Ave, Shelbyville".to_string());
        b.website = Some("https://acmeplumbing-shelbyville.com".to_string());
        store.insert_business(a).await;
        store.insert_business(b).await;

        let cancel = AtomicBool::new(false);
        let summary = orchestrator(&store, duplicate_verifier(), DedupConfig::default())
            .run("run-conflict", &cancel)
            .await
            .unwrap();

        assert_eq!(summary.merged, 0);
        assert_eq!(summary.escalated, 1);
        assert_eq!(
            summary.escalations_by_reason["conflicting_authoritative_field"],
            1
        );
        let items = store.review_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].reason, ReviewReason::ConflictingAuthoritativeField);
        assert!(items[0]
            .conflicts
            .iter()
            .any(|c| c.field == BusinessField::Website));
        assert!(store.fetch_business(BusinessId(1)).await.unwrap().unwrap().active);
        assert!(store.fetch_business(BusinessId(2)).await.unwrap().unwrap().active);
        assert!(store.merge_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_three_timeouts_escalate_with_one_error() {
        let store = joes_hvac_store().await;
        let config = VerifierConfig {
            timeout: Duration::from_millis(10),
            retry_backoff: Duration::ZERO,
            ..VerifierConfig::default()
        };
        let backend = ScriptedBackend::new(vec![Scripted::Hang, Scripted::Hang, Scripted::Hang]);
        let verifier = DuplicateVerifier::new(
            backend,
            config,
            Arc::new(RecordingCostTracker::default()),
        );

        let cancel = AtomicBool::new(false);
        let summary = orchestrator(&store, Arc::new(verifier), DedupConfig::default())
            .run("run-timeout", &cancel)
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.escalated, 1);
        assert_eq!(summary.merged, 0);

        let items = store.review_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].reason, ReviewReason::VerificationFailed);
        let verification = items[0].verification.as_ref().unwrap();
        assert_eq!(verification.decision, VerificationDecision::Uncertain);
        assert!(verification.rationale.starts_with("verification_failed:"));
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let store = joes_hvac_store().await;
        let before = businesses_checksum(&store.fetch_all_businesses().await.unwrap());
        let config = DedupConfig {
            dry_run: true,
            ..DedupConfig::default()
        };

        let cancel = AtomicBool::new(false);
        let summary = orchestrator(&store, duplicate_verifier(), config)
            .run("run-dry", &cancel)
            .await
            .unwrap();

        assert_eq!(summary.would_merge, 1);
        assert_eq!(summary.merged, 0);
        let after = businesses_checksum(&store.fetch_all_businesses().await.unwrap());
        assert_eq!(before, after);
        assert!(store.merge_records().await.is_empty());
        assert!(store.review_items().await.is_empty());
        assert!(store.run("run-dry").await.is_none());
        assert_eq!(
            store.references("generated_assets").await.unwrap(),
            vec![BusinessId(1)]
        );
    }

    #[tokio::test]
    async fn test_uncertain_and_distinct_outcomes() {
        let store = Arc::new(MemoryStore::default());
        for (id, name) in [(1, "Acme Roofing"), (2, "Acme Roofing"), (3, "Bolt Electric"), (4, "Bolt Electric")] {
            store.insert_business(business(id, name)).await;
        }
        let verifier = StubVerifier::always(VerificationDecision::Uncertain, 0.6).with(
            PairKey::new(BusinessId(3), BusinessId(4)),
            VerificationDecision::NotDuplicate,
            0.92,
        );

        let cancel = AtomicBool::new(false);
        let summary = orchestrator(&store, Arc::new(verifier), DedupConfig::default())
            .run("run-mixed", &cancel)
            .await
            .unwrap();

        assert_eq!(summary.pairs_considered, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.escalated, 1);
        let items = store.review_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].pair, PairKey::new(BusinessId(1), BusinessId(2)));
        assert_eq!(items[0].reason, ReviewReason::VerificationUncertain);
    }

    #[tokio::test]
    async fn test_failed_merge_is_isolated_and_retried_next_run() {
        let store = joes_hvac_store().await;
        store.insert_business(business(10, "Zenith Dental")).await;
        store.insert_business(business(11, "Zenith Dental")).await;
        store.fail_next_merges(1);

        let cancel = AtomicBool::new(false);
        let engine = orchestrator(&store, duplicate_verifier(), DedupConfig::default());
        let first = engine.run("run-1", &cancel).await.unwrap();
        assert_eq!(first.state, RunState::Completed);
        assert_eq!(first.errors, 1);
        assert_eq!(first.merged, 1);
        assert_eq!(first.escalations_by_reason["merge_failed"], 1);

        let second = engine.run("run-2", &cancel).await.unwrap();
        assert_eq!(second.merged, 1);
        assert_eq!(second.errors, 0);
        assert_eq!(store.merge_records().await.len(), 2);
        let item = store
            .fetch_review_item_for_pair(PairKey::new(BusinessId(1), BusinessId(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, ReviewStatus::ResolvedMerge);
        assert_eq!(item.review_notes.as_deref(), Some("merged automatically in run run-2"));
    }

    #[tokio::test]
    async fn test_merged_away_records_are_skipped_within_a_run() {
        let store = Arc::new(MemoryStore::default());
        for id in 1..=3 {
            store.insert_business(business(id, "Acme Roofing")).await;
        }

        let cancel = AtomicBool::new(false);
        let summary = orchestrator(&store, duplicate_verifier(), DedupConfig::default())
            .run("run-triple", &cancel)
            .await
            .unwrap();

        assert_eq!(summary.candidates_generated, 3);
        assert_eq!(summary.merged, 2);
        assert_eq!(summary.skipped, 1);
        let active = store.fetch_active_businesses(None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, BusinessId(1));
    }

    #[tokio::test]
    async fn test_resolved_distinct_pairs_are_not_offered_again() {
        let store = Arc::new(MemoryStore::default());
        store.insert_business(business(1, "Acme Roofing")).await;
        store.insert_business(business(2, "Acme Roofing")).await;
        let verifier = Arc::new(StubVerifier::always(VerificationDecision::Uncertain, 0.6));
        let engine = orchestrator(&store, verifier.clone(), DedupConfig::default());

        let cancel = AtomicBool::new(false);
        engine.run("run-1", &cancel).await.unwrap();
        let item = store.review_items().await.remove(0);
        engine
            .review_queue()
            .resolve(&item.id, ReviewStatus::ResolvedDistinct, Some("ops"), None, engine.merge_engine())
            .await
            .unwrap();

        let second = engine.run("run-2", &cancel).await.unwrap();
        assert_eq!(second.candidates_generated, 0);
        assert_eq!(verifier.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_limit_targets_and_scope() {
        let store = Arc::new(MemoryStore::default());
        for (id, name) in [(1, "Acme Roofing"), (2, "Acme Roofing"), (3, "Bolt Electric"), (4, "Bolt Electric")] {
            let mut b = business(id, name);
            b.run_id = Some(if id <= 2 { "scrape-a" } else { "scrape-b" }.to_string());
            store.insert_business(b).await;
        }
        let cancel = AtomicBool::new(false);

        let limited = DedupConfig {
            max_pairs: Some(1),
            dry_run: true,
            ..DedupConfig::default()
        };
        let summary = orchestrator(&store, duplicate_verifier(), limited)
            .run("run-limit", &cancel)
            .await
            .unwrap();
        assert_eq!(summary.candidates_generated, 2);
        assert_eq!(summary.pairs_considered, 1);

        let targeted = DedupConfig {
            business_ids: vec![BusinessId(4)],
            dry_run: true,
            ..DedupConfig::default()
        };
        let summary = orchestrator(&store, duplicate_verifier(), targeted)
            .run("run-target", &cancel)
            .await
            .unwrap();
        assert_eq!(summary.candidates_generated, 1);

        let scoped = DedupConfig {
            run_scope: Some("scrape-a".to_string()),
            dry_run: true,
            ..DedupConfig::default()
        };
        let summary = orchestrator(&store, duplicate_verifier(), scoped)
            .run("run-scope", &cancel)
            .await
            .unwrap();
        assert_eq!(summary.active_businesses, 2);
        assert_eq!(summary.candidates_generated, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_between_pairs() {
        let store = joes_hvac_store().await;
        let cancel = AtomicBool::new(true);
        let summary = orchestrator(&store, duplicate_verifier(), DedupConfig::default())
            .run("run-cancel", &cancel)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.pairs_considered, 0);
        assert!(store.fetch_business(BusinessId(1)).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_the_run() {
        let store = joes_hvac_store().await;
        store.set_unavailable(true);
        let cancel = AtomicBool::new(false);
        let result = orchestrator(&store, duplicate_verifier(), DedupConfig::default())
            .run("run-down", &cancel)
            .await;
        assert!(result.is_err());
    }
}
