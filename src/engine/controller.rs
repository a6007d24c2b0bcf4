//! Traversal controller — the seed → expand → classify → promote loop.
//!
//! A run starts from the analyst's seed accounts, pulls their bets in the
//! requested window and queues every round they touched. Each round is
//! expanded to its full bet set, matched and folded into the account
//! statistics. Whenever the worklist drains, the classifier runs and any
//! newly suspicious account joins the traversal: its bets are fetched and
//! its unseen rounds queued. The run ends when nothing new is queued.
//!
//! States: `Idle → Seeding → Expanding → Classifying → (Expanding | Done)`,
//! plus `Cancelled` when the cancel flag is raised.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::query::BetQueries;
use crate::backend::{BackendError, QueryExecutor};
use crate::config::{DetectionSettings, SchemaConfig};
use crate::engine::classifier::SuspicionClassifier;
use crate::engine::context::{CancelFlag, TraversalContext, TraversalState};
use crate::engine::expander::RoundExpander;
use crate::engine::matcher::OppositePairMatcher;
use crate::engine::normalizer::BetNormalizer;
use crate::types::{
    AccountId, BetRecord, DetectionError, DetectionReport, FetchTarget, RunOutcome, SeedRequest,
    TimeWindow,
};

/// How an expansion or promotion step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Truncated,
    Cancelled,
}

pub struct TraversalController {
    executor: Arc<dyn QueryExecutor>,
    backend_id: String,
    queries: BetQueries,
    normalizer: BetNormalizer,
    expander: RoundExpander,
    matcher: OppositePairMatcher,
    classifier: SuspicionClassifier,
    settings: DetectionSettings,
}

impl TraversalController {
    /// Build a controller for one backend.
    ///
    /// Fails with `Config` when the settings are out of range or a schema
    /// identifier can't be safely quoted.
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        backend_id: &str,
        schema: &SchemaConfig,
        settings: DetectionSettings,
        seed_template: Option<&str>,
    ) -> Result<Self, DetectionError> {
        settings.validate()?;
        let queries = BetQueries::new(schema, seed_template)?;
        let normalizer = BetNormalizer::new(schema);

        Ok(Self {
            expander: RoundExpander::new(
                executor.clone(),
                backend_id,
                queries.clone(),
                normalizer.clone(),
            ),
            executor,
            backend_id: backend_id.to_string(),
            queries,
            normalizer,
            matcher: OppositePairMatcher::new(settings.tolerance),
            classifier: SuspicionClassifier::from_settings(&settings),
            settings,
        })
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    /// Run one detection to completion or cancellation.
    ///
    /// Only an invalid seed or a failed seed query is an error; failures
    /// after that are recorded in the report and the run carries on.
    pub async fn run(
        &self,
        request: &SeedRequest,
        run_id: Uuid,
        cancel: CancelFlag,
    ) -> Result<DetectionReport, DetectionError> {
        let seeds = request.validated_accounts()?;
        let window = request.window;

        let mut ctx = TraversalContext::new(run_id, cancel);
        ctx.set_seed_accounts(&seeds);

        info!(
            run_id = %run_id,
            seeds = seeds.len(),
            tolerance = %self.settings.tolerance,
            "Detection run starting"
        );

        // -- seeding --------------------------------------------------------
        ctx.transition(TraversalState::Seeding);
        if ctx.is_cancelled() {
            return Ok(self.finish(ctx, RunOutcome::Cancelled));
        }
        let seed_bets = self
            .fetch_account_bets(&mut ctx, &seeds, &window)
            .await
            .map_err(|e| {
                warn!(run_id = %run_id, error = %e, "Seed query failed");
                DetectionError::from(e)
            })?;
        let queued = ctx.enqueue_rounds_of(&seed_bets);
        info!(run_id = %run_id, bets = seed_bets.len(), rounds = queued, "Seed rounds queued");

        // -- expand / classify ----------------------------------------------
        loop {
            ctx.transition(TraversalState::Expanding);
            match self.expand_frontier(&mut ctx).await {
                Step::Cancelled => return Ok(self.finish(ctx, RunOutcome::Cancelled)),
                Step::Truncated => break,
                Step::Continue => {}
            }

            ctx.transition(TraversalState::Classifying);
            if self.promote_suspicious(&mut ctx, &window).await == Step::Cancelled {
                return Ok(self.finish(ctx, RunOutcome::Cancelled));
            }
            if ctx.frontier_len() == 0 {
                break;
            }
        }

        Ok(self.finish(ctx, RunOutcome::Completed))
    }

    fn finish(&self, mut ctx: TraversalContext, outcome: RunOutcome) -> DetectionReport {
        ctx.transition(match outcome {
            RunOutcome::Completed => TraversalState::Done,
            RunOutcome::Cancelled => TraversalState::Cancelled,
        });
        ctx.into_report(outcome, &self.classifier)
    }

    /// Drain the worklist one round at a time.
    async fn expand_frontier(&self, ctx: &mut TraversalContext) -> Step {
        while let Some(round_id) = ctx.next_round() {
            if ctx.is_cancelled() {
                let dropped = ctx.discard_frontier() + 1;
                info!(run_id = %ctx.run_id, dropped, "Run cancelled, discarding frontier");
                return Step::Cancelled;
            }

            if let Some(cap) = self.settings.max_rounds {
                if ctx.rounds_processed() >= cap {
                    let dropped = ctx.discard_frontier() + 1;
                    ctx.set_truncated();
                    warn!(run_id = %ctx.run_id, max_rounds = cap, dropped, "Round cap reached, truncating run");
                    return Step::Truncated;
                }
            }

            // match and commit only once the full bet set of the round is in
            if let Some(bets) = self.expander.expand_round(ctx, &round_id).await {
                let round_match = self.matcher.match_round(&round_id, &bets);
                debug!(
                    round_id = %round_id,
                    pairs = round_match.pairs.len(),
                    groups = round_match.groups.len(),
                    "Round matched"
                );
                if let Err(e) = ctx.commit_round(&round_id, &round_match) {
                    warn!(round_id = %round_id, error = %e, "Round totals overflow, skipping round");
                    ctx.add_malformed(bets.len());
                }
            }
        }
        Step::Continue
    }

    /// Promote every newly suspicious non-seed account and queue its rounds.
    async fn promote_suspicious(&self, ctx: &mut TraversalContext, window: &TimeWindow) -> Step {
        let suspicious = self.classifier.classify(ctx.accumulator().stats());
        let promoted: Vec<AccountId> = suspicious
            .into_iter()
            .filter(|account| !ctx.is_seed(account) && !ctx.is_promoted(account))
            .collect();

        if promoted.is_empty() {
            return Step::Continue;
        }
        // accounts count as promoted only once their bets are requested
        if ctx.is_cancelled() {
            info!(run_id = %ctx.run_id, pending = ?promoted, "Run cancelled before promotion query");
            return Step::Cancelled;
        }
        for account in &promoted {
            ctx.promote(account);
        }

        info!(run_id = %ctx.run_id, accounts = ?promoted, "Promoting suspicious accounts");
        match self.fetch_account_bets(ctx, &promoted, window).await {
            Ok(bets) => {
                let queued = ctx.enqueue_rounds_of(&bets);
                info!(run_id = %ctx.run_id, bets = bets.len(), rounds = queued, "Promoted rounds queued");
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "Promotion query failed, continuing");
                ctx.record_failure(FetchTarget::Accounts(promoted), e.to_string());
            }
        }
        Step::Continue
    }

    async fn fetch_account_bets(
        &self,
        ctx: &mut TraversalContext,
        accounts: &[AccountId],
        window: &TimeWindow,
    ) -> Result<Vec<BetRecord>, BackendError> {
        let query = self.queries.account_bets(accounts, window);
        let rows = self.executor.execute(&self.backend_id, &query).await?;
        let (bets, malformed) = self.normalizer.normalize_rows(&rows);
        ctx.add_malformed(malformed);
        // the window bounds what seeds a round, whatever the backend returned
        let bets: Vec<BetRecord> = bets
            .into_iter()
            .filter(|b| accounts.contains(&b.account_id) && window.contains(b.timestamp))
            .collect();
        debug!(accounts = accounts.len(), rows = rows.len(), bets = bets.len(), "Account bets fetched");
        Ok(bets)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
