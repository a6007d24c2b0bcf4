//! Traversal context.
//!
//! Everything one detection run knows: the round worklist, which rounds
//! and accounts have been seen, the accumulated statistics and the
//! matched bets. Owned by the controller for the whole run and turned
//! into a `DetectionReport` at the end.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::accumulator::StatsAccumulator;
use crate::engine::classifier::SuspicionClassifier;
use crate::engine::matcher::RoundMatch;
use crate::types::{
    AccountId, AccountReport, BetRecord, DetectionError, DetectionReport, FetchFailure,
    FetchTarget, RoundId, RunOutcome, SideTotals,
};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    Idle,
    Seeding,
    Expanding,
    Classifying,
    Done,
    Cancelled,
}

impl fmt::Display for TraversalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraversalState::Idle => "idle",
            TraversalState::Seeding => "seeding",
            TraversalState::Expanding => "expanding",
            TraversalState::Classifying => "classifying",
            TraversalState::Done => "done",
            TraversalState::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct TraversalContext {
    pub run_id: Uuid,
    state: TraversalState,
    processed_rounds: HashSet<RoundId>,
    failed_rounds: HashSet<RoundId>,
    frontier: VecDeque<RoundId>,
    queued: HashSet<RoundId>,
    seed_accounts: HashSet<AccountId>,
    promoted: Vec<AccountId>,
    promoted_set: HashSet<AccountId>,
    /// Bets of every processed round, keyed by round.
    round_groups: HashMap<RoundId, Vec<BetRecord>>,
    accumulator: StatsAccumulator,
    matched_bets: Vec<BetRecord>,
    side_totals: SideTotals,
    failures: Vec<FetchFailure>,
    malformed_records: usize,
    truncated: bool,
    cancel: CancelFlag,
    started_at: DateTime<Utc>,
}

impl TraversalContext {
    pub fn new(run_id: Uuid, cancel: CancelFlag) -> Self {
        Self {
            run_id,
            state: TraversalState::Idle,
            processed_rounds: HashSet::new(),
            failed_rounds: HashSet::new(),
            frontier: VecDeque::new(),
            queued: HashSet::new(),
            seed_accounts: HashSet::new(),
            promoted: Vec::new(),
            promoted_set: HashSet::new(),
            round_groups: HashMap::new(),
            accumulator: StatsAccumulator::new(),
            matched_bets: Vec::new(),
            side_totals: SideTotals::default(),
            failures: Vec::new(),
            malformed_records: 0,
            truncated: false,
            cancel,
            started_at: Utc::now(),
        }
    }

    // -- state -------------------------------------------------------------

    pub fn state(&self) -> TraversalState {
        self.state
    }

    pub fn transition(&mut self, next: TraversalState) {
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // -- accounts ----------------------------------------------------------

    pub fn set_seed_accounts(&mut self, accounts: &[AccountId]) {
        self.seed_accounts = accounts.iter().cloned().collect();
    }

    pub fn is_seed(&self, account: &str) -> bool {
        self.seed_accounts.contains(account)
    }

    /// Mark `account` promoted. Returns `false` if it was already a seed
    /// or promoted earlier.
    pub fn promote(&mut self, account: &AccountId) -> bool {
        if self.is_seed(account) || !self.promoted_set.insert(account.clone()) {
            return false;
        }
        self.promoted.push(account.clone());
        true
    }

    pub fn is_promoted(&self, account: &str) -> bool {
        self.promoted_set.contains(account)
    }

    // -- worklist ----------------------------------------------------------

    /// Queue a round unless it is already queued, processed or failed.
    pub fn enqueue_round(&mut self, round_id: &str) -> bool {
        if self.is_seen(round_id) || self.queued.contains(round_id) {
            return false;
        }
        self.queued.insert(round_id.to_string());
        self.frontier.push_back(round_id.to_string());
        true
    }

    /// Queue the rounds of `bets` in encounter order. Returns how many were new.
    pub fn enqueue_rounds_of(&mut self, bets: &[BetRecord]) -> usize {
        bets.iter()
            .filter(|b| self.enqueue_round(&b.round_id))
            .count()
    }

    pub fn next_round(&mut self) -> Option<RoundId> {
        let round = self.frontier.pop_front()?;
        self.queued.remove(&round);
        Some(round)
    }

    pub fn frontier_len(&self) -> usize {
        self.frontier.len()
    }

    /// Drop the remaining worklist. Returns how many rounds were dropped.
    pub fn discard_frontier(&mut self) -> usize {
        let dropped = self.frontier.len();
        self.frontier.clear();
        self.queued.clear();
        dropped
    }

    // -- rounds ------------------------------------------------------------

    /// Whether a round has already been processed or has failed.
    pub fn is_seen(&self, round_id: &str) -> bool {
        self.processed_rounds.contains(round_id) || self.failed_rounds.contains(round_id)
    }

    pub fn rounds_processed(&self) -> usize {
        self.processed_rounds.len()
    }

    /// Store a fetched round and mark it processed.
    pub fn insert_round(&mut self, round_id: &str, bets: Vec<BetRecord>) {
        self.processed_rounds.insert(round_id.to_string());
        self.round_groups.insert(round_id.to_string(), bets);
    }

    pub fn mark_failed(&mut self, round_id: &str, message: String) {
        self.failed_rounds.insert(round_id.to_string());
        self.failures.push(FetchFailure {
            target: FetchTarget::Round(round_id.to_string()),
            message,
        });
    }

    pub fn record_failure(&mut self, target: FetchTarget, message: String) {
        self.failures.push(FetchFailure { target, message });
    }

    pub fn add_malformed(&mut self, count: usize) {
        self.malformed_records += count;
    }

    /// Fold a matched round into the run totals. On error nothing of the
    /// round is applied.
    pub fn commit_round(&mut self, round_id: &str, round_match: &RoundMatch) -> Result<(), DetectionError> {
        let Some(bets) = self.round_groups.get(round_id) else {
            return Ok(());
        };
        let mut side_totals = self.side_totals.clone();
        for bet in bets {
            side_totals.add(bet.position, bet.wager)?;
        }
        self.accumulator.record_round(round_id, bets, round_match)?;
        self.side_totals = side_totals;
        self.matched_bets.extend(round_match.matched_bets(bets).cloned());
        Ok(())
    }

    pub fn accumulator(&self) -> &StatsAccumulator {
        &self.accumulator
    }

    pub fn set_truncated(&mut self) {
        self.truncated = true;
    }

    // -- report ------------------------------------------------------------

    pub fn into_report(self, outcome: RunOutcome, classifier: &SuspicionClassifier) -> DetectionReport {
        let account_stats: BTreeMap<AccountId, AccountReport> = self
            .accumulator
            .into_stats()
            .into_iter()
            .map(|(id, stats)| {
                let suspicious = classifier.is_suspicious(&stats);
                (id, AccountReport { stats, suspicious })
            })
            .collect();

        let report = DetectionReport {
            run_id: self.run_id,
            outcome,
            matched_bets: self.matched_bets,
            account_stats,
            promoted_accounts: self.promoted,
            side_totals: self.side_totals,
            failures: self.failures,
            malformed_records: self.malformed_records,
            rounds_processed: self.processed_rounds.len(),
            truncated: self.truncated,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        info!(
            run_id = %report.run_id,
            outcome = %report.outcome,
            rounds = report.rounds_processed,
            matched_bets = report.matched_bets.len(),
            suspicious = report.suspicious_accounts().len(),
            "Run finished"
        );
        report
    }
}
