//! Shared types for the OPPWATCH engine.
//!
//! These types form the data model used across all modules: the
//! normalised bet record, per-account statistics, the run request and
//! the final detection report. They are kept free of engine logic so the
//! backend adapters, the engine and the API can depend on them without
//! circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Opaque round key as stored by the backend.
pub type RoundId = String;

/// Opaque account key as stored by the backend.
pub type AccountId = String;

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

/// One of the two mutually exclusive outcomes of a round
/// (e.g. banker / player).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Position {
    SideA,
    SideB,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::SideA => write!(f, "SIDE_A"),
            Position::SideB => write!(f, "SIDE_B"),
        }
    }
}

/// A single normalised wager. Built by the bet normaliser from a raw row
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BetRecord {
    pub round_id: RoundId,
    pub account_id: AccountId,
    pub position: Position,
    /// Non-negative stake.
    pub wager: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for BetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {:.2} @ {}",
            self.round_id,
            self.account_id,
            self.position,
            self.wager,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

// ---------------------------------------------------------------------------
// Account statistics
// ---------------------------------------------------------------------------

/// Running totals for one account. Each (account, round) pair lands in
/// exactly one of the two buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStats {
    pub common_rounds: u64,
    pub non_common_rounds: u64,
    pub common_wager: Decimal,
    pub non_common_wager: Decimal,
}

impl AccountStats {
    pub fn total_rounds(&self) -> u64 {
        self.common_rounds + self.non_common_rounds
    }

    pub fn total_wager(&self) -> Decimal {
        self.common_wager + self.non_common_wager
    }

    /// Fraction of rounds in which the account was part of a match.
    /// `None` when no round has been attributed yet.
    pub fn round_ratio(&self) -> Option<Decimal> {
        let total = self.total_rounds();
        if total == 0 {
            None
        } else {
            Some(Decimal::from(self.common_rounds) / Decimal::from(total))
        }
    }

    /// Fraction of wagered volume that was matched.
    /// `None` when the account has no volume at all.
    pub fn wager_ratio(&self) -> Option<Decimal> {
        let total = self.total_wager();
        if total.is_zero() {
            None
        } else {
            Some(self.common_wager / total)
        }
    }
}

impl fmt::Display for AccountStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rounds={}/{} wager={:.2}/{:.2}",
            self.common_rounds,
            self.total_rounds(),
            self.common_wager,
            self.total_wager(),
        )
    }
}

/// Total volume staked on each side across every processed round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideTotals {
    pub side_a: Decimal,
    pub side_b: Decimal,
}

impl SideTotals {
    /// Add `wager` to its side. Fails without changing the totals if the
    /// sum does not fit a `Decimal`.
    pub fn add(&mut self, position: Position, wager: Decimal) -> Result<(), DetectionError> {
        let side = match position {
            Position::SideA => &mut self.side_a,
            Position::SideB => &mut self.side_b,
        };
        *side = side
            .checked_add(wager)
            .ok_or_else(|| DetectionError::MalformedRecord(format!("{position} total overflows")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run request
// ---------------------------------------------------------------------------

/// Optional half-open time window `[start, end)` applied to seed and
/// promotion queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Whether `ts` falls inside the window.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

/// Operator input that starts a detection run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedRequest {
    pub account_ids: Vec<AccountId>,
    #[serde(default)]
    pub window: TimeWindow,
}

impl SeedRequest {
    pub fn new(account_ids: Vec<AccountId>, window: TimeWindow) -> Self {
        Self { account_ids, window }
    }

    /// Build a request from a comma separated id list, the way analysts
    /// paste account ids.
    pub fn from_csv(input: &str, window: TimeWindow) -> Self {
        Self::new(input.split(',').map(|s| s.to_string()).collect(), window)
    }

    /// Trimmed, de-duplicated seed accounts in input order.
    ///
    /// Fails with `InvalidSeed` when nothing usable remains or the time
    /// window is empty.
    pub fn validated_accounts(&self) -> Result<Vec<AccountId>, DetectionError> {
        let mut seen = BTreeSet::new();
        let accounts: Vec<AccountId> = self
            .account_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .filter(|id| seen.insert(id.to_string()))
            .map(String::from)
            .collect();

        if accounts.is_empty() {
            return Err(DetectionError::InvalidSeed(
                "no seed account ids supplied".to_string(),
            ));
        }

        if let (Some(start), Some(end)) = (self.window.start, self.window.end) {
            if start >= end {
                return Err(DetectionError::InvalidSeed(format!(
                    "empty time window: {start} >= {end}"
                )));
            }
        }

        Ok(accounts)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// How a run ended. Cancellation is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a failed backend fetch was trying to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FetchTarget {
    Round(RoundId),
    Accounts(Vec<AccountId>),
}

/// A partial-failure notice: one fetch failed, the run carried on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub target: FetchTarget,
    pub message: String,
}

/// Per-account entry of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReport {
    #[serde(flatten)]
    pub stats: AccountStats,
    pub suspicious: bool,
}

/// Final (or partial, when cancelled) output of a detection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub matched_bets: Vec<BetRecord>,
    pub account_stats: BTreeMap<AccountId, AccountReport>,
    /// Non-seed accounts that were pulled into the traversal.
    pub promoted_accounts: Vec<AccountId>,
    pub side_totals: SideTotals,
    pub failures: Vec<FetchFailure>,
    pub malformed_records: usize,
    pub rounds_processed: usize,
    /// Set when the round cap stopped the traversal early.
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DetectionReport {
    pub fn suspicious_accounts(&self) -> Vec<&AccountId> {
        self.account_stats
            .iter()
            .filter(|(_, r)| r.suspicious)
            .map(|(id, _)| id)
            .collect()
    }

    /// Matched bets placed by suspicious accounts only.
    pub fn suspicious_bets(&self) -> Vec<&BetRecord> {
        self.matched_bets
            .iter()
            .filter(|b| {
                self.account_stats
                    .get(&b.account_id)
                    .is_some_and(|r| r.suspicious)
            })
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == RunOutcome::Cancelled
    }

    /// Whether anything was left out: cancelled, truncated or a fetch failed.
    pub fn is_partial(&self) -> bool {
        self.is_cancelled() || self.truncated || !self.failures.is_empty()
    }
}

impl fmt::Display for DetectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {} {}: rounds={} matched_bets={} accounts={} suspicious={} failures={} malformed={}",
            self.run_id,
            self.outcome,
            self.rounds_processed,
            self.matched_bets.len(),
            self.account_stats.len(),
            self.suspicious_accounts().len(),
            self.failures.len(),
            self.malformed_records,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the detection engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DetectionError {
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Backend error ({backend}): {message}")]
    Backend { backend: String, message: String },

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run task failed: {0}")]
    Task(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
