//! Player statistics accumulator.
//!
//! Folds matched rounds into per-account counters. Every (account, round)
//! pair is attributed exactly once, no matter how many bets the account
//! placed in the round or how often the round is offered.

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::engine::matcher::RoundMatch;
use crate::types::{AccountId, AccountStats, BetRecord, DetectionError, RoundId};

#[derive(Debug, Default)]
pub struct StatsAccumulator {
    stats: HashMap<AccountId, AccountStats>,
    processed_pairs: HashSet<(AccountId, RoundId)>,
}

/// One account's share of a round: total stake and whether any bet matched.
struct RoundShare {
    wager: Decimal,
    common: bool,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute every account that bet in `round_id`.
    ///
    /// `round_match` must come from matching exactly `bets`. Returns the
    /// number of (account, round) pairs newly attributed.
    ///
    /// The round is applied all or nothing: if any account's totals would
    /// overflow, nothing is recorded and the round is reported malformed.
    pub fn record_round(
        &mut self,
        round_id: &str,
        bets: &[BetRecord],
        round_match: &RoundMatch,
    ) -> Result<usize, DetectionError> {
        let overflow = |account: &str| {
            DetectionError::MalformedRecord(format!(
                "wager total of {account} in round {round_id} overflows"
            ))
        };

        // encounter order keeps attribution deterministic
        let mut order: Vec<&AccountId> = Vec::new();
        let mut shares: HashMap<&AccountId, RoundShare> = HashMap::new();

        for (bet, matched) in bets.iter().zip(&round_match.matched) {
            let share = shares.entry(&bet.account_id).or_insert_with(|| {
                order.push(&bet.account_id);
                RoundShare { wager: Decimal::ZERO, common: false }
            });
            share.wager = share
                .wager
                .checked_add(bet.wager)
                .ok_or_else(|| overflow(bet.account_id.as_str()))?;
            share.common |= *matched;
        }

        let mut updates: Vec<(&AccountId, AccountStats)> = Vec::new();
        for account in order {
            if self.is_attributed(account, round_id) {
                continue;
            }
            let Some(share) = shares.get(account) else {
                continue;
            };

            let mut next = self.stats.get(account.as_str()).cloned().unwrap_or_default();
            if share.common {
                next.common_rounds += 1;
                next.common_wager = next
                    .common_wager
                    .checked_add(share.wager)
                    .ok_or_else(|| overflow(account.as_str()))?;
            } else {
                next.non_common_rounds += 1;
                next.non_common_wager = next
                    .non_common_wager
                    .checked_add(share.wager)
                    .ok_or_else(|| overflow(account.as_str()))?;
            }
            // total_wager() must stay representable too
            next.common_wager
                .checked_add(next.non_common_wager)
                .ok_or_else(|| overflow(account.as_str()))?;
            updates.push((account, next));
        }

        let attributed = updates.len();
        for (account, next) in updates {
            self.processed_pairs.insert((account.clone(), round_id.to_string()));
            self.stats.insert(account.clone(), next);
        }

        debug!(round_id, attributed, "Round attributed");
        Ok(attributed)
    }

    pub fn get(&self, account: &str) -> Option<&AccountStats> {
        self.stats.get(account)
    }

    pub fn stats(&self) -> &HashMap<AccountId, AccountStats> {
        &self.stats
    }

    pub fn is_attributed(&self, account: &str, round_id: &str) -> bool {
        self.processed_pairs
            .contains(&(account.to_string(), round_id.to_string()))
    }

    pub fn into_stats(self) -> HashMap<AccountId, AccountStats> {
        self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
