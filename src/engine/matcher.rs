//! Opposite-pair matcher.
//!
//! Looks at one round at a time and finds stakes on opposite positions,
//! placed by different accounts, whose amounts are close enough to cancel
//! each other out. Two passes:
//!
//! 1. Pairwise: every side-A bet against every side-B bet.
//! 2. Grouped: one bet against a greedily accumulated run of bets on the
//!    other side (split-stake collusion), in both directions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::types::{AccountId, BetRecord, Position};

/// Relative difference between two stakes: `|x - y| / max(x, y)`.
/// Two zero stakes have no deviation.
pub fn deviation(x: Decimal, y: Decimal) -> Decimal {
    let max = x.max(y);
    if max.is_zero() {
        Decimal::ZERO
    } else {
        (x - y).abs() / max
    }
}

/// One side-A bet matched against one side-B bet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub side_a: BetRecord,
    pub side_b: BetRecord,
    pub deviation: Decimal,
}

/// One bet matched against several bets on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedGroup {
    pub anchor: BetRecord,
    pub members: Vec<BetRecord>,
    pub deviation: Decimal,
}

/// Outcome of matching one round. `matched[i]` refers to the i-th bet of
/// the slice that was matched.
#[derive(Debug, Clone, Default)]
pub struct RoundMatch {
    pub round_id: String,
    pub matched: Vec<bool>,
    pub pairs: Vec<MatchedPair>,
    pub groups: Vec<MatchedGroup>,
}

impl RoundMatch {
    pub fn has_matches(&self) -> bool {
        self.matched.iter().any(|m| *m)
    }

    /// The matched bets of `bets`, in round order.
    pub fn matched_bets<'a>(&'a self, bets: &'a [BetRecord]) -> impl Iterator<Item = &'a BetRecord> {
        bets.iter()
            .zip(&self.matched)
            .filter(|(_, m)| **m)
            .map(|(b, _)| b)
    }

    pub fn matched_accounts(&self, bets: &[BetRecord]) -> BTreeSet<AccountId> {
        self.matched_bets(bets).map(|b| b.account_id.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct OppositePairMatcher {
    tolerance: Decimal,
}

impl OppositePairMatcher {
    pub fn new(tolerance: Decimal) -> Self {
        Self { tolerance }
    }

    /// Deviation of the two stakes if they count as matched.
    fn within_tolerance(&self, x: Decimal, y: Decimal) -> Option<Decimal> {
        if x == y {
            return Some(Decimal::ZERO);
        }
        let d = deviation(x, y);
        (d <= self.tolerance).then_some(d)
    }

    /// Match all bets of one round.
    pub fn match_round(&self, round_id: &str, bets: &[BetRecord]) -> RoundMatch {
        let side_a: Vec<usize> = side_indices(bets, Position::SideA);
        let side_b: Vec<usize> = side_indices(bets, Position::SideB);

        let mut result = RoundMatch {
            round_id: round_id.to_string(),
            matched: vec![false; bets.len()],
            ..Default::default()
        };

        if side_a.is_empty() || side_b.is_empty() {
            return result;
        }

        for &a in &side_a {
            for &b in &side_b {
                if bets[a].account_id == bets[b].account_id {
                    continue;
                }
                let Some(dev) = self.within_tolerance(bets[a].wager, bets[b].wager) else {
                    continue;
                };
                debug!(
                    round_id,
                    side_a = %bets[a].account_id,
                    side_b = %bets[b].account_id,
                    wager_a = %bets[a].wager,
                    wager_b = %bets[b].wager,
                    deviation = %dev.round_dp(4),
                    "Opposite pair matched"
                );
                result.matched[a] = true;
                result.matched[b] = true;
                result.pairs.push(MatchedPair {
                    side_a: bets[a].clone(),
                    side_b: bets[b].clone(),
                    deviation: dev,
                });
            }
        }

        self.grouped_pass(bets, &side_a, &side_b, &mut result);
        self.grouped_pass(bets, &side_b, &side_a, &mut result);

        result
    }

    /// For each anchor, accumulate opposite bets in encounter order until
    /// the running sum is within tolerance of the anchor's stake.
    fn grouped_pass(
        &self,
        bets: &[BetRecord],
        anchors: &[usize],
        others: &[usize],
        result: &mut RoundMatch,
    ) {
        for &anchor in anchors {
            let mut members: Vec<usize> = Vec::new();
            let mut sum = Decimal::ZERO;

            for &other in others {
                if bets[other].account_id == bets[anchor].account_id {
                    continue;
                }
                // a sum past Decimal::MAX can never match the anchor
                let Some(next) = sum.checked_add(bets[other].wager) else {
                    break;
                };
                sum = next;
                members.push(other);

                let Some(dev) = self.within_tolerance(bets[anchor].wager, sum) else {
                    continue;
                };

                // single-member groups were already seen by the pairwise pass
                if members.len() > 1 {
                    debug!(
                        round_id = %result.round_id,
                        anchor = %bets[anchor].account_id,
                        members = members.len(),
                        anchor_wager = %bets[anchor].wager,
                        group_wager = %sum,
                        "Split-stake group matched"
                    );
                    result.matched[anchor] = true;
                    for &m in &members {
                        result.matched[m] = true;
                    }
                    result.groups.push(MatchedGroup {
                        anchor: bets[anchor].clone(),
                        members: members.iter().map(|&m| bets[m].clone()).collect(),
                        deviation: dev,
                    });
                }
                break;
            }
        }
    }
}

fn side_indices(bets: &[BetRecord], position: Position) -> Vec<usize> {
    bets.iter()
        .enumerate()
        .filter(|(_, b)| b.position == position)
        .map(|(i, _)| i)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
