//! Suspicion classifier.
//!
//! An account is suspicious when both the share of its rounds and the
//! share of its stake that ended up in opposite matches reach the
//! configured thresholds.

use rust_decimal::Decimal;
use std::collections::BTreeSet;

use crate::config::DetectionSettings;
use crate::types::{AccountId, AccountStats};

#[derive(Debug, Clone)]
pub struct SuspicionClassifier {
    round_threshold: Decimal,
    wager_threshold: Decimal,
}

impl SuspicionClassifier {
    pub fn new(round_threshold: Decimal, wager_threshold: Decimal) -> Self {
        Self { round_threshold, wager_threshold }
    }

    pub fn from_settings(settings: &DetectionSettings) -> Self {
        Self::new(settings.round_threshold, settings.wager_threshold)
    }

    pub fn is_suspicious(&self, stats: &AccountStats) -> bool {
        let Some(round_ratio) = stats.round_ratio() else {
            return false;
        };
        if round_ratio < self.round_threshold {
            return false;
        }
        match stats.wager_ratio() {
            Some(ratio) => ratio >= self.wager_threshold,
            // no volume at all: only the round rule can speak
            None => stats.common_rounds > 0,
        }
    }

    /// Every suspicious account in `stats`, sorted.
    pub fn classify<'a, I>(&self, stats: I) -> BTreeSet<AccountId>
    where
        I: IntoIterator<Item = (&'a AccountId, &'a AccountStats)>,
    {
        stats
            .into_iter()
            .filter(|(_, s)| self.is_suspicious(s))
            .map(|(id, _)| id.clone())
            .collect()
    }
}
