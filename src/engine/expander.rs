//! Round expander.
//!
//! Loads the complete bet set of a round, regardless of which accounts
//! placed the bets. Each round is fetched at most once per run; a failed
//! fetch is recorded and the round is not retried.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::query::BetQueries;
use crate::backend::QueryExecutor;
use crate::engine::context::TraversalContext;
use crate::engine::normalizer::BetNormalizer;
use crate::types::{BetRecord, RoundId};

pub struct RoundExpander {
    executor: Arc<dyn QueryExecutor>,
    backend_id: String,
    queries: BetQueries,
    normalizer: BetNormalizer,
}

impl RoundExpander {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        backend_id: &str,
        queries: BetQueries,
        normalizer: BetNormalizer,
    ) -> Self {
        Self {
            executor,
            backend_id: backend_id.to_string(),
            queries,
            normalizer,
        }
    }

    /// Fetch and store one round unless it has been seen already.
    ///
    /// Returns the round's bets, or `None` when it was skipped or the
    /// fetch failed. A failure is recorded in `ctx`.
    pub async fn expand_round(
        &self,
        ctx: &mut TraversalContext,
        round_id: &str,
    ) -> Option<Vec<BetRecord>> {
        if ctx.is_seen(round_id) {
            return None;
        }

        let query = self.queries.round_bets(round_id);
        match self.executor.execute(&self.backend_id, &query).await {
            Ok(rows) => {
                let (bets, malformed) = self.normalizer.normalize_rows(&rows);
                // rows of other rounds are backend noise, not bets of this round
                let bets: Vec<BetRecord> = bets
                    .into_iter()
                    .filter(|b| b.round_id == round_id)
                    .collect();
                ctx.add_malformed(malformed);
                info!(
                    round_id,
                    rows = rows.len(),
                    bets = bets.len(),
                    malformed,
                    "Round expanded"
                );
                ctx.insert_round(round_id, bets.clone());
                Some(bets)
            }
            Err(e) => {
                warn!(round_id, error = %e, "Round fetch failed, skipping");
                ctx.mark_failed(round_id, e.to_string());
                None
            }
        }
    }

    /// Expand every round in `round_ids`, returning those loaded by this call.
    pub async fn expand(
        &self,
        ctx: &mut TraversalContext,
        round_ids: &[RoundId],
    ) -> Vec<(RoundId, Vec<BetRecord>)> {
        let mut loaded = Vec::new();
        for round_id in round_ids {
            if let Some(bets) = self.expand_round(ctx, round_id).await {
                loaded.push((round_id.clone(), bets));
            }
        }
        loaded
    }
}
