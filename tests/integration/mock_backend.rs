//! Mock backend for integration testing.
//!
//! Wraps the in-memory executor with the knobs the engine tests need:
//! a forced error, a cancel trigger fired when a given round is fetched,
//! and a log of every round fetch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use oppwatch::backend::memory::MemoryExecutor;
use oppwatch::backend::{BackendError, Query, QueryExecutor, QueryParam, Row};
use oppwatch::engine::CancelFlag;

pub const BACKEND: &str = "mock";

/// A deterministic backend for the detection pipeline.
pub struct MockBackend {
    inner: MemoryExecutor,
    round_fetches: Arc<Mutex<HashMap<String, usize>>>,
    account_queries: Arc<Mutex<Vec<Vec<String>>>>,
    /// If set, all queries fail with this message.
    force_error: Arc<Mutex<Option<String>>>,
    cancel_on_round: Option<(String, CancelFlag)>,
}

impl MockBackend {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            inner: MemoryExecutor::new(BACKEND, rows),
            round_fetches: Arc::new(Mutex::new(HashMap::new())),
            account_queries: Arc::new(Mutex::new(Vec::new())),
            force_error: Arc::new(Mutex::new(None)),
            cancel_on_round: None,
        }
    }

    /// Raise `flag` as soon as `round_id` has been served.
    pub fn cancel_after_round(mut self, round_id: &str, flag: CancelFlag) -> Self {
        self.cancel_on_round = Some((round_id.to_string(), flag));
        self
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    /// How often each round was fetched.
    pub fn round_fetches(&self) -> HashMap<String, usize> {
        self.round_fetches.lock().unwrap().clone()
    }

    /// Account id lists of every seed/promotion query, in order.
    pub fn account_queries(&self) -> Vec<Vec<String>> {
        self.account_queries.lock().unwrap().clone()
    }
}

fn text_params(query: &Query) -> Vec<String> {
    query
        .params
        .iter()
        .filter_map(|p| match p {
            QueryParam::Text(s) => Some(s.clone()),
            QueryParam::Timestamp(_) => None,
        })
        .collect()
}

#[async_trait]
impl QueryExecutor for MockBackend {
    async fn execute(&self, backend_id: &str, query: &Query) -> Result<Vec<Row>, BackendError> {
        let forced = self.force_error.lock().unwrap().clone();
        if let Some(msg) = forced {
            return Err(BackendError::new(BACKEND, msg));
        }

        let is_account_query = query.text.contains(" IN (");
        let params = text_params(query);
        if is_account_query {
            self.account_queries.lock().unwrap().push(params.clone());
        } else if let Some(round) = params.first() {
            *self.round_fetches.lock().unwrap().entry(round.clone()).or_default() += 1;
        }

        let rows = self.inner.execute(backend_id, query).await?;

        if let Some((round, flag)) = &self.cancel_on_round {
            if !is_account_query && params.first() == Some(round) {
                flag.cancel();
            }
        }
        Ok(rows)
    }
}

/// A bet row in the default column layout.
pub fn bet(round: &str, account: &str, position: &str, wager: impl Into<serde_json::Value>) -> Row {
    Row::new()
        .with("Game Id", round)
        .with("User Id", account)
        .with("Bet Position", position)
        .with("BET EUR", wager)
        .with("Bet Time", "2024-03-01 12:00:00")
}
