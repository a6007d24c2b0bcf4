//! Data backend integrations.
//!
//! Defines the `QueryExecutor` trait the engine consumes and provides
//! implementations for:
//! - SQLite (via `sqlx`) — reference SQL adapter
//! - In-memory fixture rows — tests, demos and offline replays
//!
//! Backend-specific dialect and connection concerns stay inside the
//! adapters; the engine only ever sees `Query` values with positional
//! `?` placeholders and an ordered parameter list.

pub mod memory;
pub mod query;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::DetectionError;

// ---------------------------------------------------------------------------
// Queries and rows
// ---------------------------------------------------------------------------

/// A bound query parameter. Values never appear in query text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryParam {
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryParam::Text(s) => write!(f, "'{s}'"),
            QueryParam::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// Query text with positional `?` placeholders plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub params: Vec<QueryParam>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), params: Vec::new() }
    }

    pub fn bind(mut self, param: QueryParam) -> Self {
        self.params.push(param);
        self
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
            write!(f, " -- params: [{}]", params.join(", "))?;
        }
        Ok(())
    }
}

/// One result row as ordered field/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, value);
        self
    }

    /// Append a field, replacing an existing field of the same name.
    pub fn push(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<serde_json::Map<String, Value>> for Row {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self { fields: map.into_iter().collect() }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a query executor for a single call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend '{backend}': {message}")]
pub struct BackendError {
    pub backend: String,
    pub message: String,
}

impl BackendError {
    pub fn new(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self { backend: backend.into(), message: message.into() }
    }
}

impl From<BackendError> for DetectionError {
    fn from(e: BackendError) -> Self {
        DetectionError::Backend { backend: e.backend, message: e.message }
    }
}

// ---------------------------------------------------------------------------
// Executor capability
// ---------------------------------------------------------------------------

/// Abstraction over the data backends the engine can query.
///
/// Implementors must bind `Query::params` as real parameters; the engine
/// relies on this to keep account and round ids out of the query text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run `query` against the backend named `backend_id`.
    async fn execute(&self, backend_id: &str, query: &Query) -> Result<Vec<Row>, BackendError>;
}
