//! SQLite query executor.
//!
//! Reference SQL adapter built on a `sqlx` connection pool. Parameters
//! are always bound, never interpolated. Timestamps are bound as
//! `YYYY-MM-DD HH:MM:SS` text, the format SQLite's date functions and
//! lexical comparisons agree on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Number, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Query, QueryExecutor, QueryParam, Row};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct SqliteExecutor {
    backend_id: String,
    pool: SqlitePool,
    query_timeout: Option<Duration>,
}

impl SqliteExecutor {
    /// Open a pool against `url` (e.g. `sqlite://bets.db`).
    pub async fn connect(
        backend_id: &str,
        url: &SecretString,
        max_connections: u32,
        query_timeout: Option<Duration>,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url.expose_secret())
            .await
            .with_context(|| format!("Failed to connect backend '{backend_id}'"))?;

        info!(backend = backend_id, max_connections, "SQLite backend connected");
        Ok(Self::from_pool(backend_id, pool, query_timeout))
    }

    pub fn from_pool(backend_id: &str, pool: SqlitePool, query_timeout: Option<Duration>) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            pool,
            query_timeout,
        }
    }

    fn error(&self, message: impl Into<String>) -> BackendError {
        BackendError::new(&self.backend_id, message)
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, backend_id: &str, query: &Query) -> Result<Vec<Row>, BackendError> {
        if backend_id != self.backend_id {
            return Err(self.error(format!("unknown backend '{backend_id}'")));
        }

        let mut statement = sqlx::query(&query.text);
        for param in &query.params {
            statement = match param {
                QueryParam::Text(s) => statement.bind(s.clone()),
                QueryParam::Timestamp(ts) => statement.bind(ts.format(TIMESTAMP_FORMAT).to_string()),
            };
        }

        let fetch = statement.fetch_all(&self.pool);
        let result = match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .map_err(|_| self.error(format!("query timed out after {}s", limit.as_secs())))?,
            None => fetch.await,
        };

        let rows = result.map_err(|e| {
            warn!(backend = %self.backend_id, error = %e, "Query failed");
            self.error(e.to_string())
        })?;

        debug!(backend = %self.backend_id, rows = rows.len(), "Query executed");
        Ok(rows.iter().map(convert_row).collect())
    }
}

fn convert_row(row: &SqliteRow) -> Row {
    let mut out = Row::new();
    for column in row.columns() {
        out.push(column.name(), decode_cell(row, column.ordinal()));
    }
    out
}

/// SQLite is dynamically typed per cell; try the storage classes in turn.
fn decode_cell(row: &SqliteRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    Value::Null
}
