//! In-memory query executor.
//!
//! Serves a fixed set of rows and evaluates the predicate shapes the
//! engine itself produces (`"col" = ?`, `"col" IN (?, ..)`, and range
//! comparisons joined by AND). Anything else is reported as a backend
//! error rather than silently returning every row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{BackendError, Query, QueryExecutor, QueryParam, Row};
use crate::engine::normalizer::parse_timestamp;

pub struct MemoryExecutor {
    backend_id: String,
    rows: Vec<Row>,
    /// Parameter values that make a query fail (simulated outages).
    failing_values: HashSet<String>,
    calls: AtomicUsize,
    log: Mutex<Vec<Query>>,
}

impl MemoryExecutor {
    pub fn new(backend_id: &str, rows: Vec<Row>) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            rows,
            failing_values: HashSet::new(),
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Load rows from a JSON array of objects.
    pub fn from_json_file(backend_id: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let records: Vec<serde_json::Map<String, Value>> = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse fixture {}", path.display()))?;

        info!(path = %path.display(), rows = records.len(), "Fixture rows loaded");
        Ok(Self::new(backend_id, records.into_iter().map(Row::from).collect()))
    }

    /// Fail every query bound to `value` (e.g. a round id).
    pub fn with_failing_value(mut self, value: &str) -> Self {
        self.failing_values.insert(value.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every query received so far, in order.
    pub async fn queries(&self) -> Vec<Query> {
        self.log.lock().await.clone()
    }

    fn error(&self, message: impl Into<String>) -> BackendError {
        BackendError::new(&self.backend_id, message)
    }

    fn evaluate(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        let predicates = parse_predicates(&query.text, &query.params).map_err(|m| self.error(m))?;
        Ok(self
            .rows
            .iter()
            .filter(|row| predicates.iter().all(|p| p.matches(row)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn execute(&self, backend_id: &str, query: &Query) -> Result<Vec<Row>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().await.push(query.clone());

        if backend_id != self.backend_id {
            return Err(self.error(format!("unknown backend '{backend_id}'")));
        }

        let failing = query.params.iter().any(|p| match p {
            QueryParam::Text(s) => self.failing_values.contains(s),
            QueryParam::Timestamp(_) => false,
        });
        if failing {
            return Err(self.error("simulated backend failure"));
        }

        let rows = self.evaluate(query)?;
        debug!(rows = rows.len(), query = %query, "Memory query executed");
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Predicate evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Ge,
    Gt,
    Le,
    Lt,
}

/// Longer symbols first so `>=` is not read as `>`.
const OPERATORS: [(&str, Option<CmpOp>); 5] = [
    (">=", Some(CmpOp::Ge)),
    ("<=", Some(CmpOp::Le)),
    (">", Some(CmpOp::Gt)),
    ("<", Some(CmpOp::Lt)),
    ("=", None),
];

#[derive(Debug)]
enum Predicate {
    In { field: String, values: Vec<QueryParam> },
    Cmp { field: String, op: CmpOp, value: QueryParam },
}

impl Predicate {
    fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::In { field, values } => {
                let Some(cell) = row.get(field).and_then(cell_text) else {
                    return false;
                };
                values
                    .iter()
                    .any(|v| matches!(v, QueryParam::Text(s) if *s == cell))
            }
            Predicate::Cmp { field, op, value } => {
                let Some(cell) = row.get(field) else {
                    return false;
                };
                let ordering = match value {
                    QueryParam::Timestamp(bound) => match parse_timestamp(cell) {
                        Some(ts) => ts.cmp(bound),
                        None => return false,
                    },
                    QueryParam::Text(bound) => match cell_text(cell) {
                        Some(text) => text.as_str().cmp(bound.as_str()),
                        None => return false,
                    },
                };
                match op {
                    CmpOp::Ge => ordering.is_ge(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Lt => ordering.is_lt(),
                }
            }
        }
    }
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse the outermost WHERE clause the engine generates. The FROM part
/// of the statement, a seed template included, is ignored: a memory
/// executor holds a single table.
fn parse_predicates(text: &str, params: &[QueryParam]) -> Result<Vec<Predicate>, String> {
    let upper = text.to_ascii_uppercase();
    let Some(pos) = upper.rfind(" WHERE ") else {
        if !params.is_empty() {
            return Err("parameters supplied without a WHERE clause".to_string());
        }
        return Ok(Vec::new());
    };

    let mut params = params.iter();
    let mut predicates = Vec::new();

    for clause in split_and(&text[pos + " WHERE ".len()..]) {
        let (field, rest) = parse_ident(clause.trim())
            .ok_or_else(|| format!("unsupported predicate: {clause}"))?;
        let rest = rest.trim();

        if let Some(list) = strip_prefix_ci(rest, "IN") {
            let list = list.trim();
            let inner = list
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| format!("malformed IN list: {clause}"))?;
            let mut values = Vec::new();
            for slot in inner.split(',') {
                if slot.trim() != "?" {
                    return Err(format!("literal in IN list: {clause}"));
                }
                values.push(next_param(&mut params, clause)?);
            }
            predicates.push(Predicate::In { field, values });
            continue;
        }

        let (op, operand) = OPERATORS
            .iter()
            .find_map(|(sym, op)| rest.strip_prefix(*sym).map(|operand| (*op, operand)))
            .ok_or_else(|| format!("unsupported operator: {clause}"))?;

        if operand.trim() != "?" {
            return Err(format!("literal operand: {clause}"));
        }
        let value = next_param(&mut params, clause)?;
        predicates.push(match op {
            Some(op) => Predicate::Cmp { field, op, value },
            None => Predicate::In { field, values: vec![value] },
        });
    }

    if params.next().is_some() {
        return Err("more parameters than placeholders".to_string());
    }
    Ok(predicates)
}

fn next_param<'a>(
    params: &mut impl Iterator<Item = &'a QueryParam>,
    clause: &str,
) -> Result<QueryParam, String> {
    params
        .next()
        .cloned()
        .ok_or_else(|| format!("missing parameter for: {clause}"))
}

/// Split on top-level ` AND ` (case-insensitive).
fn split_and(s: &str) -> Vec<&str> {
    let upper = s.to_ascii_uppercase();
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(idx) = upper[start..].find(" AND ") {
        parts.push(&s[start..start + idx]);
        start += idx + " AND ".len();
    }
    parts.push(&s[start..]);
    parts
}

/// Parse a leading `"identifier"` and return it with the remaining text.
fn parse_ident(s: &str) -> Option<(String, &str)> {
    let rest = s.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((rest[..end].to_string(), &rest[end + 1..]))
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
