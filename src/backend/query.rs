//! Parameterized query construction for bet lookups.
//!
//! Query text is assembled only from operator-configured identifiers
//! (validated and double-quoted) and `?` placeholders. Round ids, account
//! ids and window bounds are always passed as parameters.

use crate::backend::{Query, QueryParam};
use crate::config::SchemaConfig;
use crate::types::{AccountId, DetectionError, TimeWindow};

/// Quote a single SQL identifier.
///
/// Rejects empty names and names containing a double quote or a control
/// character instead of escaping them: a column called `a"b` is far more
/// likely a configuration mistake than a real column.
pub fn quote_ident(name: &str) -> Result<String, DetectionError> {
    if name.trim().is_empty() {
        return Err(DetectionError::Config("empty SQL identifier".to_string()));
    }
    if name.chars().any(|c| c == '"' || c.is_control()) {
        return Err(DetectionError::Config(format!(
            "invalid character in SQL identifier: {name:?}"
        )));
    }
    Ok(format!("\"{name}\""))
}

/// Quote a possibly schema-qualified name (`schema.table`).
pub fn quote_qualified(name: &str) -> Result<String, DetectionError> {
    let parts = name
        .split('.')
        .map(quote_ident)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("."))
}

/// Builds the two query shapes the engine issues.
#[derive(Debug, Clone)]
pub struct BetQueries {
    table: String,
    round_col: String,
    account_col: String,
    timestamp_col: String,
    /// FROM source of account lookups: the bet table, or the operator's
    /// template wrapped as a derived table.
    seed_source: String,
}

impl BetQueries {
    /// Validate the schema identifiers once, up front.
    ///
    /// `seed_template` is the operator's saved base query; when absent the
    /// engine selects every column of the bet table. A template is never
    /// spliced into: the account and window filters apply to its result set.
    pub fn new(schema: &SchemaConfig, seed_template: Option<&str>) -> Result<Self, DetectionError> {
        let table = quote_qualified(&schema.table)?;
        let seed_source = match seed_template.map(str::trim).filter(|s| !s.is_empty()) {
            Some(t) => format!("({}) AS seed", t.trim_end_matches(';').trim_end()),
            None => table.clone(),
        };
        Ok(Self {
            round_col: quote_ident(&schema.round_field)?,
            account_col: quote_ident(&schema.account_field)?,
            timestamp_col: quote_ident(&schema.timestamp_field)?,
            table,
            seed_source,
        })
    }

    /// All bets of one round.
    pub fn round_bets(&self, round_id: &str) -> Query {
        Query::new(format!(
            "SELECT * FROM {} WHERE {} = ?",
            self.table, self.round_col
        ))
        .bind(QueryParam::Text(round_id.to_string()))
    }

    /// Bets of a set of accounts inside `window`, selected from the seed
    /// source.
    pub fn account_bets(&self, accounts: &[AccountId], window: &TimeWindow) -> Query {
        let placeholders = vec!["?"; accounts.len()].join(", ");
        let mut predicates = vec![format!("{} IN ({placeholders})", self.account_col)];
        let mut params: Vec<QueryParam> = accounts
            .iter()
            .map(|a| QueryParam::Text(a.clone()))
            .collect();

        if let Some(start) = window.start {
            predicates.push(format!("{} >= ?", self.timestamp_col));
            params.push(QueryParam::Timestamp(start));
        }
        if let Some(end) = window.end {
            predicates.push(format!("{} < ?", self.timestamp_col));
            params.push(QueryParam::Timestamp(end));
        }

        Query {
            text: format!(
                "SELECT * FROM {} WHERE {}",
                self.seed_source,
                predicates.join(" AND ")
            ),
            params,
        }
    }
}
