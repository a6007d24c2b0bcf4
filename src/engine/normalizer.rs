//! Bet normaliser.
//!
//! Turns raw backend rows into `BetRecord`s. Wagers come back from the
//! analytics backends as numbers or as display strings such as
//! `"1,234.50"`, `"1.234,50"` or `"€ 95"`; all of these are accepted.
//! Rows that can't be normalised are skipped with a warning and counted,
//! never fatal to a run.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

use crate::backend::Row;
use crate::config::SchemaConfig;
use crate::types::{BetRecord, DetectionError, Position};

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹', '₩', '₽', '¢'];

#[derive(Debug, Clone)]
pub struct BetNormalizer {
    schema: SchemaConfig,
}

impl BetNormalizer {
    pub fn new(schema: &SchemaConfig) -> Self {
        Self { schema: schema.clone() }
    }

    /// Normalise one row.
    pub fn normalize(&self, row: &Row) -> Result<BetRecord, DetectionError> {
        let s = &self.schema;

        let round_id = id_field(row, &s.round_field)?;
        let account_id = id_field(row, &s.account_field)?;

        let label = row
            .get(&s.position_field)
            .and_then(Value::as_str)
            .ok_or_else(|| missing(&s.position_field))?;
        let position = self.parse_position(label).ok_or_else(|| {
            DetectionError::MalformedRecord(format!(
                "unrecognised position {label:?} (expected {} or {})",
                s.side_a_label, s.side_b_label
            ))
        })?;

        let raw_wager = row.get(&s.wager_field).ok_or_else(|| missing(&s.wager_field))?;
        let wager = parse_wager(raw_wager).ok_or_else(|| {
            DetectionError::MalformedRecord(format!("unparseable wager {raw_wager}"))
        })?;

        let raw_ts = row
            .get(&s.timestamp_field)
            .ok_or_else(|| missing(&s.timestamp_field))?;
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            DetectionError::MalformedRecord(format!("unparseable timestamp {raw_ts}"))
        })?;

        Ok(BetRecord { round_id, account_id, position, wager, timestamp })
    }

    /// Normalise a batch, skipping malformed rows.
    ///
    /// Returns the good records and the number of rows skipped.
    pub fn normalize_rows(&self, rows: &[Row]) -> (Vec<BetRecord>, usize) {
        let mut bets = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            match self.normalize(row) {
                Ok(bet) => bets.push(bet),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "Skipping malformed bet record");
                }
            }
        }
        (bets, skipped)
    }

    fn parse_position(&self, label: &str) -> Option<Position> {
        let label = label.trim();
        if label.eq_ignore_ascii_case(self.schema.side_a_label.trim()) {
            Some(Position::SideA)
        } else if label.eq_ignore_ascii_case(self.schema.side_b_label.trim()) {
            Some(Position::SideB)
        } else {
            None
        }
    }
}

fn missing(field: &str) -> DetectionError {
    DetectionError::MalformedRecord(format!("missing field {field:?}"))
}

/// Ids may come back as text or as integers depending on the backend.
fn id_field(row: &Row, field: &str) -> Result<String, DetectionError> {
    match row.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(missing(field)),
    }
}

// ---------------------------------------------------------------------------
// Wagers
// ---------------------------------------------------------------------------

/// Parse a non-negative wager from a JSON number or a formatted string.
pub fn parse_wager(value: &Value) -> Option<Decimal> {
    let parsed = match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => parse_wager_str(s),
        _ => None,
    };
    parsed.filter(|w| *w >= Decimal::ZERO)
}

/// Parse a locale-formatted amount.
///
/// When both `,` and `.` appear the right-most one is the decimal
/// separator. A lone comma followed by one or two digits is a decimal
/// comma; any other commas are grouping.
pub fn parse_wager_str(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(*c, '\'' | '_') && !CURRENCY_SYMBOLS.contains(c))
        .collect();

    if cleaned.is_empty()
        || !cleaned
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-' | '+'))
    {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(comma), None) => {
            let decimals = cleaned.len() - comma - 1;
            if cleaned.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (None, Some(_)) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    Decimal::from_str(&normalized).ok()
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse a timestamp cell: RFC 3339, common SQL datetime layouts, a bare
/// date, or an integer epoch in seconds or milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    s.parse::<i64>().ok().and_then(from_epoch)
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() > EPOCH_MILLIS_CUTOFF {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
