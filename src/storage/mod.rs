//! Config store.
//!
//! Operator-tuned values (tolerance, thresholds, the seed query template)
//! live in a small key/value store rather than in `config.toml`, so they
//! can be changed between runs without touching the deployment config.
//! `JsonFileStore` persists the store as a pretty-printed JSON document;
//! `MemoryStore` is the in-process variant used by tests and the API.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::types::DetectionError;

/// Default store file path.
pub const DEFAULT_STORE_FILE: &str = "oppwatch_store.json";

pub const KEY_TOLERANCE: &str = "detection.tolerance";
pub const KEY_ROUND_THRESHOLD: &str = "detection.round_threshold";
pub const KEY_WAGER_THRESHOLD: &str = "detection.wager_threshold";
pub const KEY_MAX_ROUNDS: &str = "detection.max_rounds";
/// Base SELECT the engine extends with seed predicates.
pub const KEY_SEED_QUERY: &str = "seed_query";

/// Key/value access to operator configuration.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&mut self, key: &str, value: Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, Value>,
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// Store backed by a JSON object on disk. Every `set` rewrites the file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Map<String, Value>,
}

impl JsonFileStore {
    /// Open the store, starting empty if the file doesn't exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            info!(path = %path.display(), "No config store found, starting empty");
            return Ok(Self { path, values: Map::new() });
        }

        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config store {}", path.display()))?;
        let values: Map<String, Value> = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config store {}", path.display()))?;

        info!(path = %path.display(), keys = values.len(), "Config store loaded");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.values)
            .context("Failed to serialise config store")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write config store {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Config store saved");
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        self.save()
    }
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

/// Read a decimal stored either as a JSON number or a numeric string.
pub fn get_decimal(store: &dyn ConfigStore, key: &str) -> Result<Option<Decimal>, DetectionError> {
    let Some(value) = store.get(key) else {
        return Ok(None);
    };
    let parsed = match &value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| DetectionError::Config(format!("{key} is not a number: {value}")))
}

/// The saved seed query template, if any.
pub fn seed_query(store: &dyn ConfigStore) -> Option<String> {
    store
        .get(KEY_SEED_QUERY)
        .and_then(|v| v.as_str().map(str::trim).map(String::from))
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
