//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The backend connection string is referenced by env-var name in the
//! config and resolved at runtime into a `SecretString`. Operator
//! overrides saved in the config store (see `storage`) are layered on top
//! of the file values by `DetectionSettings::apply_overrides`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::storage::{self, ConfigStore};
use crate::types::DetectionError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Name the engine uses when addressing the query executor.
    pub id: String,
    /// Env var holding the connection URL (e.g. `sqlite://bets.db`).
    pub url_env: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Per-query deadline enforced by the SQL adapter.
    #[serde(default)]
    pub query_timeout_secs: Option<u64>,
}

fn default_max_connections() -> u32 {
    4
}

/// Tolerance and threshold knobs for one detection run.
///
/// Historical deployments used both 5% and 10% as the wager tolerance,
/// so it is always configurable; 10% is the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSettings {
    /// Max relative deviation between two stakes still treated as matched.
    #[serde(default = "default_tolerance")]
    pub tolerance: Decimal,
    /// Min fraction of an account's rounds that must be matched.
    #[serde(default = "default_threshold")]
    pub round_threshold: Decimal,
    /// Min fraction of an account's wager that must be matched.
    #[serde(default = "default_threshold")]
    pub wager_threshold: Decimal,
    /// Safety cap on processed rounds per run.
    #[serde(default)]
    pub max_rounds: Option<usize>,
}

fn default_tolerance() -> Decimal {
    dec!(0.10)
}

fn default_threshold() -> Decimal {
    dec!(0.5)
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            round_threshold: default_threshold(),
            wager_threshold: default_threshold(),
            max_rounds: None,
        }
    }
}

impl DetectionSettings {
    /// Reject values outside `[0, 1]` and a zero round cap.
    pub fn validate(&self) -> Result<(), DetectionError> {
        let unit = |name: &str, v: Decimal| {
            if v < Decimal::ZERO || v > Decimal::ONE {
                Err(DetectionError::Config(format!(
                    "{name} must be within [0, 1], got {v}"
                )))
            } else {
                Ok(())
            }
        };
        unit("tolerance", self.tolerance)?;
        unit("round_threshold", self.round_threshold)?;
        unit("wager_threshold", self.wager_threshold)?;
        if self.max_rounds == Some(0) {
            return Err(DetectionError::Config(
                "max_rounds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Layer operator overrides from the config store on top of `self`.
    pub fn apply_overrides(&mut self, store: &dyn ConfigStore) -> Result<(), DetectionError> {
        if let Some(v) = storage::get_decimal(store, storage::KEY_TOLERANCE)? {
            self.tolerance = v;
        }
        if let Some(v) = storage::get_decimal(store, storage::KEY_ROUND_THRESHOLD)? {
            self.round_threshold = v;
        }
        if let Some(v) = storage::get_decimal(store, storage::KEY_WAGER_THRESHOLD)? {
            self.wager_threshold = v;
        }
        if let Some(v) = store.get(storage::KEY_MAX_ROUNDS) {
            let cap = v.as_u64().ok_or_else(|| {
                DetectionError::Config(format!(
                    "{} must be a positive integer, got {v}",
                    storage::KEY_MAX_ROUNDS
                ))
            })?;
            self.max_rounds = Some(cap as usize);
        }
        self.validate()
    }
}

/// Column names and position labels of the bet table.
///
/// Different revisions of the round-history table used different column
/// names for the round key, so every field is configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Optionally schema-qualified table, e.g. `public.fraud_round_history`.
    pub table: String,
    pub round_field: String,
    pub account_field: String,
    pub position_field: String,
    pub wager_field: String,
    pub timestamp_field: String,
    pub side_a_label: String,
    pub side_b_label: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            table: "public.fraud_round_history".to_string(),
            round_field: "Game Id".to_string(),
            account_field: "User Id".to_string(),
            position_field: "Bet Position".to_string(),
            wager_field: "BET EUR".to_string(),
            timestamp_field: "Bet Time".to_string(),
            side_a_label: "BANKER".to_string(),
            side_b_label: "PLAYER".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
    /// Finished runs kept for polling; the oldest are evicted first.
    #[serde(default = "default_max_finished_runs")]
    pub max_finished_runs: usize,
}

fn default_max_finished_runs() -> usize {
    50
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8088,
            max_finished_runs: default_max_finished_runs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// JSON document holding operator overrides and saved queries.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: storage::DEFAULT_STORE_FILE.to_string() }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.detection.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to a secret value.
    pub fn resolve_env(env_name: &str) -> Result<SecretString> {
        std::env::var(env_name)
            .map(SecretString::new)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
