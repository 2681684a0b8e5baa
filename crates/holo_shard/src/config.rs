//! Process configuration read from `HOLO_SHARD_*` environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::route::RouteEngine;

/// Runtime configuration for one sharding engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HoloShardConfig {
    /// JSON rule file loaded at startup.
    pub rules_path: Option<PathBuf>,
    /// Logs logical and physical SQL at `info` when `true`.
    pub sql_show: bool,
    /// Maximum execution units per statement (`0` disables the guard).
    pub max_execution_units: usize,
    /// Routes to every candidate node when a sharding algorithm rejects a value.
    pub algorithm_fail_open: bool,
}

impl HoloShardConfig {
    /// Loads configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rules_path = lookup("HOLO_SHARD_RULES_PATH")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);
        let sql_show = parse_bool(lookup("HOLO_SHARD_SQL_SHOW"), false)
            .context("HOLO_SHARD_SQL_SHOW")?;
        let max_execution_units = parse_usize(lookup("HOLO_SHARD_MAX_EXECUTION_UNITS"), 0)
            .context("HOLO_SHARD_MAX_EXECUTION_UNITS")?;
        let algorithm_fail_open = parse_bool(lookup("HOLO_SHARD_ALGORITHM_FAIL_OPEN"), false)
            .context("HOLO_SHARD_ALGORITHM_FAIL_OPEN")?;
        Ok(Self {
            rules_path,
            sql_show,
            max_execution_units,
            algorithm_fail_open,
        })
    }

    /// Routing engine honoring the guard and fail-open settings.
    pub fn route_engine(&self) -> RouteEngine {
        RouteEngine::new()
            .with_fail_open(self.algorithm_fail_open)
            .with_max_execution_units(self.max_execution_units)
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional boolean, accepting common truthy and falsy spellings.
fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    let Some(raw) = value else {
        return Ok(default_value);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("invalid bool value: {raw}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<HoloShardConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HoloShardConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_fail_closed_without_a_guard() {
        let config = config(&[]).expect("defaults");
        assert_eq!(config, HoloShardConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = config(&[
            ("HOLO_SHARD_RULES_PATH", "/etc/holo/rules.json"),
            ("HOLO_SHARD_SQL_SHOW", "yes"),
            ("HOLO_SHARD_MAX_EXECUTION_UNITS", "64"),
            ("HOLO_SHARD_ALGORITHM_FAIL_OPEN", "1"),
        ])
        .expect("config");
        assert_eq!(config.rules_path, Some(PathBuf::from("/etc/holo/rules.json")));
        assert!(config.sql_show);
        assert_eq!(config.max_execution_units, 64);
        assert!(config.algorithm_fail_open);
    }

    #[test]
    fn rejects_malformed_values() {
        let err = config(&[("HOLO_SHARD_MAX_EXECUTION_UNITS", "many")]).expect_err("invalid");
        assert!(format!("{err:#}").contains("HOLO_SHARD_MAX_EXECUTION_UNITS"));
        assert!(config(&[("HOLO_SHARD_SQL_SHOW", "maybe")]).is_err());
    }
}
