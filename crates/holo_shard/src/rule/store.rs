//! Atomically swappable rule snapshot.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;

use crate::algorithm::AlgorithmRegistry;

use super::{ShardingRule, ShardingRuleConfig};

/// Holds the active [`ShardingRule`].
///
/// Readers take a cheap `Arc` snapshot and keep using it for the whole
/// statement; [`RuleStore::install`] replaces the rule for later statements
/// only.
#[derive(Debug, Clone)]
pub struct RuleStore {
    current: Arc<RwLock<Arc<ShardingRule>>>,
}

impl RuleStore {
    pub fn new(rule: ShardingRule) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(rule))),
        }
    }

    /// Reads, builds and validates a JSON rule file.
    pub fn load_from_path(
        path: impl AsRef<Path>,
        registry: &AlgorithmRegistry,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(read_rule(path.as_ref(), registry)?))
    }

    pub fn snapshot(&self) -> Arc<ShardingRule> {
        let current = self.current.read();
        Arc::clone(&*current)
    }

    /// Replaces the active rule and returns the previous one.
    pub fn install(&self, rule: ShardingRule) -> Arc<ShardingRule> {
        let tables = rule.table_rules().count();
        let data_sources = rule.data_source_names().len();
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(rule));
        tracing::info!(tables, data_sources, "installed sharding rule");
        previous
    }

    /// Rebuilds the rule from `path`; the active rule is kept on any error.
    pub fn reload_from_path(
        &self,
        path: impl AsRef<Path>,
        registry: &AlgorithmRegistry,
    ) -> anyhow::Result<()> {
        let rule = read_rule(path.as_ref(), registry)?;
        self.install(rule);
        Ok(())
    }
}

fn read_rule(path: &Path, registry: &AlgorithmRegistry) -> anyhow::Result<ShardingRule> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read sharding rules from {}", path.display()))?;
    let config = ShardingRuleConfig::from_json(&text)
        .with_context(|| format!("parse sharding rules in {}", path.display()))?;
    let rule = config
        .build(registry)
        .with_context(|| format!("build sharding rules from {}", path.display()))?;
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn snapshots_survive_install() {
        let registry = AlgorithmRegistry::with_builtins();
        let first = ShardingRuleConfig::from_json(r#"{"data-sources": ["ds_0"]}"#)
            .expect("config")
            .build(&registry)
            .expect("rule");
        let store = RuleStore::new(first);
        let before = store.snapshot();

        let second = ShardingRuleConfig::from_json(r#"{"data-sources": ["ds_0", "ds_1"]}"#)
            .expect("config")
            .build(&registry)
            .expect("rule");
        store.install(second);

        assert_eq!(before.data_source_names().len(), 1);
        assert_eq!(store.snapshot().data_source_names().len(), 2);
    }

    #[test]
    fn failed_reload_keeps_active_rule() {
        let registry = AlgorithmRegistry::with_builtins();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"data-sources": ["ds_0"]}}"#).expect("write");
        let store = RuleStore::load_from_path(file.path(), &registry).expect("load");

        let mut broken = tempfile::NamedTempFile::new().expect("tempfile");
        write!(broken, "{{not json").expect("write");
        let err = store
            .reload_from_path(broken.path(), &registry)
            .expect_err("broken");
        assert!(format!("{err:#}").contains("parse sharding rules"));
        assert_eq!(store.snapshot().data_source_names(), ["ds_0"]);
    }
}
