//! Pluggable sharding and key-generation algorithms.
//!
//! Algorithms are resolved by type name through an [`AlgorithmRegistry`]
//! populated at startup. Tests inject doubles by registering their own
//! factories under new (or existing) names.

pub mod builtin;
pub mod inline;
pub mod interval;
pub mod keygen;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, ShardingError};
use crate::value::{ConditionValue, SqlValue, ValueRange};

/// Sharding value for a single `=` / `IN` element.
#[derive(Debug, Clone, Copy)]
pub struct PreciseShardingValue<'a> {
    pub logic_table: &'a str,
    pub column: &'a str,
    pub value: &'a SqlValue,
}

/// Sharding value for a comparison / `BETWEEN` range.
#[derive(Debug, Clone, Copy)]
pub struct RangeShardingValue<'a> {
    pub logic_table: &'a str,
    pub column: &'a str,
    pub range: &'a ValueRange,
}

/// Values of every conditioned column of a complex strategy.
#[derive(Debug, Clone, Copy)]
pub struct ComplexShardingValue<'a> {
    pub logic_table: &'a str,
    pub values: &'a BTreeMap<String, ConditionValue>,
}

/// Values supplied out-of-band through the hint manager.
#[derive(Debug, Clone, Copy)]
pub struct HintShardingValue<'a> {
    pub logic_table: &'a str,
    pub values: &'a [SqlValue],
}

/// Single-column algorithm used by the standard strategy.
pub trait StandardShardingAlgorithm: Send + Sync {
    fn kind(&self) -> &str;

    /// Picks the target for one value. `Ok(None)` means no candidate matches.
    fn do_precise(
        &self,
        targets: &[String],
        value: &PreciseShardingValue<'_>,
    ) -> Result<Option<String>>;

    /// Picks every target that may hold a value inside the range.
    fn do_range(&self, targets: &[String], value: &RangeShardingValue<'_>)
        -> Result<Vec<String>>;
}

/// Multi-column algorithm used by the complex strategy.
pub trait ComplexShardingAlgorithm: Send + Sync {
    fn kind(&self) -> &str;

    fn do_sharding(
        &self,
        targets: &[String],
        value: &ComplexShardingValue<'_>,
    ) -> Result<Vec<String>>;
}

/// Algorithm driven by session hint values instead of statement predicates.
pub trait HintShardingAlgorithm: Send + Sync {
    fn kind(&self) -> &str;

    fn do_sharding(&self, targets: &[String], value: &HintShardingValue<'_>)
        -> Result<Vec<String>>;
}

/// Generates values for a table's key column on INSERT.
pub trait KeyGenerator: Send + Sync {
    fn kind(&self) -> &str;

    fn generate_key(&self) -> Result<SqlValue>;
}

/// A resolved sharding algorithm, tagged with the strategy shape it serves.
#[derive(Clone)]
pub enum ShardingAlgorithm {
    Standard(Arc<dyn StandardShardingAlgorithm>),
    Complex(Arc<dyn ComplexShardingAlgorithm>),
    Hint(Arc<dyn HintShardingAlgorithm>),
}

impl ShardingAlgorithm {
    pub fn kind(&self) -> &str {
        match self {
            ShardingAlgorithm::Standard(algorithm) => algorithm.kind(),
            ShardingAlgorithm::Complex(algorithm) => algorithm.kind(),
            ShardingAlgorithm::Hint(algorithm) => algorithm.kind(),
        }
    }

    /// Strategy type this algorithm can be bound to.
    pub fn capability(&self) -> &'static str {
        match self {
            ShardingAlgorithm::Standard(_) => "standard",
            ShardingAlgorithm::Complex(_) => "complex",
            ShardingAlgorithm::Hint(_) => "hint",
        }
    }
}

impl fmt::Debug for ShardingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardingAlgorithm::{}({})", self.capability(), self.kind())
    }
}

/// String properties an algorithm is configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlgorithmProps(BTreeMap<String, String>);

impl AlgorithmProps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts JSON property values; scalars are stored in their textual form.
    pub fn from_json(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        let props = map
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect();
        Self(props)
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, kind: &str, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            ShardingError::Config(format!("algorithm `{kind}` requires property `{key}`"))
        })
    }

    pub fn parse<T: FromStr>(&self, kind: &str, key: &str) -> Result<T> {
        let raw = self.require(kind, key)?;
        raw.trim().parse::<T>().map_err(|_| {
            ShardingError::Config(format!(
                "algorithm `{kind}` property `{key}` has invalid value `{raw}`"
            ))
        })
    }

    pub fn parse_or<T: FromStr>(&self, kind: &str, key: &str, default: T) -> Result<T> {
        if self.get(key).is_none() {
            return Ok(default);
        }
        self.parse(kind, key)
    }
}

type ShardingFactory = Arc<dyn Fn(&AlgorithmProps) -> Result<ShardingAlgorithm> + Send + Sync>;
type KeyGeneratorFactory = Arc<dyn Fn(&AlgorithmProps) -> Result<Arc<dyn KeyGenerator>> + Send + Sync>;

/// Name → factory map for sharding and key-generation algorithms.
///
/// Type names are matched case-insensitively.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    sharding: HashMap<String, ShardingFactory>,
    key_generators: HashMap<String, KeyGeneratorFactory>,
}

impl AlgorithmRegistry {
    /// Registry with nothing registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in algorithm registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        builtin::register(&mut registry);
        keygen::register(&mut registry);
        registry
    }

    pub fn register_sharding<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&AlgorithmProps) -> Result<ShardingAlgorithm> + Send + Sync + 'static,
    {
        self.sharding
            .insert(kind.to_ascii_uppercase(), Arc::new(factory));
    }

    pub fn register_key_generator<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&AlgorithmProps) -> Result<Arc<dyn KeyGenerator>> + Send + Sync + 'static,
    {
        self.key_generators
            .insert(kind.to_ascii_uppercase(), Arc::new(factory));
    }

    pub fn create_sharding(&self, kind: &str, props: &AlgorithmProps) -> Result<ShardingAlgorithm> {
        let factory = self
            .sharding
            .get(&kind.to_ascii_uppercase())
            .ok_or_else(|| ShardingError::AlgorithmNotFound(kind.to_string()))?;
        factory(props)
    }

    pub fn create_key_generator(
        &self,
        kind: &str,
        props: &AlgorithmProps,
    ) -> Result<Arc<dyn KeyGenerator>> {
        let factory = self
            .key_generators
            .get(&kind.to_ascii_uppercase())
            .ok_or_else(|| ShardingError::KeyGeneratorNotFound(kind.to_string()))?;
        factory(props)
    }

    /// Registered sharding algorithm names, sorted.
    pub fn sharding_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.sharding.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut key_generators: Vec<&String> = self.key_generators.keys().collect();
        key_generators.sort();
        f.debug_struct("AlgorithmRegistry")
            .field("sharding", &self.sharding_kinds())
            .field("key_generators", &key_generators)
            .finish()
    }
}

/// Parses the trailing decimal digits of a physical name (`t_order_12` → 12).
pub(crate) fn trailing_number(name: &str) -> Option<u64> {
    let digits = name.len()
        - name
            .bytes()
            .rev()
            .take_while(u8::is_ascii_digit)
            .count();
    name[digits..].parse().ok()
}

/// Finds the candidate whose trailing digits equal `suffix`.
pub(crate) fn target_with_suffix(targets: &[String], suffix: u64) -> Option<String> {
    targets
        .iter()
        .find(|target| trailing_number(target) == Some(suffix))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl StandardShardingAlgorithm for Fixed {
        fn kind(&self) -> &str {
            "FIXED"
        }

        fn do_precise(
            &self,
            targets: &[String],
            _value: &PreciseShardingValue<'_>,
        ) -> Result<Option<String>> {
            Ok(targets.first().cloned())
        }

        fn do_range(
            &self,
            targets: &[String],
            _value: &RangeShardingValue<'_>,
        ) -> Result<Vec<String>> {
            Ok(targets.to_vec())
        }
    }

    #[test]
    fn injected_algorithms_resolve_case_insensitively() {
        let mut registry = AlgorithmRegistry::empty();
        registry.register_sharding("fixed", |_| Ok(ShardingAlgorithm::Standard(Arc::new(Fixed))));
        let algorithm = registry
            .create_sharding("FIXED", &AlgorithmProps::new())
            .expect("registered");
        assert_eq!(algorithm.kind(), "FIXED");
        assert_eq!(algorithm.capability(), "standard");

        let err = registry
            .create_sharding("MOD", &AlgorithmProps::new())
            .expect_err("empty registry");
        assert!(matches!(err, ShardingError::AlgorithmNotFound(kind) if kind == "MOD"));
    }

    #[test]
    fn props_report_missing_and_invalid_values() {
        let props = AlgorithmProps::new().with("sharding-count", "four");
        let err = props
            .parse::<u64>("MOD", "sharding-count")
            .expect_err("invalid");
        assert!(err.to_string().contains("invalid value `four`"));
        assert_eq!(props.parse_or::<u64>("MOD", "missing", 3).expect("default"), 3);
    }

    #[test]
    fn json_props_keep_scalar_text() {
        let json = serde_json::json!({"sharding-count": 4, "algorithm-expression": "t_${id % 4}"});
        let props = AlgorithmProps::from_json(json.as_object().expect("object"));
        assert_eq!(props.get("sharding-count"), Some("4"));
        assert_eq!(props.get("algorithm-expression"), Some("t_${id % 4}"));
    }

    #[test]
    fn suffix_matching_is_exact() {
        let targets = vec!["t_order_1".to_string(), "t_order_11".to_string()];
        assert_eq!(target_with_suffix(&targets, 11), Some("t_order_11".to_string()));
        assert_eq!(target_with_suffix(&targets, 1), Some("t_order_1".to_string()));
        assert_eq!(trailing_number("t_order"), None);
    }
}
