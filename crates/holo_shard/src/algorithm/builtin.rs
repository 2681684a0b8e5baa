//! Built-in sharding algorithms.

use std::collections::BTreeMap;
use std::sync::Arc;

use crc32fast::Hasher;

use crate::error::{Result, ShardingError};
use crate::value::{ConditionValue, SqlValue};

use super::inline::InlineTemplate;
use super::interval::IntervalShardingAlgorithm;
use super::{
    target_with_suffix, AlgorithmProps, AlgorithmRegistry, ComplexShardingAlgorithm,
    ComplexShardingValue, HintShardingAlgorithm, HintShardingValue, PreciseShardingValue,
    RangeShardingValue, ShardingAlgorithm, StandardShardingAlgorithm,
};

pub const ALLOW_RANGE_QUERY: &str = "allow-range-query-with-inline-sharding";

pub(crate) fn register(registry: &mut AlgorithmRegistry) {
    registry.register_sharding("MOD", |props| {
        Ok(ShardingAlgorithm::Standard(Arc::new(ModShardingAlgorithm::new(props)?)))
    });
    registry.register_sharding("HASH_MOD", |props| {
        Ok(ShardingAlgorithm::Standard(Arc::new(HashModShardingAlgorithm::new(props)?)))
    });
    registry.register_sharding("INLINE", |props| {
        Ok(ShardingAlgorithm::Standard(Arc::new(InlineShardingAlgorithm::new(props)?)))
    });
    registry.register_sharding("BOUNDARY_RANGE", |props| {
        Ok(ShardingAlgorithm::Standard(Arc::new(RangeShardingAlgorithm::boundary(props)?)))
    });
    registry.register_sharding("VOLUME_RANGE", |props| {
        Ok(ShardingAlgorithm::Standard(Arc::new(RangeShardingAlgorithm::volume(props)?)))
    });
    registry.register_sharding("INTERVAL", |props| {
        Ok(ShardingAlgorithm::Standard(Arc::new(IntervalShardingAlgorithm::new(props)?)))
    });
    registry.register_sharding("COMPLEX_INLINE", |props| {
        Ok(ShardingAlgorithm::Complex(Arc::new(ComplexInlineShardingAlgorithm::new(props)?)))
    });
    registry.register_sharding("HINT_INLINE", |props| {
        Ok(ShardingAlgorithm::Hint(Arc::new(HintInlineShardingAlgorithm::new(props)?)))
    });
}

fn integer_value(value: &PreciseShardingValue<'_>) -> Result<i64> {
    value.value.as_i64().ok_or_else(|| {
        ShardingError::condition(
            value.logic_table,
            value.column,
            format!("expected an integer, got {} `{}`", value.value.type_name(), value.value),
        )
    })
}

fn sharding_count(kind: &str, props: &AlgorithmProps) -> Result<u64> {
    let count: u64 = props.parse(kind, "sharding-count")?;
    if count == 0 {
        return Err(ShardingError::Config(format!(
            "algorithm `{kind}` property `sharding-count` must be positive"
        )));
    }
    Ok(count)
}

/// Keeps `targets` whose name appears in `chosen`, in candidate order.
fn retain_in_order(targets: &[String], chosen: &[String]) -> Vec<String> {
    targets
        .iter()
        .filter(|target| chosen.iter().any(|c| c.eq_ignore_ascii_case(target)))
        .cloned()
        .collect()
}

/// `value mod sharding-count`, matched against each target's numeric suffix.
///
/// The remainder is Euclidean, so negative values land on a non-negative
/// suffix (`-1 mod 4` is `3`) instead of matching no target.
#[derive(Debug)]
pub struct ModShardingAlgorithm {
    count: u64,
}

impl ModShardingAlgorithm {
    pub fn new(props: &AlgorithmProps) -> Result<Self> {
        Ok(Self {
            count: sharding_count("MOD", props)?,
        })
    }

    fn suffix(&self, value: i64) -> u64 {
        value.rem_euclid(self.count as i64) as u64
    }
}

impl StandardShardingAlgorithm for ModShardingAlgorithm {
    fn kind(&self) -> &str {
        "MOD"
    }

    fn do_precise(
        &self,
        targets: &[String],
        value: &PreciseShardingValue<'_>,
    ) -> Result<Option<String>> {
        let v = integer_value(value)?;
        Ok(target_with_suffix(targets, self.suffix(v)))
    }

    fn do_range(&self, targets: &[String], value: &RangeShardingValue<'_>) -> Result<Vec<String>> {
        let (Some(low), Some(high)) = value.range.integer_bounds() else {
            return Ok(targets.to_vec());
        };
        if high < low {
            return Ok(Vec::new());
        }
        // A span at least as wide as the modulus touches every suffix.
        if (high as i128 - low as i128) + 1 >= self.count as i128 {
            return Ok(targets.to_vec());
        }
        let chosen: Vec<String> = (low..=high)
            .filter_map(|v| target_with_suffix(targets, self.suffix(v)))
            .collect();
        Ok(retain_in_order(targets, &chosen))
    }
}

/// CRC32 of the value's canonical text, `mod sharding-count`.
#[derive(Debug)]
pub struct HashModShardingAlgorithm {
    count: u64,
}

impl HashModShardingAlgorithm {
    pub fn new(props: &AlgorithmProps) -> Result<Self> {
        Ok(Self {
            count: sharding_count("HASH_MOD", props)?,
        })
    }

    fn suffix(&self, value: &SqlValue) -> u64 {
        let mut hasher = Hasher::new();
        hasher.update(value.canonical_text().as_bytes());
        u64::from(hasher.finalize()) % self.count
    }
}

impl StandardShardingAlgorithm for HashModShardingAlgorithm {
    fn kind(&self) -> &str {
        "HASH_MOD"
    }

    fn do_precise(
        &self,
        targets: &[String],
        value: &PreciseShardingValue<'_>,
    ) -> Result<Option<String>> {
        if value.value.is_null() {
            return Err(ShardingError::condition(
                value.logic_table,
                value.column,
                "cannot hash NULL",
            ));
        }
        Ok(target_with_suffix(targets, self.suffix(value.value)))
    }

    fn do_range(&self, targets: &[String], _value: &RangeShardingValue<'_>) -> Result<Vec<String>> {
        Ok(targets.to_vec())
    }
}

/// Target name computed from `algorithm-expression`.
#[derive(Debug)]
pub struct InlineShardingAlgorithm {
    template: InlineTemplate,
    allow_range: bool,
}

impl InlineShardingAlgorithm {
    pub fn new(props: &AlgorithmProps) -> Result<Self> {
        let template = InlineTemplate::parse(props.require("INLINE", "algorithm-expression")?)?;
        Ok(Self {
            template,
            allow_range: props.parse_or("INLINE", ALLOW_RANGE_QUERY, false)?,
        })
    }
}

impl StandardShardingAlgorithm for InlineShardingAlgorithm {
    fn kind(&self) -> &str {
        "INLINE"
    }

    fn do_precise(
        &self,
        targets: &[String],
        value: &PreciseShardingValue<'_>,
    ) -> Result<Option<String>> {
        let mut vars = BTreeMap::new();
        vars.insert(value.column.to_string(), value.value.clone());
        let name = self
            .template
            .evaluate(&vars)
            .map_err(|message| ShardingError::condition(value.logic_table, value.column, message))?;
        Ok(targets
            .iter()
            .find(|target| target.eq_ignore_ascii_case(&name))
            .cloned())
    }

    fn do_range(&self, targets: &[String], value: &RangeShardingValue<'_>) -> Result<Vec<String>> {
        if self.allow_range {
            return Ok(targets.to_vec());
        }
        Err(ShardingError::condition(
            value.logic_table,
            value.column,
            format!(
                "range queries are not supported by inline expression `{}`; set `{ALLOW_RANGE_QUERY}` to broadcast them",
                self.template.source()
            ),
        ))
    }
}

/// Partitions split at ascending boundaries; partition `n` holds values in
/// `[boundary[n-1], boundary[n])`, partition 0 everything below the first.
#[derive(Debug)]
pub struct RangeShardingAlgorithm {
    kind: &'static str,
    boundaries: Vec<i64>,
}

impl RangeShardingAlgorithm {
    pub fn boundary(props: &AlgorithmProps) -> Result<Self> {
        let raw = props.require("BOUNDARY_RANGE", "sharding-ranges")?;
        let mut boundaries = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let bound = part.parse::<i64>().map_err(|_| {
                ShardingError::Config(format!(
                    "algorithm `BOUNDARY_RANGE` has invalid boundary `{part}`"
                ))
            })?;
            boundaries.push(bound);
        }
        if boundaries.is_empty() || boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ShardingError::Config(
                "algorithm `BOUNDARY_RANGE` requires strictly ascending `sharding-ranges`"
                    .to_string(),
            ));
        }
        Ok(Self {
            kind: "BOUNDARY_RANGE",
            boundaries,
        })
    }

    pub fn volume(props: &AlgorithmProps) -> Result<Self> {
        let kind = "VOLUME_RANGE";
        let lower: i64 = props.parse(kind, "range-lower")?;
        let upper: i64 = props.parse(kind, "range-upper")?;
        let volume: i64 = props.parse(kind, "sharding-volume")?;
        if volume <= 0 || upper <= lower {
            return Err(ShardingError::Config(format!(
                "algorithm `{kind}` requires `range-lower` < `range-upper` and a positive `sharding-volume`"
            )));
        }
        let mut boundaries = vec![lower];
        let mut next = lower;
        loop {
            next = next.saturating_add(volume);
            if next >= upper {
                boundaries.push(upper);
                break;
            }
            boundaries.push(next);
        }
        Ok(Self { kind, boundaries })
    }

    fn partition(&self, value: i64) -> u64 {
        self.boundaries.iter().filter(|bound| **bound <= value).count() as u64
    }
}

impl StandardShardingAlgorithm for RangeShardingAlgorithm {
    fn kind(&self) -> &str {
        self.kind
    }

    fn do_precise(
        &self,
        targets: &[String],
        value: &PreciseShardingValue<'_>,
    ) -> Result<Option<String>> {
        let v = integer_value(value)?;
        Ok(target_with_suffix(targets, self.partition(v)))
    }

    fn do_range(&self, targets: &[String], value: &RangeShardingValue<'_>) -> Result<Vec<String>> {
        let (low, high) = value.range.integer_bounds();
        let first = low.map(|v| self.partition(v)).unwrap_or(0);
        let last = high
            .map(|v| self.partition(v))
            .unwrap_or(self.boundaries.len() as u64);
        let chosen: Vec<String> = (first..=last)
            .filter_map(|partition| target_with_suffix(targets, partition))
            .collect();
        Ok(retain_in_order(targets, &chosen))
    }
}

/// Cartesian product of every conditioned column, rendered through
/// `algorithm-expression`.
#[derive(Debug)]
pub struct ComplexInlineShardingAlgorithm {
    template: InlineTemplate,
    allow_range: bool,
}

impl ComplexInlineShardingAlgorithm {
    pub fn new(props: &AlgorithmProps) -> Result<Self> {
        let template =
            InlineTemplate::parse(props.require("COMPLEX_INLINE", "algorithm-expression")?)?;
        Ok(Self {
            template,
            allow_range: props.parse_or("COMPLEX_INLINE", ALLOW_RANGE_QUERY, false)?,
        })
    }
}

impl ComplexShardingAlgorithm for ComplexInlineShardingAlgorithm {
    fn kind(&self) -> &str {
        "COMPLEX_INLINE"
    }

    fn do_sharding(
        &self,
        targets: &[String],
        value: &ComplexShardingValue<'_>,
    ) -> Result<Vec<String>> {
        let mut combinations: Vec<BTreeMap<String, SqlValue>> = vec![BTreeMap::new()];
        for variable in self.template.variables() {
            let condition = value
                .values
                .iter()
                .find(|(column, _)| column.eq_ignore_ascii_case(&variable))
                .map(|(_, condition)| condition);
            let values = match condition {
                None => return Ok(targets.to_vec()),
                Some(ConditionValue::Range(_)) if self.allow_range => {
                    return Ok(targets.to_vec())
                }
                Some(ConditionValue::Range(_)) => {
                    return Err(ShardingError::condition(
                        value.logic_table,
                        variable,
                        format!(
                            "range queries are not supported by inline expression `{}`",
                            self.template.source()
                        ),
                    ))
                }
                Some(ConditionValue::Values(values)) => values,
            };
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combination in &combinations {
                for v in values {
                    let mut extended = combination.clone();
                    extended.insert(variable.clone(), v.clone());
                    next.push(extended);
                }
            }
            combinations = next;
        }

        let mut chosen = Vec::new();
        for vars in &combinations {
            let name = self.template.evaluate(vars).map_err(|message| {
                ShardingError::condition(value.logic_table, self.template.source(), message)
            })?;
            chosen.push(name);
        }
        Ok(retain_in_order(targets, &chosen))
    }
}

/// Renders each hint value through `algorithm-expression` (bound as `value`).
#[derive(Debug)]
pub struct HintInlineShardingAlgorithm {
    template: InlineTemplate,
}

impl HintInlineShardingAlgorithm {
    pub fn new(props: &AlgorithmProps) -> Result<Self> {
        let expression = props.get("algorithm-expression").unwrap_or("${value}");
        Ok(Self {
            template: InlineTemplate::parse(expression)?,
        })
    }
}

impl HintShardingAlgorithm for HintInlineShardingAlgorithm {
    fn kind(&self) -> &str {
        "HINT_INLINE"
    }

    fn do_sharding(&self, targets: &[String], value: &HintShardingValue<'_>) -> Result<Vec<String>> {
        let mut chosen = Vec::with_capacity(value.values.len());
        for hint in value.values {
            let mut vars = BTreeMap::new();
            vars.insert("value".to_string(), hint.clone());
            let name = self
                .template
                .evaluate(&vars)
                .map_err(|message| ShardingError::condition(value.logic_table, "value", message))?;
            chosen.push(name);
        }
        Ok(retain_in_order(targets, &chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueRange;

    fn targets(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn precise<'a>(value: &'a SqlValue) -> PreciseShardingValue<'a> {
        PreciseShardingValue {
            logic_table: "t_order",
            column: "order_id",
            value,
        }
    }

    #[test]
    fn mod_picks_exact_suffix() {
        let algorithm =
            ModShardingAlgorithm::new(&AlgorithmProps::new().with("sharding-count", "4"))
                .expect("mod");
        let targets = targets("t_order_", 4);
        let target = algorithm
            .do_precise(&targets, &precise(&SqlValue::Int(5)))
            .expect("precise");
        assert_eq!(target.as_deref(), Some("t_order_1"));
        let negative = algorithm
            .do_precise(&targets, &precise(&SqlValue::Int(-1)))
            .expect("precise");
        assert_eq!(negative.as_deref(), Some("t_order_3"));
    }

    #[test]
    fn mod_rejects_non_integer_values() {
        let algorithm =
            ModShardingAlgorithm::new(&AlgorithmProps::new().with("sharding-count", "4"))
                .expect("mod");
        let err = algorithm
            .do_precise(&targets("t_", 4), &precise(&SqlValue::from("abc")))
            .expect_err("text");
        assert!(matches!(err, ShardingError::Condition { ref column, .. } if column == "order_id"));
    }

    #[test]
    fn mod_narrow_range_enumerates_suffixes() {
        let algorithm =
            ModShardingAlgorithm::new(&AlgorithmProps::new().with("sharding-count", "4"))
                .expect("mod");
        let targets = targets("t_order_", 4);
        let range = ValueRange::closed(SqlValue::Int(6), SqlValue::Int(7));
        let value = RangeShardingValue {
            logic_table: "t_order",
            column: "order_id",
            range: &range,
        };
        assert_eq!(
            algorithm.do_range(&targets, &value).expect("range"),
            vec!["t_order_2", "t_order_3"]
        );
        let wide = ValueRange::at_least(SqlValue::Int(0), true);
        let value = RangeShardingValue {
            range: &wide,
            ..value
        };
        assert_eq!(algorithm.do_range(&targets, &value).expect("range").len(), 4);
    }

    #[test]
    fn mod_range_across_zero_uses_euclidean_suffixes() {
        let algorithm =
            ModShardingAlgorithm::new(&AlgorithmProps::new().with("sharding-count", "4"))
                .expect("mod");
        let targets = targets("t_order_", 4);
        let range = ValueRange::closed(SqlValue::Int(-2), SqlValue::Int(0));
        let value = RangeShardingValue {
            logic_table: "t_order",
            column: "order_id",
            range: &range,
        };
        assert_eq!(
            algorithm.do_range(&targets, &value).expect("range"),
            vec!["t_order_0", "t_order_2", "t_order_3"]
        );
        let min = algorithm
            .do_precise(&targets, &precise(&SqlValue::Int(i64::MIN)))
            .expect("precise");
        assert_eq!(min.as_deref(), Some("t_order_0"));
    }

    #[test]
    fn hash_mod_is_stable() {
        let algorithm =
            HashModShardingAlgorithm::new(&AlgorithmProps::new().with("sharding-count", "3"))
                .expect("hash mod");
        let targets = targets("ds_", 3);
        let first = algorithm
            .do_precise(&targets, &precise(&SqlValue::from("alice")))
            .expect("precise");
        let second = algorithm
            .do_precise(&targets, &precise(&SqlValue::from("alice")))
            .expect("precise");
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn inline_rejects_ranges_unless_allowed() {
        let props = AlgorithmProps::new().with("algorithm-expression", "t_order_${order_id % 2}");
        let strict = InlineShardingAlgorithm::new(&props).expect("inline");
        let range = ValueRange::at_least(SqlValue::Int(1), true);
        let value = RangeShardingValue {
            logic_table: "t_order",
            column: "order_id",
            range: &range,
        };
        assert!(strict.do_range(&targets("t_order_", 2), &value).is_err());

        let relaxed = InlineShardingAlgorithm::new(&props.with(ALLOW_RANGE_QUERY, "true"))
            .expect("inline");
        assert_eq!(
            relaxed
                .do_range(&targets("t_order_", 2), &value)
                .expect("range")
                .len(),
            2
        );
    }

    #[test]
    fn boundary_and_volume_partitions() {
        let boundary = RangeShardingAlgorithm::boundary(
            &AlgorithmProps::new().with("sharding-ranges", "10, 20, 30"),
        )
        .expect("boundary");
        let targets = targets("t_", 4);
        for (value, expected) in [(5, "t_0"), (10, "t_1"), (29, "t_2"), (100, "t_3")] {
            let target = boundary
                .do_precise(&targets, &precise(&SqlValue::Int(value)))
                .expect("precise");
            assert_eq!(target.as_deref(), Some(expected), "value {value}");
        }
        let range = ValueRange::closed(SqlValue::Int(15), SqlValue::Int(25));
        let value = RangeShardingValue {
            logic_table: "t",
            column: "id",
            range: &range,
        };
        assert_eq!(boundary.do_range(&targets, &value).expect("range"), vec!["t_1", "t_2"]);

        let volume = RangeShardingAlgorithm::volume(
            &AlgorithmProps::new()
                .with("range-lower", "10")
                .with("range-upper", "40")
                .with("sharding-volume", "10"),
        )
        .expect("volume");
        assert_eq!(volume.boundaries, boundary.boundaries.iter().copied().chain([40]).collect::<Vec<_>>());
    }

    #[test]
    fn complex_inline_expands_value_product() {
        let algorithm = ComplexInlineShardingAlgorithm::new(
            &AlgorithmProps::new()
                .with("algorithm-expression", "t_order_${user_id % 2}_${order_id % 2}"),
        )
        .expect("complex");
        let targets = vec![
            "t_order_0_0".to_string(),
            "t_order_0_1".to_string(),
            "t_order_1_0".to_string(),
            "t_order_1_1".to_string(),
        ];
        let mut values = BTreeMap::new();
        values.insert(
            "user_id".to_string(),
            ConditionValue::Values(vec![SqlValue::Int(1), SqlValue::Int(3)]),
        );
        values.insert(
            "order_id".to_string(),
            ConditionValue::Values(vec![SqlValue::Int(4)]),
        );
        let chosen = algorithm
            .do_sharding(
                &targets,
                &ComplexShardingValue {
                    logic_table: "t_order",
                    values: &values,
                },
            )
            .expect("complex");
        assert_eq!(chosen, vec!["t_order_1_0"]);

        values.remove("order_id");
        let broadcast = algorithm
            .do_sharding(
                &targets,
                &ComplexShardingValue {
                    logic_table: "t_order",
                    values: &values,
                },
            )
            .expect("complex");
        assert_eq!(broadcast.len(), 4);
    }

    #[test]
    fn hint_inline_renders_each_value() {
        let algorithm = HintInlineShardingAlgorithm::new(
            &AlgorithmProps::new().with("algorithm-expression", "ds_${value % 2}"),
        )
        .expect("hint");
        let hints = [SqlValue::Int(3), SqlValue::Int(5)];
        let chosen = algorithm
            .do_sharding(
                &targets("ds_", 2),
                &HintShardingValue {
                    logic_table: "t_order",
                    values: &hints,
                },
            )
            .expect("hint");
        assert_eq!(chosen, vec!["ds_1"]);
    }
}
