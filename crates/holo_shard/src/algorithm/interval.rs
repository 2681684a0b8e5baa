//! Time-interval sharding: one physical table per fixed calendar interval.
//!
//! Targets are matched by suffix: the start of the interval holding a value is
//! formatted with `sharding-suffix-pattern` and the target name must end with
//! it. Patterns may be written in chrono (`%Y%m`) or Java (`yyyyMM`) style.

use chrono::{Datelike, Duration, Local, Months, NaiveDate, NaiveDateTime};

use crate::error::{Result, ShardingError};
use crate::value::SqlValue;

use super::{
    AlgorithmProps, PreciseShardingValue, RangeShardingValue, StandardShardingAlgorithm,
};

const KIND: &str = "INTERVAL";
const MAX_RANGE_STEPS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl IntervalUnit {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SECONDS" => Ok(IntervalUnit::Seconds),
            "MINUTES" => Ok(IntervalUnit::Minutes),
            "HOURS" => Ok(IntervalUnit::Hours),
            "DAYS" => Ok(IntervalUnit::Days),
            "WEEKS" => Ok(IntervalUnit::Weeks),
            "MONTHS" => Ok(IntervalUnit::Months),
            "YEARS" => Ok(IntervalUnit::Years),
            other => Err(ShardingError::Config(format!(
                "algorithm `{KIND}` has unknown `datetime-interval-unit` `{other}`"
            ))),
        }
    }

    fn seconds(self) -> Option<i64> {
        match self {
            IntervalUnit::Seconds => Some(1),
            IntervalUnit::Minutes => Some(60),
            IntervalUnit::Hours => Some(3_600),
            IntervalUnit::Days => Some(86_400),
            IntervalUnit::Weeks => Some(604_800),
            IntervalUnit::Months | IntervalUnit::Years => None,
        }
    }
}

/// Converts a Java `DateTimeFormatter` pattern to chrono syntax.
fn chrono_pattern(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }
    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("SSS", "%3f"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (java, chrono) in TOKENS {
            if let Some(stripped) = rest.strip_prefix(java) {
                out.push_str(chrono);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            out.push(ch);
        }
        rest = chars.as_str();
    }
    out
}

fn parse_datetime(raw: &str, pattern: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, pattern)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, pattern)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

#[derive(Debug)]
pub struct IntervalShardingAlgorithm {
    pattern: String,
    suffix_pattern: String,
    lower: NaiveDateTime,
    upper: NaiveDateTime,
    amount: u32,
    unit: IntervalUnit,
}

impl IntervalShardingAlgorithm {
    pub fn new(props: &AlgorithmProps) -> Result<Self> {
        let pattern = chrono_pattern(props.require(KIND, "datetime-pattern")?);
        let suffix_pattern = chrono_pattern(props.require(KIND, "sharding-suffix-pattern")?);
        let parse_bound = |key: &str, raw: &str| {
            parse_datetime(raw, &pattern).ok_or_else(|| {
                ShardingError::Config(format!(
                    "algorithm `{KIND}` property `{key}` value `{raw}` does not match `datetime-pattern`"
                ))
            })
        };
        let lower = parse_bound("datetime-lower", props.require(KIND, "datetime-lower")?)?;
        let upper = match props.get("datetime-upper") {
            Some(raw) => parse_bound("datetime-upper", raw)?,
            None => Local::now().naive_local(),
        };
        if upper < lower {
            return Err(ShardingError::Config(format!(
                "algorithm `{KIND}` has `datetime-upper` before `datetime-lower`"
            )));
        }
        let amount: u32 = props.parse_or(KIND, "datetime-interval-amount", 1)?;
        if amount == 0 {
            return Err(ShardingError::Config(format!(
                "algorithm `{KIND}` requires a positive `datetime-interval-amount`"
            )));
        }
        let unit = match props.get("datetime-interval-unit") {
            Some(raw) => IntervalUnit::parse(raw)?,
            None => IntervalUnit::Days,
        };
        Ok(Self {
            pattern,
            suffix_pattern,
            lower,
            upper,
            amount,
            unit,
        })
    }

    fn value_to_datetime(
        &self,
        logic_table: &str,
        column: &str,
        value: &SqlValue,
    ) -> Result<NaiveDateTime> {
        value
            .as_str()
            .and_then(|raw| parse_datetime(raw, &self.pattern))
            .ok_or_else(|| {
                ShardingError::condition(
                    logic_table,
                    column,
                    format!("`{value}` does not match datetime pattern `{}`", self.pattern),
                )
            })
    }

    fn step_months(&self) -> u32 {
        match self.unit {
            IntervalUnit::Years => self.amount.saturating_mul(12),
            _ => self.amount,
        }
    }

    /// Start of the interval containing `value`, when inside `[lower, upper]`.
    fn interval_start(&self, value: NaiveDateTime) -> Option<NaiveDateTime> {
        if value < self.lower || value > self.upper {
            return None;
        }
        if let Some(unit_seconds) = self.unit.seconds() {
            let step = unit_seconds * i64::from(self.amount);
            let elapsed = (value - self.lower).num_seconds();
            return self
                .lower
                .checked_add_signed(Duration::seconds(elapsed / step * step));
        }
        let step = self.step_months();
        let months = (value.year() - self.lower.year()) * 12 + value.month() as i32
            - self.lower.month() as i32;
        let mut n = (months.max(0) as u32) / step;
        loop {
            let start = self.lower.checked_add_months(Months::new(n * step))?;
            if start <= value || n == 0 {
                return Some(start);
            }
            n -= 1;
        }
    }

    fn next_interval(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        match self.unit.seconds() {
            Some(unit_seconds) => {
                start.checked_add_signed(Duration::seconds(unit_seconds * i64::from(self.amount)))
            }
            None => start.checked_add_months(Months::new(self.step_months())),
        }
    }

    fn suffix(&self, start: NaiveDateTime) -> String {
        start.format(&self.suffix_pattern).to_string()
    }

    fn match_suffixes(targets: &[String], suffixes: &[String]) -> Vec<String> {
        targets
            .iter()
            .filter(|target| suffixes.iter().any(|suffix| target.ends_with(suffix.as_str())))
            .cloned()
            .collect()
    }
}

impl StandardShardingAlgorithm for IntervalShardingAlgorithm {
    fn kind(&self) -> &str {
        KIND
    }

    fn do_precise(
        &self,
        targets: &[String],
        value: &PreciseShardingValue<'_>,
    ) -> Result<Option<String>> {
        let at = self.value_to_datetime(value.logic_table, value.column, value.value)?;
        let Some(start) = self.interval_start(at) else {
            return Ok(None);
        };
        let suffix = self.suffix(start);
        Ok(targets
            .iter()
            .find(|target| target.ends_with(suffix.as_str()))
            .cloned())
    }

    fn do_range(&self, targets: &[String], value: &RangeShardingValue<'_>) -> Result<Vec<String>> {
        let mut from = self.lower;
        let mut to = self.upper;
        if let Some(bound) = &value.range.lower {
            from = from.max(self.value_to_datetime(value.logic_table, value.column, &bound.value)?);
        }
        if let Some(bound) = &value.range.upper {
            to = to.min(self.value_to_datetime(value.logic_table, value.column, &bound.value)?);
        }
        if from > to {
            return Ok(Vec::new());
        }
        let Some(mut start) = self.interval_start(from) else {
            return Ok(Vec::new());
        };
        let mut suffixes = Vec::new();
        while start <= to {
            if suffixes.len() >= MAX_RANGE_STEPS {
                return Ok(targets.to_vec());
            }
            suffixes.push(self.suffix(start));
            match self.next_interval(start) {
                Some(next) => start = next,
                None => break,
            }
        }
        Ok(Self::match_suffixes(targets, &suffixes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueRange;

    fn monthly() -> IntervalShardingAlgorithm {
        IntervalShardingAlgorithm::new(
            &AlgorithmProps::new()
                .with("datetime-pattern", "yyyy-MM-dd HH:mm:ss")
                .with("datetime-lower", "2024-01-01 00:00:00")
                .with("datetime-upper", "2024-12-31 23:59:59")
                .with("sharding-suffix-pattern", "yyyyMM")
                .with("datetime-interval-unit", "MONTHS"),
        )
        .expect("interval")
    }

    fn targets() -> Vec<String> {
        (1..=12).map(|m| format!("t_log_2024{m:02}")).collect()
    }

    #[test]
    fn java_patterns_translate() {
        assert_eq!(chrono_pattern("yyyy-MM-dd HH:mm:ss"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(chrono_pattern("%Y%m"), "%Y%m");
    }

    #[test]
    fn precise_value_maps_to_month_table() {
        let algorithm = monthly();
        let value = SqlValue::from("2024-03-15 08:30:00");
        let target = algorithm
            .do_precise(
                &targets(),
                &PreciseShardingValue {
                    logic_table: "t_log",
                    column: "created_at",
                    value: &value,
                },
            )
            .expect("precise");
        assert_eq!(target.as_deref(), Some("t_log_202403"));

        let outside = SqlValue::from("2023-12-31 23:00:00");
        let none = algorithm
            .do_precise(
                &targets(),
                &PreciseShardingValue {
                    logic_table: "t_log",
                    column: "created_at",
                    value: &outside,
                },
            )
            .expect("precise");
        assert!(none.is_none());
    }

    #[test]
    fn range_covers_every_touched_month() {
        let algorithm = monthly();
        let range = ValueRange::closed(
            SqlValue::from("2024-02-20 00:00:00"),
            SqlValue::from("2024-04-01 00:00:00"),
        );
        let chosen = algorithm
            .do_range(
                &targets(),
                &RangeShardingValue {
                    logic_table: "t_log",
                    column: "created_at",
                    range: &range,
                },
            )
            .expect("range");
        assert_eq!(chosen, vec!["t_log_202402", "t_log_202403", "t_log_202404"]);
    }

    #[test]
    fn daily_intervals_with_date_only_values() {
        let algorithm = IntervalShardingAlgorithm::new(
            &AlgorithmProps::new()
                .with("datetime-pattern", "%Y-%m-%d")
                .with("datetime-lower", "2024-01-01")
                .with("datetime-upper", "2024-01-31")
                .with("sharding-suffix-pattern", "%d")
                .with("datetime-interval-amount", "7"),
        )
        .expect("interval");
        let targets: Vec<String> = ["t_01", "t_08", "t_15", "t_22", "t_29"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let value = SqlValue::from("2024-01-10");
        let target = algorithm
            .do_precise(
                &targets,
                &PreciseShardingValue {
                    logic_table: "t",
                    column: "day",
                    value: &value,
                },
            )
            .expect("precise");
        assert_eq!(target.as_deref(), Some("t_08"));
    }

    #[test]
    fn unparseable_value_is_a_condition_error() {
        let algorithm = monthly();
        let value = SqlValue::Int(20240301);
        let err = algorithm
            .do_precise(
                &targets(),
                &PreciseShardingValue {
                    logic_table: "t_log",
                    column: "created_at",
                    value: &value,
                },
            )
            .expect_err("integer");
        assert!(matches!(err, ShardingError::Condition { .. }));
    }
}
