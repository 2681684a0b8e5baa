//! Scalar values flowing through conditions, parameters and shard rows.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single SQL scalar.
///
/// Shard cursors, statement parameters and literal values in the statement
/// text all use this one representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::Int(_) => "integer",
            SqlValue::Float(_) => "float",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
        }
    }

    /// Coerces the value to an `i64` the way sharding algorithms expect.
    ///
    /// Integral floats and numeric text are accepted; everything else is not.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse::<i64>().ok(),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Float(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Compares two non-null values of compatible types.
    ///
    /// Returns `None` when either side is null or the types cannot be ordered
    /// against each other.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (SqlValue::Int(l), SqlValue::Int(r)) => Some(l.cmp(r)),
            (SqlValue::Int(l), SqlValue::Float(r)) => (*l as f64).partial_cmp(r),
            (SqlValue::Float(l), SqlValue::Int(r)) => l.partial_cmp(&(*r as f64)),
            (SqlValue::Float(l), SqlValue::Float(r)) => l.partial_cmp(r),
            (SqlValue::Text(l), SqlValue::Text(r)) => Some(l.cmp(r)),
            (SqlValue::Bool(l), SqlValue::Bool(r)) => Some(l.cmp(r)),
            (SqlValue::Bytes(l), SqlValue::Bytes(r)) => Some(l.cmp(r)),
            _ => None,
        }
    }

    /// SQL-style equality used for group keys and condition intersection.
    pub fn sql_eq(&self, other: &SqlValue) -> bool {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => true,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Adds two values for `SUM`/`COUNT` accumulation. Nulls are ignored.
    pub fn checked_add(&self, other: &SqlValue) -> Option<SqlValue> {
        match (self, other) {
            (SqlValue::Null, v) | (v, SqlValue::Null) => Some(v.clone()),
            (SqlValue::Int(l), SqlValue::Int(r)) => l.checked_add(*r).map(SqlValue::Int),
            (SqlValue::Int(l), SqlValue::Float(r)) => Some(SqlValue::Float(*l as f64 + r)),
            (SqlValue::Float(l), SqlValue::Int(r)) => Some(SqlValue::Float(l + *r as f64)),
            (SqlValue::Float(l), SqlValue::Float(r)) => Some(SqlValue::Float(l + r)),
            _ => None,
        }
    }

    /// Renders the value as a literal that can be spliced into SQL text.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(true) => "TRUE".to_string(),
            SqlValue::Bool(false) => "FALSE".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => format_float(*v),
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Bytes(bytes) => {
                let mut out = String::with_capacity(bytes.len() * 2 + 3);
                out.push_str("X'");
                for byte in bytes {
                    out.push_str(&format!("{byte:02X}"));
                }
                out.push('\'');
                out
            }
        }
    }

    /// Stable textual form used for hashing.
    pub fn canonical_text(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => format_float(*v),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Appends an unambiguous, type-tagged encoding of the value to `out`.
    pub(crate) fn encode_key(&self, out: &mut String) {
        match self {
            SqlValue::Null => out.push('N'),
            SqlValue::Bool(b) => out.push_str(if *b { "B1" } else { "B0" }),
            SqlValue::Int(v) => {
                out.push('I');
                out.push_str(&v.to_string());
            }
            SqlValue::Float(v) => {
                out.push('F');
                out.push_str(&v.to_bits().to_string());
            }
            SqlValue::Text(s) => {
                out.push('T');
                out.push_str(&s.len().to_string());
                out.push(':');
                out.push_str(s);
            }
            SqlValue::Bytes(bytes) => {
                out.push('X');
                out.push_str(&bytes.len().to_string());
                out.push(':');
                for byte in bytes {
                    out.push_str(&format!("{byte:02x}"));
                }
            }
        }
        out.push('|');
    }
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Text(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_sql_literal()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

/// One side of a [`ValueRange`].
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub value: SqlValue,
    pub inclusive: bool,
}

/// Bounded or half-bounded interval derived from comparison predicates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueRange {
    pub lower: Option<RangeBound>,
    pub upper: Option<RangeBound>,
}

impl ValueRange {
    pub fn closed(lower: SqlValue, upper: SqlValue) -> Self {
        Self {
            lower: Some(RangeBound {
                value: lower,
                inclusive: true,
            }),
            upper: Some(RangeBound {
                value: upper,
                inclusive: true,
            }),
        }
    }

    pub fn at_least(value: SqlValue, inclusive: bool) -> Self {
        Self {
            lower: Some(RangeBound { value, inclusive }),
            upper: None,
        }
    }

    pub fn at_most(value: SqlValue, inclusive: bool) -> Self {
        Self {
            lower: None,
            upper: Some(RangeBound { value, inclusive }),
        }
    }

    /// Tightens the lower bound, keeping the more restrictive of the two.
    pub fn add_lower_bound(&mut self, value: SqlValue, inclusive: bool) {
        self.lower = match self.lower.take() {
            None => Some(RangeBound { value, inclusive }),
            Some(existing) => {
                let tighter = existing
                    .value
                    .compare(&value)
                    .map(|cmp| cmp.is_lt())
                    .unwrap_or(false)
                    || (existing.value.sql_eq(&value) && !inclusive && existing.inclusive);
                if tighter {
                    Some(RangeBound { value, inclusive })
                } else {
                    Some(existing)
                }
            }
        };
    }

    /// Tightens the upper bound, keeping the more restrictive of the two.
    pub fn add_upper_bound(&mut self, value: SqlValue, inclusive: bool) {
        self.upper = match self.upper.take() {
            None => Some(RangeBound { value, inclusive }),
            Some(existing) => {
                let tighter = existing
                    .value
                    .compare(&value)
                    .map(|cmp| cmp.is_gt())
                    .unwrap_or(false)
                    || (existing.value.sql_eq(&value) && !inclusive && existing.inclusive);
                if tighter {
                    Some(RangeBound { value, inclusive })
                } else {
                    Some(existing)
                }
            }
        };
    }

    pub fn intersect(&mut self, other: &ValueRange) {
        if let Some(lower) = &other.lower {
            self.add_lower_bound(lower.value.clone(), lower.inclusive);
        }
        if let Some(upper) = &other.upper {
            self.add_upper_bound(upper.value.clone(), upper.inclusive);
        }
    }

    /// Returns `true` when the bounds provably admit no value.
    pub fn is_empty(&self) -> bool {
        let (Some(lower), Some(upper)) = (&self.lower, &self.upper) else {
            return false;
        };
        match lower.value.compare(&upper.value) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => !(lower.inclusive && upper.inclusive),
            _ => false,
        }
    }

    /// Returns `false` only when `value` is provably outside the range.
    pub fn contains(&self, value: &SqlValue) -> bool {
        if let Some(lower) = &self.lower {
            match value.compare(&lower.value) {
                Some(Ordering::Less) => return false,
                Some(Ordering::Equal) if !lower.inclusive => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match value.compare(&upper.value) {
                Some(Ordering::Greater) => return false,
                Some(Ordering::Equal) if !upper.inclusive => return false,
                _ => {}
            }
        }
        true
    }

    /// Inclusive integer bounds, when both sides coerce to integers.
    pub fn integer_bounds(&self) -> (Option<i64>, Option<i64>) {
        let lower = self.lower.as_ref().and_then(|bound| {
            let v = bound.value.as_i64()?;
            if bound.inclusive {
                Some(v)
            } else {
                v.checked_add(1)
            }
        });
        let upper = self.upper.as_ref().and_then(|bound| {
            let v = bound.value.as_i64()?;
            if bound.inclusive {
                Some(v)
            } else {
                v.checked_sub(1)
            }
        });
        (lower, upper)
    }
}

/// Value constraint extracted for one sharding column.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    /// Finite set from `=` / `IN`.
    Values(Vec<SqlValue>),
    /// Interval from comparisons / `BETWEEN`.
    Range(ValueRange),
}

impl ConditionValue {
    /// Combines two constraints on the same column (logical AND).
    pub fn and(self, other: ConditionValue) -> ConditionValue {
        match (self, other) {
            (ConditionValue::Values(left), ConditionValue::Values(right)) => {
                let kept = left
                    .into_iter()
                    .filter(|value| right.iter().any(|candidate| candidate.sql_eq(value)))
                    .collect();
                ConditionValue::Values(kept)
            }
            (ConditionValue::Values(values), ConditionValue::Range(range))
            | (ConditionValue::Range(range), ConditionValue::Values(values)) => {
                ConditionValue::Values(
                    values
                        .into_iter()
                        .filter(|value| range.contains(value))
                        .collect(),
                )
            }
            (ConditionValue::Range(mut left), ConditionValue::Range(right)) => {
                left.intersect(&right);
                ConditionValue::Range(left)
            }
        }
    }

    /// Returns `true` when the constraint admits no value at all.
    pub fn is_empty(&self) -> bool {
        match self {
            ConditionValue::Values(values) => values.is_empty(),
            ConditionValue::Range(range) => range.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_literals_escape_quotes() {
        assert_eq!(SqlValue::from("o'hara").to_sql_literal(), "'o''hara'");
        assert_eq!(SqlValue::Float(2.0).to_sql_literal(), "2.0");
        assert_eq!(SqlValue::Bytes(vec![0xab, 0x01]).to_sql_literal(), "X'AB01'");
    }

    #[test]
    fn numeric_comparison_crosses_int_and_float() {
        assert_eq!(
            SqlValue::Int(3).compare(&SqlValue::Float(2.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(SqlValue::Int(3).compare(&SqlValue::from("3")), None);
    }

    #[test]
    fn range_tightening_keeps_most_restrictive_bounds() {
        let mut range = ValueRange::at_least(SqlValue::Int(1), true);
        range.add_lower_bound(SqlValue::Int(5), false);
        range.add_upper_bound(SqlValue::Int(10), true);
        range.add_upper_bound(SqlValue::Int(20), true);
        assert_eq!(range.integer_bounds(), (Some(6), Some(10)));
        assert!(!range.contains(&SqlValue::Int(5)));
        assert!(range.contains(&SqlValue::Int(10)));
    }

    #[test]
    fn empty_range_detection_respects_exclusive_bounds() {
        let mut range = ValueRange::at_least(SqlValue::Int(5), true);
        range.add_upper_bound(SqlValue::Int(5), false);
        assert!(range.is_empty());
        assert!(!ValueRange::closed(SqlValue::Int(5), SqlValue::Int(5)).is_empty());
    }

    #[test]
    fn condition_values_intersect() {
        let values = ConditionValue::Values(vec![SqlValue::Int(1), SqlValue::Int(7)]);
        let narrowed = values.and(ConditionValue::Range(ValueRange::at_least(
            SqlValue::Int(5),
            true,
        )));
        assert_eq!(narrowed, ConditionValue::Values(vec![SqlValue::Int(7)]));

        let disjoint = ConditionValue::Values(vec![SqlValue::Int(1)])
            .and(ConditionValue::Values(vec![SqlValue::Int(2)]));
        assert!(disjoint.is_empty());
    }

    #[test]
    fn key_encoding_distinguishes_types() {
        let mut int_key = String::new();
        SqlValue::Int(1).encode_key(&mut int_key);
        let mut text_key = String::new();
        SqlValue::from("1").encode_key(&mut text_key);
        assert_ne!(int_key, text_key);
    }
}
