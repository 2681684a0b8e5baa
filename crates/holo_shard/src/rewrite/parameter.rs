//! Parameter lists per execution unit.

use std::collections::BTreeMap;

use crate::error::{Result, ShardingError};
use crate::sql::InsertStatement;
use crate::value::SqlValue;

/// Chooses the parameters sent with each physical statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterBuilder {
    /// Every unit receives the full list, with pagination values replaced.
    Standard {
        parameters: Vec<SqlValue>,
        replacements: BTreeMap<usize, SqlValue>,
    },
    /// One group per INSERT row; a unit receives only the groups of its rows.
    Grouped {
        groups: Vec<Vec<SqlValue>>,
        /// Parameters outside the VALUES list, appended after the groups.
        generic: Vec<SqlValue>,
    },
}

impl ParameterBuilder {
    pub fn standard(parameters: &[SqlValue], replacements: BTreeMap<usize, SqlValue>) -> Self {
        ParameterBuilder::Standard {
            parameters: parameters.to_vec(),
            replacements,
        }
    }

    pub fn grouped(insert: &InsertStatement, parameters: &[SqlValue]) -> Result<Self> {
        let lookup = |index: usize| {
            parameters
                .get(index)
                .cloned()
                .ok_or(ShardingError::ParameterOutOfRange {
                    index,
                    len: parameters.len(),
                })
        };
        let mut grouped_indexes = Vec::new();
        let mut groups = Vec::with_capacity(insert.rows.len());
        for row in &insert.rows {
            grouped_indexes.extend(row.params.iter().copied());
            groups.push(row.params.iter().map(|&index| lookup(index)).collect::<Result<Vec<_>>>()?);
        }
        let generic = (0..parameters.len())
            .filter(|index| !grouped_indexes.contains(index))
            .map(lookup)
            .collect::<Result<Vec<_>>>()?;
        Ok(ParameterBuilder::Grouped { groups, generic })
    }

    /// Parameters for a unit; `rows` selects INSERT rows, `None` keeps all.
    pub fn parameters_for(&self, rows: Option<&[usize]>) -> Vec<SqlValue> {
        match self {
            ParameterBuilder::Standard {
                parameters,
                replacements,
            } => parameters
                .iter()
                .enumerate()
                .map(|(index, value)| replacements.get(&index).unwrap_or(value).clone())
                .collect(),
            ParameterBuilder::Grouped { groups, generic } => {
                let mut out = Vec::new();
                match rows {
                    Some(rows) => {
                        for row in rows {
                            if let Some(group) = groups.get(*row) {
                                out.extend(group.iter().cloned());
                            }
                        }
                    }
                    None => out.extend(groups.iter().flatten().cloned()),
                }
                out.extend(generic.iter().cloned());
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Statement, StatementContext};

    #[test]
    fn standard_builder_replaces_pagination_values() {
        let mut replacements = BTreeMap::new();
        replacements.insert(1, SqlValue::Int(0));
        let builder = ParameterBuilder::standard(&[SqlValue::Int(7), SqlValue::Int(3)], replacements);
        assert_eq!(
            builder.parameters_for(None),
            vec![SqlValue::Int(7), SqlValue::Int(0)]
        );
    }

    #[test]
    fn grouped_builder_keeps_only_routed_rows() {
        let ctx = StatementContext::parse("INSERT INTO t_order (order_id, status) VALUES (?, ?), (?, ?)")
            .expect("parse");
        let Statement::Insert(insert) = ctx.statement() else {
            panic!("expected insert");
        };
        let params: Vec<SqlValue> = vec![1.into(), "a".into(), 2.into(), "b".into()];
        let builder = ParameterBuilder::grouped(insert, &params).expect("grouped");
        assert_eq!(
            builder.parameters_for(Some(&[1])),
            vec![SqlValue::Int(2), SqlValue::Text("b".to_string())]
        );
        assert_eq!(builder.parameters_for(None), params);

        let err = ParameterBuilder::grouped(insert, &params[..3]).expect_err("short");
        assert!(matches!(err, ShardingError::ParameterOutOfRange { index: 3, len: 3 }));
    }
}
