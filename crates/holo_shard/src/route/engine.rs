//! Routing engine: statement + conditions + rule → [`RouteContext`].

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::condition::{resolve_value, ShardingCondition, ShardingConditions};
use crate::error::{ErrorCategory, Result, ShardingError};
use crate::rule::{DataNode, ShardingRule, ShardingStrategy, TableRule};
use crate::sql::{DalStatement, InsertStatement, Statement, StatementContext, TableRef, UpdateStatement};
use crate::value::{ConditionValue, SqlValue};

use super::{HintManager, RouteContext, RouteType, TableMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Ddl,
}

/// Computes routes against a rule snapshot. Holds policy only, no state.
#[derive(Debug, Clone, Default)]
pub struct RouteEngine {
    /// Route to every candidate instead of failing when an algorithm
    /// rejects a sharding value.
    fail_open: bool,
    /// Upper bound on physical statements per logical statement; 0 disables.
    max_execution_units: usize,
}

impl RouteEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_max_execution_units(mut self, max_execution_units: usize) -> Self {
        self.max_execution_units = max_execution_units;
        self
    }

    pub fn route(
        &self,
        rule: &ShardingRule,
        ctx: &StatementContext,
        parameters: &[SqlValue],
        conditions: &ShardingConditions,
        hint: &HintManager,
    ) -> Result<RouteContext> {
        let route = self.route_statement(rule, ctx, parameters, conditions, hint)?;
        let units = route.execution_unit_count();
        if self.max_execution_units > 0 && units > self.max_execution_units {
            return Err(ShardingError::TooManyExecutionUnits {
                units,
                limit: self.max_execution_units,
            });
        }
        debug!(statement = ctx.statement().kind_name(), route = %route, "routed statement");
        Ok(route)
    }

    fn route_statement(
        &self,
        rule: &ShardingRule,
        ctx: &StatementContext,
        parameters: &[SqlValue],
        conditions: &ShardingConditions,
        hint: &HintManager,
    ) -> Result<RouteContext> {
        if let Some(data_source) = hint.data_source() {
            if !rule.data_source_names().iter().any(|name| name == data_source) {
                return Err(ShardingError::Config(format!(
                    "hinted data source `{data_source}` is not configured"
                )));
            }
            let mut route = RouteContext::new(RouteType::Hint);
            route.add(data_source, TableMapping::new());
            return Ok(route);
        }

        match ctx.statement() {
            Statement::Tcl(_)
            | Statement::Dal(DalStatement::Set)
            | Statement::Dal(DalStatement::ShowTables { .. }) => Ok(database_broadcast(rule)),
            Statement::Dal(
                DalStatement::Describe(table)
                | DalStatement::ShowCreateTable(table)
                | DalStatement::ShowIndex(table),
            ) => unicast_table(rule, table),
            Statement::Ddl(_) => self.route_tables(rule, ctx, conditions, hint, Access::Ddl),
            Statement::Insert(insert) => self.route_insert(rule, insert, conditions, hint),
            Statement::Update(update) => {
                validate_update(rule, update, parameters, conditions)?;
                self.route_tables(rule, ctx, conditions, hint, Access::Write)
            }
            Statement::Delete(_) => self.route_tables(rule, ctx, conditions, hint, Access::Write),
            Statement::Select(_) => self.route_tables(rule, ctx, conditions, hint, Access::Read),
        }
    }

    fn route_tables(
        &self,
        rule: &ShardingRule,
        ctx: &StatementContext,
        conditions: &ShardingConditions,
        hint: &HintManager,
        access: Access,
    ) -> Result<RouteContext> {
        let names = ctx.table_names();
        let sharded: Vec<&TableRule> = names.iter().filter_map(|name| rule.table_rule(name)).collect();

        if sharded.is_empty() {
            let only_broadcast = !names.is_empty() && names.iter().all(|name| rule.is_broadcast(name));
            return match access {
                Access::Read if only_broadcast => unicast_first(rule),
                _ if only_broadcast => Ok(database_broadcast(rule)),
                Access::Ddl if names.is_empty() => Ok(database_broadcast(rule)),
                Access::Read if names.is_empty() => unicast_first(rule),
                _ => {
                    let unknown = names
                        .iter()
                        .find(|name| !rule.is_broadcast(name))
                        .map(String::as_str)
                        .unwrap_or_default();
                    default_route(rule, unknown)
                }
            };
        }

        let route_type = if sharded.iter().any(|table| hint.covers(&table.logic_table)) {
            RouteType::Hint
        } else if access == Access::Ddl {
            RouteType::TableBroadcast
        } else {
            RouteType::Standard
        };

        let mut routed = Vec::with_capacity(sharded.len());
        for table in sharded {
            let condition = if access == Access::Ddl {
                None
            } else {
                conditions.for_table(&table.logic_table)
            };
            let always_false = access != Access::Ddl && conditions.always_false;
            let nodes = self.route_table(table, condition, hint, always_false)?;
            routed.push((table, nodes));
        }

        let mut route = RouteContext::new(route_type);
        for (data_source, mapping) in combine(rule, &routed)? {
            route.add(&data_source, mapping);
        }
        Ok(route)
    }

    fn route_insert(
        &self,
        rule: &ShardingRule,
        insert: &InsertStatement,
        conditions: &ShardingConditions,
        hint: &HintManager,
    ) -> Result<RouteContext> {
        let logic_table = insert.table.logic_name();
        let Some(table) = rule.table_rule(&logic_table) else {
            if rule.is_broadcast(&logic_table) {
                return Ok(database_broadcast(rule));
            }
            return default_route(rule, &logic_table);
        };

        let route_type = if hint.covers(&logic_table) {
            RouteType::Hint
        } else {
            RouteType::Standard
        };
        let mut route = RouteContext::new(route_type);
        let mut row_nodes = Vec::with_capacity(insert.rows.len());
        for (index, condition) in conditions.insert_rows().enumerate() {
            let row = condition.insert_row.unwrap_or(index);
            let nodes = self.route_table(table, Some(condition), hint, false)?;
            let node = match nodes.as_slice() {
                [node] => node.clone(),
                _ => {
                    return Err(ShardingError::InsertRoutedToMultipleNodes {
                        table: logic_table,
                        row,
                        nodes: nodes.len(),
                    })
                }
            };
            route.add(
                &node.data_source,
                TableMapping::single(&logic_table, &node.table),
            );
            row_nodes.push(node);
        }
        route.set_insert_row_nodes(row_nodes);
        Ok(route)
    }

    /// Data nodes of one sharded table.
    fn route_table(
        &self,
        table: &TableRule,
        condition: Option<&ShardingCondition>,
        hint: &HintManager,
        always_false: bool,
    ) -> Result<Vec<DataNode>> {
        let logic_table = table.logic_table.as_str();
        if hint.covers(logic_table) {
            let database_values = hint.database_values(logic_table);
            let table_values = hint.table_values(logic_table);
            return self.shard_nodes(
                table,
                &hint_conditions(&table.database_strategy, database_values),
                database_values,
                &hint_conditions(&table.table_strategy, table_values),
                table_values,
            );
        }
        if table.is_single() {
            return Ok(table.data_nodes.clone());
        }
        // Decision: a provably empty predicate still needs one shard to
        // answer with the right column set.
        if always_false {
            return Ok(table.data_nodes.iter().take(1).cloned().collect());
        }
        let empty = BTreeMap::new();
        let values = condition.map_or(&empty, |condition| &condition.values);
        self.shard_nodes(table, values, None, values, None)
    }

    fn shard_nodes(
        &self,
        table: &TableRule,
        database_values: &BTreeMap<String, ConditionValue>,
        database_hint: Option<&[SqlValue]>,
        table_values: &BTreeMap<String, ConditionValue>,
        table_hint: Option<&[SqlValue]>,
    ) -> Result<Vec<DataNode>> {
        let logic_table = table.logic_table.as_str();
        let data_sources = self.apply(
            &table.database_strategy,
            &table.data_source_names(),
            logic_table,
            database_values,
            database_hint,
        )?;

        let mut nodes = Vec::new();
        for data_source in data_sources {
            let candidates = table.actual_tables_in(&data_source);
            let tables = self.apply(
                &table.table_strategy,
                &candidates,
                logic_table,
                table_values,
                table_hint,
            )?;
            nodes.extend(
                tables
                    .into_iter()
                    .map(|actual| DataNode::new(data_source.clone(), actual)),
            );
        }
        if nodes.is_empty() {
            return Err(ShardingError::NoDataNode(logic_table.to_string()));
        }
        Ok(nodes)
    }

    fn apply(
        &self,
        strategy: &ShardingStrategy,
        targets: &[String],
        logic_table: &str,
        values: &BTreeMap<String, ConditionValue>,
        hint_values: Option<&[SqlValue]>,
    ) -> Result<Vec<String>> {
        match strategy.do_sharding(targets, logic_table, values, hint_values) {
            Ok(chosen) => Ok(chosen),
            Err(err) if self.fail_open && err.category() == ErrorCategory::Condition => {
                warn!(table = logic_table, error = %err, "sharding algorithm failed, routing to every candidate");
                Ok(targets.to_vec())
            }
            Err(err) => Err(err),
        }
    }
}

/// Hint values as an `IN` list over the strategy's sharding columns.
fn hint_conditions(
    strategy: &ShardingStrategy,
    values: Option<&[SqlValue]>,
) -> BTreeMap<String, ConditionValue> {
    let Some(values) = values else {
        return BTreeMap::new();
    };
    strategy
        .sharding_columns()
        .into_iter()
        .map(|column| {
            (
                column.to_ascii_lowercase(),
                ConditionValue::Values(values.to_vec()),
            )
        })
        .collect()
}

/// Joins per-table nodes into per-datasource mappings.
///
/// Tables of one binding group are aligned by their position inside the
/// datasource; unrelated tables form a Cartesian product within each
/// datasource they share.
fn combine(
    rule: &ShardingRule,
    routed: &[(&TableRule, Vec<DataNode>)],
) -> Result<Vec<(String, TableMapping)>> {
    let mut handled = vec![false; routed.len()];
    let mut groups: Vec<Vec<(String, TableMapping)>> = Vec::new();

    for i in 0..routed.len() {
        if handled[i] {
            continue;
        }
        handled[i] = true;
        let (primary, primary_nodes) = &routed[i];
        let mut members = Vec::new();
        for j in i + 1..routed.len() {
            if !handled[j] && rule.are_binding(&primary.logic_table, &routed[j].0.logic_table) {
                handled[j] = true;
                members.push(j);
            }
        }

        let align = |node: &DataNode, check_routed: bool| -> Option<TableMapping> {
            let index = primary.actual_table_index(&node.data_source, &node.table)?;
            let mut mapping = TableMapping::single(&primary.logic_table, &node.table);
            for &member in &members {
                let (table, nodes) = &routed[member];
                let actual = table.actual_tables_in(&node.data_source).into_iter().nth(index)?;
                if check_routed
                    && !nodes
                        .iter()
                        .any(|n| n.data_source == node.data_source && n.table == actual)
                {
                    return None;
                }
                mapping.insert(&table.logic_table, &actual);
            }
            Some(mapping)
        };

        let mut combos: Vec<(String, TableMapping)> = primary_nodes
            .iter()
            .filter_map(|node| align(node, true).map(|m| (node.data_source.clone(), m)))
            .collect();
        if combos.is_empty() {
            // Binding members disagree; any one aligned node yields the empty answer.
            debug!(table = %primary.logic_table, "binding tables routed to disjoint nodes");
            combos = primary_nodes
                .iter()
                .take(1)
                .filter_map(|node| align(node, false).map(|m| (node.data_source.clone(), m)))
                .collect();
        }
        if combos.is_empty() {
            return Err(ShardingError::NoDataNode(primary.logic_table.clone()));
        }
        groups.push(combos);
    }

    if groups.len() == 1 {
        return Ok(groups.remove(0));
    }

    let shared: Vec<String> = rule
        .data_source_names()
        .iter()
        .filter(|ds| {
            groups
                .iter()
                .all(|group| group.iter().any(|(data_source, _)| data_source == *ds))
        })
        .cloned()
        .collect();
    if shared.is_empty() {
        return Err(ShardingError::CrossDataSourceJoin {
            tables: routed
                .iter()
                .map(|(table, _)| table.logic_table.clone())
                .collect(),
        });
    }

    let mut result = Vec::new();
    for data_source in shared {
        let mut product = vec![TableMapping::new()];
        for group in &groups {
            let mut next = Vec::new();
            for partial in &product {
                for (_, mapping) in group.iter().filter(|(ds, _)| *ds == data_source) {
                    if let Some(merged) = partial.merged(mapping) {
                        next.push(merged);
                    }
                }
            }
            product = next;
        }
        result.extend(product.into_iter().map(|mapping| (data_source.clone(), mapping)));
    }
    Ok(result)
}

fn database_broadcast(rule: &ShardingRule) -> RouteContext {
    let mut route = RouteContext::new(RouteType::DatabaseBroadcast);
    for data_source in rule.data_source_names() {
        route.add(data_source, TableMapping::new());
    }
    route
}

fn unicast_first(rule: &ShardingRule) -> Result<RouteContext> {
    let data_source = rule
        .default_data_source()
        .or_else(|| rule.data_source_names().first().map(String::as_str))
        .ok_or_else(|| ShardingError::Config("no data source configured".to_string()))?;
    let mut route = RouteContext::new(RouteType::Unicast);
    route.add(data_source, TableMapping::new());
    Ok(route)
}

fn default_route(rule: &ShardingRule, logic_table: &str) -> Result<RouteContext> {
    let data_source = rule
        .default_data_source()
        .ok_or_else(|| ShardingError::NoRoute(logic_table.to_string()))?;
    let mut route = RouteContext::new(RouteType::Default);
    route.add(data_source, TableMapping::new());
    Ok(route)
}

fn unicast_table(rule: &ShardingRule, table: &TableRef) -> Result<RouteContext> {
    let logic_table = table.logic_name();
    if let Some(table_rule) = rule.table_rule(&logic_table) {
        let node = table_rule
            .data_nodes
            .first()
            .ok_or_else(|| ShardingError::NoDataNode(logic_table.clone()))?;
        let mut route = RouteContext::new(RouteType::Unicast);
        route.add(
            &node.data_source,
            TableMapping::single(&logic_table, &node.table),
        );
        return Ok(route);
    }
    if rule.is_broadcast(&logic_table) {
        return unicast_first(rule);
    }
    default_route(rule, &logic_table)
}

/// Rejects `SET <sharding column> = v` unless `v` equals the WHERE equality value.
fn validate_update(
    rule: &ShardingRule,
    update: &UpdateStatement,
    parameters: &[SqlValue],
    conditions: &ShardingConditions,
) -> Result<()> {
    let logic_table = update.table.logic_name();
    let Some(table) = rule.table_rule(&logic_table) else {
        return Ok(());
    };
    for assignment in &update.assignments {
        if !table.is_sharding_column(&assignment.column.name) {
            continue;
        }
        let column = assignment.column.name.to_ascii_lowercase();
        let assigned = resolve_value(&assignment.value, parameters)?;
        let current = conditions
            .for_table(&logic_table)
            .and_then(|condition| condition.values.get(&column));
        let unchanged = match (assigned, current) {
            (Some(value), Some(ConditionValue::Values(values))) if values.len() == 1 => {
                values.iter().all(|current| current.sql_eq(&value))
            }
            _ => false,
        };
        if !unchanged {
            return Err(ShardingError::ShardingValueUpdate {
                table: logic_table,
                column,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::extract;
    use crate::rule::tests::order_rule;

    fn route_with(
        engine: &RouteEngine,
        rule: &ShardingRule,
        sql: &str,
        params: &[SqlValue],
        hint: &HintManager,
    ) -> Result<RouteContext> {
        let ctx = StatementContext::parse(sql)?;
        let conditions = extract(&ctx, params, rule, None)?;
        engine.route(rule, &ctx, params, &conditions, hint)
    }

    fn route_sql(sql: &str) -> RouteContext {
        route_with(&RouteEngine::new(), &order_rule(), sql, &[], &HintManager::new()).expect("route")
    }

    #[test]
    fn equality_routes_to_one_table() {
        let route = route_sql("SELECT * FROM t_order WHERE order_id = 5");
        assert_eq!(route.route_type(), RouteType::Standard);
        assert_eq!(route.data_sources(), vec!["ds_0"]);
        assert_eq!(route.units()[0].actual_tables("t_order"), vec!["t_order_1"]);
        assert!(route.is_single());
    }

    #[test]
    fn unconditioned_table_fans_out_per_data_source() {
        let route = route_sql("SELECT * FROM t_order ORDER BY order_id");
        assert_eq!(route.data_sources(), vec!["ds_0", "ds_1"]);
        assert_eq!(route.execution_unit_count(), 4);
    }

    #[test]
    fn range_narrows_to_touched_suffixes() {
        let route = route_sql("SELECT * FROM t_order WHERE order_id BETWEEN 2 AND 3");
        assert_eq!(route.data_sources(), vec!["ds_1"]);
        assert_eq!(route.execution_unit_count(), 2);
    }

    #[test]
    fn binding_tables_align_by_position() {
        let route = route_sql(
            "SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id WHERE o.order_id = 6",
        );
        assert!(route.is_single());
        let mapping = &route.units()[0].table_mappings[0];
        assert_eq!(mapping.actual("t_order"), Some("t_order_2"));
        assert_eq!(mapping.actual("t_order_item"), Some("t_order_item_2"));

        let all = route_sql("SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id");
        assert_eq!(all.execution_unit_count(), 4);
    }

    #[test]
    fn broadcast_tables_unicast_reads_and_broadcast_writes() {
        let read = route_sql("SELECT * FROM t_config");
        assert_eq!(read.route_type(), RouteType::Unicast);
        assert_eq!(read.data_sources(), vec!["ds_0"]);

        let write = route_sql("UPDATE t_config SET setting = 'x' WHERE name = 'y'");
        assert_eq!(write.route_type(), RouteType::DatabaseBroadcast);
        assert_eq!(write.data_sources(), vec!["ds_0", "ds_1"]);

        let joined = route_sql("SELECT * FROM t_order o JOIN t_config c ON o.status = c.name WHERE o.order_id = 1");
        assert!(joined.is_single());
        assert_eq!(joined.units()[0].table_mappings[0].actual("t_config"), None);
    }

    #[test]
    fn unknown_tables_go_to_default_data_source() {
        let route = route_sql("SELECT * FROM t_user");
        assert_eq!(route.route_type(), RouteType::Default);
        assert_eq!(route.data_sources(), vec!["ds_0"]);

        let rule = ShardingRule::new(
            vec!["a".to_string(), "b".to_string()],
            vec![],
            vec![],
            vec![],
            None,
        )
        .expect("rule");
        let err = route_with(&RouteEngine::new(), &rule, "SELECT * FROM t_user", &[], &HintManager::new())
            .expect_err("no default");
        assert!(matches!(err, ShardingError::NoRoute(table) if table == "t_user"));
    }

    #[test]
    fn statement_types_broadcast_as_expected() {
        let ddl = route_sql("CREATE INDEX idx_status ON t_order (status)");
        assert_eq!(ddl.route_type(), RouteType::TableBroadcast);
        assert_eq!(ddl.execution_unit_count(), 4);

        let tcl = route_sql("BEGIN");
        assert_eq!(tcl.route_type(), RouteType::DatabaseBroadcast);
        assert_eq!(tcl.execution_unit_count(), 2);

        let describe = route_sql("DESCRIBE t_order");
        assert_eq!(describe.route_type(), RouteType::Unicast);
        assert_eq!(describe.units()[0].actual_tables("t_order"), vec!["t_order_0"]);

        let show = route_sql("SHOW TABLES");
        assert_eq!(show.data_sources(), vec!["ds_0", "ds_1"]);
    }

    #[test]
    fn insert_rows_each_route_to_one_node() {
        let route = route_sql("INSERT INTO t_order (order_id, status) VALUES (5, 'a'), (2, 'b'), (1, 'c')");
        assert_eq!(route.data_sources(), vec!["ds_0", "ds_1"]);
        let nodes: Vec<String> = route.insert_row_nodes().iter().map(ToString::to_string).collect();
        assert_eq!(nodes, vec!["ds_0.t_order_1", "ds_1.t_order_2", "ds_0.t_order_1"]);
        assert_eq!(route.execution_unit_count(), 2);

        let err = route_with(
            &RouteEngine::new(),
            &order_rule(),
            "INSERT INTO t_order (status) VALUES ('a')",
            &[],
            &HintManager::new(),
        )
        .expect_err("no sharding value");
        assert!(matches!(
            err,
            ShardingError::InsertRoutedToMultipleNodes { row: 0, nodes: 4, .. }
        ));
    }

    #[test]
    fn update_cannot_move_rows_between_shards() {
        let err = route_with(
            &RouteEngine::new(),
            &order_rule(),
            "UPDATE t_order SET order_id = 9 WHERE order_id = 5",
            &[],
            &HintManager::new(),
        )
        .expect_err("changes sharding value");
        assert!(matches!(err, ShardingError::ShardingValueUpdate { .. }));

        let same = route_sql("UPDATE t_order SET order_id = 5, status = 'x' WHERE order_id = 5");
        assert!(same.is_single());
    }

    #[test]
    fn hint_values_override_where_conditions() {
        let mut hint = HintManager::new();
        hint.add_table_value("t_order", 2);
        let route = route_with(
            &RouteEngine::new(),
            &order_rule(),
            "SELECT * FROM t_order WHERE order_id = 5",
            &[],
            &hint,
        )
        .expect("route");
        assert_eq!(route.route_type(), RouteType::Hint);
        assert_eq!(route.units()[0].actual_tables("t_order"), vec!["t_order_2"]);

        let mut forced = HintManager::new();
        forced.set_data_source("ds_1");
        let route = route_with(&RouteEngine::new(), &order_rule(), "SELECT * FROM t_order", &[], &forced)
            .expect("route");
        assert_eq!(route.data_sources(), vec!["ds_1"]);
        assert!(route.units()[0].table_mappings[0].is_empty());
    }

    #[test]
    fn algorithm_failures_fail_closed_unless_configured() {
        let sql = "SELECT * FROM t_order WHERE order_id = 'abc'";
        let err = route_with(&RouteEngine::new(), &order_rule(), sql, &[], &HintManager::new())
            .expect_err("not an integer");
        assert_eq!(err.category(), ErrorCategory::Condition);

        let route = route_with(
            &RouteEngine::new().with_fail_open(true),
            &order_rule(),
            sql,
            &[],
            &HintManager::new(),
        )
        .expect("fail open");
        assert_eq!(route.execution_unit_count(), 4);
    }

    #[test]
    fn execution_unit_guard() {
        let err = route_with(
            &RouteEngine::new().with_max_execution_units(3),
            &order_rule(),
            "SELECT * FROM t_order",
            &[],
            &HintManager::new(),
        )
        .expect_err("too many units");
        assert!(matches!(
            err,
            ShardingError::TooManyExecutionUnits { units: 4, limit: 3 }
        ));
    }

    #[test]
    fn contradictory_predicate_still_routes_one_node() {
        let route = route_sql("SELECT * FROM t_order WHERE order_id = 1 AND order_id = 2");
        assert!(route.is_single());
    }

    #[test]
    fn joins_without_shared_data_source_are_rejected() {
        let single = |name: &str, ds: &str| TableRule {
            logic_table: name.to_string(),
            data_nodes: vec![DataNode::new(ds, name)],
            database_strategy: ShardingStrategy::None,
            table_strategy: ShardingStrategy::None,
            key_generate: None,
        };
        let rule = ShardingRule::new(
            vec!["ds_0".to_string(), "ds_1".to_string()],
            vec![single("t_a", "ds_0"), single("t_b", "ds_1")],
            vec![],
            vec![],
            None,
        )
        .expect("rule");
        let err = route_with(
            &RouteEngine::new(),
            &rule,
            "SELECT * FROM t_a JOIN t_b ON t_a.id = t_b.id",
            &[],
            &HintManager::new(),
        )
        .expect_err("cross data source");
        assert!(matches!(err, ShardingError::CrossDataSourceJoin { .. }));
    }
}
