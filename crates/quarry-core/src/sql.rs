//! SQL text rendering for plans and statistic templates
//!
//! Everything here produces a single read-only `SELECT`. Identifiers are
//! always double-quoted and literals escaped, so names taken from user
//! data cannot break out of their position.

use serde_json::Value;
use thiserror::Error;

use crate::types::{AggregateKind, Comparator, Operation, QueryPlan, StatRequest};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SqlRenderError {
    #[error("plan must target exactly one table, found {0}")]
    TableCount(usize),

    #[error("median cannot be combined with grouping")]
    GroupedMedian,
}

/// Double-quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a JSON value as an SQL literal
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn aggregate_expr(kind: AggregateKind, column: Option<&str>, table: &str, conditions: &[String]) -> String {
    let col = column.map(quote_ident);
    match (kind, col) {
        (AggregateKind::Count, None) => "COUNT(*)".to_string(),
        (AggregateKind::Count, Some(c)) => format!("COUNT({})", c),
        (AggregateKind::Avg, Some(c)) => format!("AVG({})", c),
        (AggregateKind::Sum, Some(c)) => format!("SUM({})", c),
        (AggregateKind::Min, Some(c)) => format!("MIN({})", c),
        (AggregateKind::Max, Some(c)) => format!("MAX({})", c),
        (AggregateKind::Median, Some(c)) => median_expr(table, &c, conditions),
        // Numeric aggregates without a column degrade to a row count.
        (_, None) => "COUNT(*)".to_string(),
    }
}

/// Scalar sub-query computing the median of an already-quoted column
fn median_expr(table: &str, column: &str, conditions: &[String]) -> String {
    let table = quote_ident(table);
    let mut clauses = vec![format!("{} IS NOT NULL", column)];
    clauses.extend(conditions.iter().cloned());
    let filter = clauses.join(" AND ");

    format!(
        "(SELECT AVG(v) FROM (SELECT {col} AS v FROM {table} WHERE {filter} ORDER BY {col} \
         LIMIT 2 - (SELECT COUNT(*) FROM {table} WHERE {filter}) % 2 \
         OFFSET (SELECT (COUNT(*) - 1) / 2 FROM {table} WHERE {filter})))",
        col = column,
        table = table,
        filter = filter
    )
}

fn alias(kind: AggregateKind, column: Option<&str>, single: bool) -> String {
    if single {
        return "value".to_string();
    }
    match column {
        Some(c) => format!("{}_{}", kind.label(), c),
        None => format!("{}_rows", kind.label()),
    }
}

fn condition(column: &str, comparator: Comparator, value: &Value) -> String {
    match (comparator, value) {
        (Comparator::Eq, Value::Null) => format!("{} IS NULL", quote_ident(column)),
        (Comparator::NotEq, Value::Null) => format!("{} IS NOT NULL", quote_ident(column)),
        _ => format!("{} {} {}", quote_ident(column), comparator.sql(), literal(value)),
    }
}

/// Render a resolved plan into query text
pub fn render_plan(plan: &QueryPlan) -> Result<String, SqlRenderError> {
    let table = plan
        .primary_table()
        .ok_or(SqlRenderError::TableCount(plan.target_tables.len()))?;

    let mut projection = Vec::new();
    let mut aggregates = Vec::new();
    let mut groups = Vec::new();
    let mut conditions = Vec::new();
    let mut order = Vec::new();
    let mut limit = None;

    for op in &plan.requested_operations {
        match op {
            Operation::Project { columns } => projection.extend(columns.iter().cloned()),
            Operation::Aggregate { kind, column } => aggregates.push((*kind, column.clone())),
            Operation::GroupBy { columns } => groups.extend(columns.iter().cloned()),
            Operation::Filter {
                column,
                comparator,
                value,
            } => conditions.push(condition(column, *comparator, value)),
            Operation::OrderBy { column, descending } => order.push(format!(
                "{}{}",
                quote_ident(column),
                if *descending { " DESC" } else { "" }
            )),
            Operation::Limit { count } => limit = Some(*count),
        }
    }

    if !groups.is_empty() && aggregates.iter().any(|(k, _)| *k == AggregateKind::Median) {
        return Err(SqlRenderError::GroupedMedian);
    }

    let mut select: Vec<String> = Vec::new();
    if aggregates.is_empty() {
        if projection.is_empty() {
            select.push("*".to_string());
        } else {
            select.extend(projection.iter().map(|c| quote_ident(c)));
        }
    } else {
        select.extend(groups.iter().map(|c| quote_ident(c)));
        let single = aggregates.len() == 1;
        for (kind, column) in &aggregates {
            select.push(format!(
                "{} AS {}",
                aggregate_expr(*kind, column.as_deref(), table, &conditions),
                quote_ident(&alias(*kind, column.as_deref(), single))
            ));
        }
    }

    let mut sql = format!("SELECT {} FROM {}", select.join(", "), quote_ident(table));
    if !conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    if !aggregates.is_empty() && !groups.is_empty() {
        let group_list: Vec<String> = groups.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(" GROUP BY {}", group_list.join(", ")));
        if order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", group_list.join(", ")));
        }
    }
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    Ok(sql)
}

/// Query text for a direct statistic
pub fn stat_query(stat: &StatRequest) -> String {
    if let Some(value) = &stat.matching {
        return count_matching(&stat.table, &stat.column, value);
    }
    format!(
        "SELECT {} AS \"value\" FROM {}",
        aggregate_expr(stat.kind, Some(stat.column.as_str()), &stat.table, &[]),
        quote_ident(&stat.table)
    )
}

/// Range probe used for plausibility checks: min, max and non-null count
pub fn range_probe(table: &str, column: &str) -> String {
    let c = quote_ident(column);
    format!(
        "SELECT MIN({c}), MAX({c}), COUNT({c}) FROM {t}",
        c = c,
        t = quote_ident(table)
    )
}

/// Count rows whose column equals a value
pub fn count_matching(table: &str, column: &str, value: &Value) -> String {
    format!(
        "SELECT COUNT(*) AS \"value\" FROM {} WHERE {}",
        quote_ident(table),
        condition(column, Comparator::Eq, value)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn plan(ops: Vec<Operation>) -> QueryPlan {
        QueryPlan {
            id: Uuid::new_v4(),
            objective: "test".into(),
            target_tables: ["sales".to_string()].into_iter().collect(),
            target_columns: BTreeSet::new(),
            requested_operations: ops,
            plan_attempt: 1,
        }
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(literal(&Value::from("O'Brien")), "'O''Brien'");
        assert_eq!(literal(&Value::from(3.5)), "3.5");
    }

    #[test]
    fn test_grouped_sum_with_filter() {
        let sql = render_plan(&plan(vec![
            Operation::Aggregate {
                kind: AggregateKind::Sum,
                column: Some("amount".into()),
            },
            Operation::GroupBy {
                columns: vec!["region".into()],
            },
            Operation::Filter {
                column: "year".into(),
                comparator: Comparator::Gte,
                value: Value::from(2023),
            },
        ]))
        .unwrap();

        assert_eq!(
            sql,
            "SELECT \"region\", SUM(\"amount\") AS \"value\" FROM \"sales\" \
             WHERE \"year\" >= 2023 GROUP BY \"region\" ORDER BY \"region\""
        );
    }

    #[test]
    fn test_projection_with_order_and_limit() {
        let sql = render_plan(&plan(vec![
            Operation::Project {
                columns: vec!["name".into()],
            },
            Operation::OrderBy {
                column: "amount".into(),
                descending: true,
            },
            Operation::Limit { count: 5 },
        ]))
        .unwrap();

        assert_eq!(
            sql,
            "SELECT \"name\" FROM \"sales\" ORDER BY \"amount\" DESC LIMIT 5"
        );
    }

    #[test]
    fn test_grouped_median_is_refused() {
        let err = render_plan(&plan(vec![
            Operation::Aggregate {
                kind: AggregateKind::Median,
                column: Some("amount".into()),
            },
            Operation::GroupBy {
                columns: vec!["region".into()],
            },
        ]))
        .unwrap_err();
        assert_eq!(err, SqlRenderError::GroupedMedian);
    }

    #[test]
    fn test_stat_query() {
        let sql = stat_query(&StatRequest {
            kind: AggregateKind::Avg,
            table: "products".into(),
            column: "price".into(),
            matching: None,
        });
        assert_eq!(sql, "SELECT AVG(\"price\") AS \"value\" FROM \"products\"");

        let sql = stat_query(&StatRequest {
            kind: AggregateKind::Count,
            table: "products".into(),
            column: "category".into(),
            matching: Some(Value::from("Books")),
        });
        assert_eq!(
            sql,
            "SELECT COUNT(*) AS \"value\" FROM \"products\" WHERE \"category\" = 'Books'"
        );
    }
}
