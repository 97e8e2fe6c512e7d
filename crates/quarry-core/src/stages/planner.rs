//! Planner - turns a request into a declarative plan
//!
//! The capability proposes a [`PlanDraft`] with free-text names; the
//! planner resolves every table and column against the schema snapshot
//! it was handed. A name that does not resolve fails the plan with
//! [`PlanningError::UnknownReference`] naming the valid alternatives.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::capability::{invoke_with_timeout, CapabilityGateway, CapabilityRequest, HistoryTurn, PlanDraft};
use crate::error::{PlanningError, ReferenceKind, StageError};
use crate::schema::{suggest, SchemaSnapshot, TableSchema};
use crate::types::{Operation, QueryPlan};

pub struct Planner {
    gateway: Arc<dyn CapabilityGateway>,
    timeout: Duration,
}

impl Planner {
    pub fn new(gateway: Arc<dyn CapabilityGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    /// Draft and resolve a plan; `feedback` carries the previous attempt's diagnostic
    pub async fn plan(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        history: Vec<HistoryTurn>,
        feedback: Option<String>,
        plan_attempt: u32,
    ) -> Result<QueryPlan, StageError> {
        if schema.is_empty() {
            return Err(PlanningError::NoTables.into());
        }

        let draft = invoke_with_timeout(
            self.gateway.as_ref(),
            CapabilityRequest::Plan {
                question: question.to_string(),
                schema: schema.clone(),
                history,
                feedback,
            },
            self.timeout,
        )
        .await?
        .into_plan()?;

        let mut plan = resolve(draft, schema, plan_attempt)?;
        if plan.objective.trim().is_empty() {
            plan.objective = question.to_string();
        }
        Ok(plan)
    }
}

/// Resolve a draft against a snapshot
pub fn resolve(draft: PlanDraft, schema: &SchemaSnapshot, plan_attempt: u32) -> Result<QueryPlan, PlanningError> {
    if schema.is_empty() {
        return Err(PlanningError::NoTables);
    }

    let mentioned: Vec<String> = draft
        .columns
        .iter()
        .cloned()
        .chain(
            draft
                .operations
                .iter()
                .flat_map(|op| op.columns().into_iter().map(String::from)),
        )
        .collect();

    let table_names = if draft.tables.is_empty() {
        vec![default_table(schema, &mentioned)?.name.clone()]
    } else {
        draft.tables.clone()
    };

    let mut scope: Vec<&TableSchema> = Vec::new();
    for name in &table_names {
        let table = schema.table(name).ok_or_else(|| PlanningError::UnknownReference {
            kind: ReferenceKind::Table,
            name: name.clone(),
            table: None,
            suggestions: suggest(name, &schema.table_names()),
            available: schema.table_names(),
        })?;
        if !scope.iter().any(|t| t.name == table.name) {
            scope.push(table);
        }
    }

    let resolve_column = |name: &str| -> Result<String, PlanningError> {
        scope
            .iter()
            .find_map(|t| t.column(name))
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                let available: Vec<String> = scope.iter().flat_map(|t| t.column_names()).collect();
                PlanningError::UnknownReference {
                    kind: ReferenceKind::Column,
                    name: name.to_string(),
                    table: (scope.len() == 1).then(|| scope[0].name.clone()),
                    suggestions: suggest(name, &available),
                    available,
                }
            })
    };

    let mut target_columns = BTreeSet::new();
    for name in &mentioned {
        target_columns.insert(resolve_column(name)?);
    }

    let mut operations = Vec::with_capacity(draft.operations.len());
    for op in draft.operations {
        let op = canonicalize(op, &resolve_column)?;
        if let Operation::Aggregate { kind, column } = &op {
            check_aggregate(*kind, column.as_deref(), &scope)?;
        }
        operations.push(op);
    }

    Ok(QueryPlan {
        id: Uuid::new_v4(),
        objective: draft.objective,
        target_tables: scope.iter().map(|t| t.name.clone()).collect(),
        target_columns,
        requested_operations: operations,
        plan_attempt,
    })
}

fn default_table<'a>(schema: &'a SchemaSnapshot, mentioned: &[String]) -> Result<&'a TableSchema, PlanningError> {
    if schema.tables.len() == 1 {
        return Ok(&schema.tables[0]);
    }
    if let Some(first) = mentioned.first() {
        let candidates = schema.tables_with_column(first);
        if candidates.len() == 1 {
            return Ok(candidates[0]);
        }
    }
    Err(PlanningError::NoTarget)
}

fn canonicalize<F>(op: Operation, resolve: &F) -> Result<Operation, PlanningError>
where
    F: Fn(&str) -> Result<String, PlanningError>,
{
    let all = |columns: Vec<String>| -> Result<Vec<String>, PlanningError> {
        columns.iter().map(|c| resolve(c)).collect()
    };

    Ok(match op {
        Operation::Project { columns } => Operation::Project { columns: all(columns)? },
        Operation::GroupBy { columns } => Operation::GroupBy { columns: all(columns)? },
        Operation::Aggregate { kind, column } => Operation::Aggregate {
            kind,
            column: column.map(|c| resolve(&c)).transpose()?,
        },
        Operation::Filter {
            column,
            comparator,
            value,
        } => Operation::Filter {
            column: resolve(&column)?,
            comparator,
            value,
        },
        Operation::OrderBy { column, descending } => Operation::OrderBy {
            column: resolve(&column)?,
            descending,
        },
        limit @ Operation::Limit { .. } => limit,
    })
}

fn check_aggregate(
    kind: crate::types::AggregateKind,
    column: Option<&str>,
    scope: &[&TableSchema],
) -> Result<(), PlanningError> {
    let Some(column) = column else {
        if kind.needs_numeric() {
            return Err(PlanningError::MissingColumn {
                aggregate: kind.label().to_string(),
                available: scope.iter().flat_map(|t| t.numeric_columns()).collect(),
            });
        }
        return Ok(());
    };

    if !kind.needs_numeric() {
        return Ok(());
    }

    for table in scope {
        if let Some(info) = table.column(column) {
            if info.inferred_type == crate::schema::ColumnType::Text {
                return Err(PlanningError::NonNumericAggregate {
                    aggregate: kind.label().to_string(),
                    column: info.name.clone(),
                    table: table.name.clone(),
                    numeric_columns: table.numeric_columns(),
                });
            }
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityReply, ScriptedCapability, StageName};
    use crate::schema::{ColumnInfo, ColumnType};
    use crate::types::AggregateKind;

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(vec![
            TableSchema {
                name: "products".into(),
                row_count: 3,
                columns: vec![
                    ColumnInfo::new("id", ColumnType::Integer),
                    ColumnInfo::new("name", ColumnType::Text),
                    ColumnInfo::new("price", ColumnType::Real),
                ],
            },
            TableSchema {
                name: "Sales".into(),
                row_count: 2,
                columns: vec![
                    ColumnInfo::new("Region", ColumnType::Text),
                    ColumnInfo::new("amount", ColumnType::Real),
                ],
            },
        ])
    }

    fn draft(tables: &[&str], ops: Vec<Operation>) -> PlanDraft {
        PlanDraft {
            objective: "q".into(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            columns: vec![],
            operations: ops,
        }
    }

    #[test]
    fn test_names_are_canonicalized() {
        let plan = resolve(
            draft(
                &["sales"],
                vec![
                    Operation::Aggregate {
                        kind: AggregateKind::Sum,
                        column: Some("AMOUNT".into()),
                    },
                    Operation::GroupBy {
                        columns: vec!["region".into()],
                    },
                ],
            ),
            &schema(),
            1,
        )
        .unwrap();

        assert_eq!(plan.primary_table(), Some("Sales"));
        assert!(plan.target_columns.contains("Region"));
        assert!(plan.target_columns.contains("amount"));
    }

    #[test]
    fn test_unknown_column_lists_alternatives() {
        let err = resolve(
            draft(
                &["products"],
                vec![Operation::Aggregate {
                    kind: AggregateKind::Avg,
                    column: Some("salary".into()),
                }],
            ),
            &schema(),
            1,
        )
        .unwrap_err();

        match &err {
            PlanningError::UnknownReference {
                kind,
                name,
                table,
                available,
                ..
            } => {
                assert_eq!(*kind, ReferenceKind::Column);
                assert_eq!(name, "salary");
                assert_eq!(table.as_deref(), Some("products"));
                assert_eq!(available, &vec!["id".to_string(), "name".into(), "price".into()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(err.diagnostic().contains("Available: id, name, price"));
    }

    #[test]
    fn test_unknown_table() {
        let err = resolve(draft(&["product"], vec![]), &schema(), 1).unwrap_err();
        assert!(matches!(
            err,
            PlanningError::UnknownReference { kind: ReferenceKind::Table, ref suggestions, .. }
                if suggestions == &vec!["products".to_string()]
        ));
    }

    #[test]
    fn test_text_average_is_refused() {
        let err = resolve(
            draft(
                &["products"],
                vec![Operation::Aggregate {
                    kind: AggregateKind::Avg,
                    column: Some("name".into()),
                }],
            ),
            &schema(),
            1,
        )
        .unwrap_err();
        assert!(err.diagnostic().contains("Numeric columns: id, price"));
    }

    #[test]
    fn test_table_inferred_from_unique_column() {
        let plan = resolve(
            PlanDraft {
                objective: "q".into(),
                tables: vec![],
                columns: vec!["amount".into()],
                operations: vec![],
            },
            &schema(),
            2,
        )
        .unwrap();
        assert_eq!(plan.primary_table(), Some("Sales"));
        assert_eq!(plan.plan_attempt, 2);
    }

    #[tokio::test]
    async fn test_empty_schema_fails_without_capability_call() {
        let gateway = Arc::new(ScriptedCapability::new());
        let planner = Planner::new(gateway.clone(), Duration::from_secs(1));

        let err = planner
            .plan("avg price", &SchemaSnapshot::empty(), vec![], None, 1)
            .await
            .unwrap_err();

        assert_eq!(err, StageError::Planning(PlanningError::NoTables));
        assert_eq!(gateway.call_count(StageName::Planner), 0);
    }

    #[tokio::test]
    async fn test_feedback_is_forwarded() {
        let gateway = Arc::new(ScriptedCapability::new());
        gateway.push(
            StageName::Planner,
            Ok(CapabilityReply::Plan(draft(&["products"], vec![]))),
        );
        let planner = Planner::new(gateway.clone(), Duration::from_secs(1));

        planner
            .plan("list products", &schema(), vec![], Some("try again".into()), 2)
            .await
            .unwrap();

        match &gateway.requests()[0] {
            CapabilityRequest::Plan { feedback, .. } => assert_eq!(feedback.as_deref(), Some("try again")),
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
