//! Schema Inspector contract and point-in-time schema snapshots
//!
//! Stages never look at the live schema. The Hub captures a
//! [`SchemaSnapshot`] when a stage needs one and passes it by reference,
//! so concurrent loads cannot change names under a running plan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SchemaError;

/// Inferred storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Unknown,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }

    /// Map a declared SQL type onto the inferred type
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"]
            .iter()
            .any(|t| upper.contains(t))
        {
            ColumnType::Real
        } else if ["CHAR", "TEXT", "CLOB"].iter().any(|t| upper.contains(t)) {
            ColumnType::Text
        } else {
            ColumnType::Unknown
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Unknown => "",
        }
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub inferred_type: ColumnType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, inferred_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            inferred_type,
        }
    }
}

/// Table entry returned by `list_tables`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub row_count: u64,
}

/// Read-only access to table and column metadata
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableDescriptor>, SchemaError>;

    /// Fails with [`SchemaError::UnknownTable`] for unknown names
    async fn describe(&self, table_name: &str) -> Result<Vec<ColumnInfo>, SchemaError>;
}

/// One table in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub row_count: u64,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn numeric_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.inferred_type.is_numeric())
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Immutable view of the schema taken at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
    pub taken_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables,
            taken_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Read every table through the inspector, bounded by `timeout`
    pub async fn capture(
        inspector: &dyn SchemaInspector,
        timeout: Duration,
    ) -> Result<Self, SchemaError> {
        let read = async {
            let mut tables = Vec::new();
            for descriptor in inspector.list_tables().await? {
                match inspector.describe(&descriptor.name).await {
                    Ok(columns) => tables.push(TableSchema {
                        name: descriptor.name,
                        row_count: descriptor.row_count,
                        columns,
                    }),
                    // Dropped between list and describe.
                    Err(SchemaError::UnknownTable(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(Self::new(tables))
        };

        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| SchemaError::Unavailable(format!("schema read timed out after {:?}", timeout)))?
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Tables that contain a column with this name
    pub fn tables_with_column(&self, column: &str) -> Vec<&TableSchema> {
        self.tables
            .iter()
            .filter(|t| t.column(column).is_some())
            .collect()
    }
}

/// Closest candidates to `name`, best first, at most three
pub fn suggest(name: &str, candidates: &[String]) -> Vec<String> {
    let needle = name.to_ascii_lowercase();
    let threshold = (needle.len() / 3).max(2);

    let mut scored: Vec<(usize, &String)> = candidates
        .iter()
        .filter_map(|c| {
            let hay = c.to_ascii_lowercase();
            let distance = edit_distance(&needle, &hay);
            let related = hay.contains(&needle) || needle.contains(&hay);
            (distance <= threshold || related).then_some((distance, c))
        })
        .collect();

    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().take(3).map(|(_, c)| c.clone()).collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> TableSchema {
        TableSchema {
            name: "products".into(),
            row_count: 3,
            columns: vec![
                ColumnInfo::new("id", ColumnType::Integer),
                ColumnInfo::new("name", ColumnType::Text),
                ColumnInfo::new("price", ColumnType::Real),
            ],
        }
    }

    #[test]
    fn test_declared_type_mapping() {
        assert_eq!(ColumnType::from_declared("BIGINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("double precision"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("VARCHAR(20)"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Unknown);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let snapshot = SchemaSnapshot::new(vec![products()]);
        assert!(snapshot.table("PRODUCTS").is_some());
        assert_eq!(
            snapshot.table("products").unwrap().column("Price").unwrap().name,
            "price"
        );
        assert_eq!(snapshot.tables_with_column("name").len(), 1);
    }

    #[test]
    fn test_suggest_finds_typos_only() {
        let names = products().column_names();
        assert_eq!(suggest("prise", &names), vec!["price".to_string()]);
        assert!(suggest("salary", &names).is_empty());
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }
}
