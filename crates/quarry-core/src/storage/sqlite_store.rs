//! SqliteStore - the analytic tables behind the pipeline
//!
//! One SQLite connection serves three roles:
//! - [`SchemaInspector`]: table and column metadata
//! - [`QueryExecutor`]: read-only query execution
//! - [`DataLoader`]: CSV / JSON ingestion into new tables
//!
//! Blocking SQLite calls run on the blocking pool. A query ceiling is
//! enforced by a progress handler installed for that one statement, with
//! the clock started once the statement holds the connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{
    ExecutionError, ExecutionErrorKind, LoadError, QuarryError, Result, ResultExt, SchemaError,
};
use crate::executor::{find_mutating_keyword, has_multiple_statements, timeout_error, QueryExecutor};
use crate::schema::{ColumnInfo, ColumnType, SchemaInspector, TableDescriptor};
use crate::sql::quote_ident;
use crate::stages::loader::{DataLoader, LoadFailure, LoadReport, LoadedTable};
use crate::types::{DataSourceDescriptor, ResultSet};

const SUPPORTED_EXTENSIONS: &[&str] = &["csv", "json"];

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file; `":memory:"` opens a private in-memory database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(QuarryError::from)
                    .with_context(|| format!("Creating database directory '{}'", parent.display()))?;
            }
            let conn = Connection::open(path)
                .map_err(QuarryError::from)
                .with_context(|| format!("Opening SQLite database '{}'", path.display()))?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Create (or replace) a table from already-typed rows
    pub fn create_table(
        &self,
        table: &str,
        columns: &[ColumnInfo],
        rows: &[Vec<Value>],
    ) -> std::result::Result<u64, LoadError> {
        let mut conn = self.conn.lock();
        write_table(&mut conn, table, columns, rows)
    }

    async fn blocking<T, F>(&self, f: F) -> std::result::Result<T, String>
    where
        F: FnOnce(&mut Connection) -> T + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| format!("storage task failed: {}", e))
    }
}

#[async_trait]
impl SchemaInspector for SqliteStore {
    async fn list_tables(&self) -> std::result::Result<Vec<TableDescriptor>, SchemaError> {
        self.blocking(|conn| list_tables(conn))
            .await
            .map_err(SchemaError::Unavailable)?
            .map_err(|e| SchemaError::Unavailable(e.to_string()))
    }

    async fn describe(&self, table_name: &str) -> std::result::Result<Vec<ColumnInfo>, SchemaError> {
        let table = table_name.to_string();
        let columns = self
            .blocking(move |conn| describe(conn, &table))
            .await
            .map_err(SchemaError::Unavailable)?
            .map_err(|e| SchemaError::Unavailable(e.to_string()))?;

        if columns.is_empty() {
            return Err(SchemaError::UnknownTable(table_name.to_string()));
        }
        Ok(columns)
    }
}

#[async_trait]
impl QueryExecutor for SqliteStore {
    async fn run(&self, query: &str) -> std::result::Result<ResultSet, ExecutionError> {
        check_read_only(query)?;
        let query = query.to_string();
        self.blocking(move |conn| execute_read_only(conn, &query))
            .await
            .map_err(|e| ExecutionError::new(ExecutionErrorKind::Other, e))?
    }

    async fn run_within(
        &self,
        query: &str,
        timeout: Duration,
    ) -> std::result::Result<ResultSet, ExecutionError> {
        check_read_only(query)?;
        let query = query.to_string();
        self.blocking(move |conn| {
            let deadline = Instant::now() + timeout;
            conn.progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));
            let outcome = execute_read_only(conn, &query);
            conn.progress_handler(0, None::<fn() -> bool>);

            outcome.map_err(|e| match e.kind {
                ExecutionErrorKind::Timeout => timeout_error(timeout),
                _ => e,
            })
        })
        .await
        .map_err(|e| ExecutionError::new(ExecutionErrorKind::Other, e))?
    }
}

/// Virtual machine steps between deadline checks
const PROGRESS_STEPS: i32 = 1_000;

fn check_read_only(query: &str) -> std::result::Result<(), ExecutionError> {
    if let Some(keyword) = find_mutating_keyword(query) {
        return Err(ExecutionError::new(
            ExecutionErrorKind::Forbidden,
            format!("'{}' is not allowed; only read-only queries run", keyword),
        ));
    }
    if has_multiple_statements(query) {
        return Err(ExecutionError::new(
            ExecutionErrorKind::Forbidden,
            "only a single statement may run",
        ));
    }
    Ok(())
}

#[async_trait]
impl DataLoader for SqliteStore {
    async fn load(&self, source: &DataSourceDescriptor) -> std::result::Result<LoadReport, LoadError> {
        let source = source.clone();
        self.blocking(move |conn| load_source(conn, &source))
            .await
            .map_err(|e| LoadError::Storage {
                table: String::new(),
                message: e,
            })?
    }
}

fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<TableDescriptor>> {
    let names = table_names(conn)?;
    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let row_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
            [],
            |row| row.get(0),
        )?;
        tables.push(TableDescriptor {
            name,
            row_count: row_count.max(0) as u64,
        });
    }
    Ok(tables)
}

fn table_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn describe(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let declared: String = row.get(2)?;
            Ok(ColumnInfo::new(name, ColumnType::from_declared(&declared)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn execute_read_only(conn: &Connection, query: &str) -> std::result::Result<ResultSet, ExecutionError> {
    let text = query.trim().trim_end_matches(';').trim();
    if text.is_empty() {
        return Err(ExecutionError::new(ExecutionErrorKind::Syntax, "empty query"));
    }

    let mut stmt = conn.prepare(text).map_err(|e| classify(conn, e))?;
    if !stmt.readonly() {
        return Err(ExecutionError::new(
            ExecutionErrorKind::Forbidden,
            "statement is not read-only",
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(|e| classify(conn, e))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| classify(conn, e))? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i).map_err(|e| classify(conn, e))?));
        }
        out.push(values);
    }

    Ok(ResultSet { columns, rows: out })
}

fn classify(conn: &Connection, e: rusqlite::Error) -> ExecutionError {
    if matches!(e, rusqlite::Error::MultipleStatement) {
        return ExecutionError::new(ExecutionErrorKind::Forbidden, "only a single statement may run");
    }
    if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        return ExecutionError::new(ExecutionErrorKind::Timeout, e.to_string());
    }

    let message = e.to_string();
    let lower = message.to_lowercase();

    if lower.contains("no such table") {
        let available = table_names(conn).unwrap_or_default();
        ExecutionError::new(
            ExecutionErrorKind::MissingReference,
            format!("{}. Available tables: {}", message, available.join(", ")),
        )
    } else if lower.contains("no such column") {
        ExecutionError::new(ExecutionErrorKind::MissingReference, message)
    } else if lower.contains("syntax error")
        || lower.contains("incomplete input")
        || lower.contains("unrecognized token")
    {
        ExecutionError::new(ExecutionErrorKind::Syntax, message)
    } else {
        ExecutionError::new(ExecutionErrorKind::Other, message)
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn write_table(
    conn: &mut Connection,
    table: &str,
    columns: &[ColumnInfo],
    rows: &[Vec<Value>],
) -> std::result::Result<u64, LoadError> {
    let storage_err = |e: rusqlite::Error| LoadError::Storage {
        table: table.to_string(),
        message: e.to_string(),
    };

    let definition: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.inferred_type.sql()).trim_end().to_string())
        .collect();
    let placeholders = vec!["?"; columns.len()].join(", ");

    let tx = conn.transaction().map_err(storage_err)?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {t}; CREATE TABLE {t} ({cols});",
        t = quote_ident(table),
        cols = definition.join(", ")
    ))
    .map_err(storage_err)?;

    {
        let mut insert = tx
            .prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(table),
                placeholders
            ))
            .map_err(storage_err)?;
        for row in rows {
            insert
                .execute(rusqlite::params_from_iter(row.iter().map(to_sql)))
                .map_err(storage_err)?;
        }
    }

    tx.commit().map_err(storage_err)?;
    Ok(rows.len() as u64)
}

fn load_source(conn: &mut Connection, source: &DataSourceDescriptor) -> std::result::Result<LoadReport, LoadError> {
    let path = PathBuf::from(&source.location);
    let display = source.location.clone();

    let metadata = std::fs::metadata(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => LoadError::PermissionDenied(display.clone()),
        _ => LoadError::NotFound(display.clone()),
    })?;

    if metadata.is_file() {
        let table = source
            .table_name
            .as_deref()
            .map(sanitize_name)
            .unwrap_or_else(|| table_name_for(&path));
        let loaded = load_file(conn, &path, &table)?;
        return Ok(LoadReport {
            loaded: vec![loaded],
            failures: Vec::new(),
        });
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(&path)
        .map_err(|_| LoadError::PermissionDenied(display.clone()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_supported(p))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(LoadError::NoSupportedFiles(display));
    }

    let mut report = LoadReport::default();
    for file in files {
        let table = table_name_for(&file);
        match load_file(conn, &file, &table) {
            Ok(loaded) => report.loaded.push(loaded),
            Err(error) => report.failures.push(LoadFailure {
                source: file.display().to_string(),
                error,
            }),
        }
    }
    Ok(report)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn table_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("data");
    sanitize_name(stem)
}

/// Lowercase identifier made of `[a-z0-9_]`, never starting with a digit
pub fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.is_empty() {
        name.push_str("data");
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }
    name
}

fn load_file(conn: &mut Connection, path: &Path, table: &str) -> std::result::Result<LoadedTable, LoadError> {
    let display = path.display().to_string();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let (columns, rows) = match extension.as_deref() {
        Some("csv") => read_csv(path)?,
        Some("json") => read_json(path)?,
        _ => return Err(LoadError::Unsupported(display)),
    };

    if rows.is_empty() || columns.is_empty() {
        return Err(LoadError::Empty(display));
    }

    let row_count = write_table(conn, table, &columns, &rows)?;
    tracing::info!(table, rows = row_count, source = %path.display(), "Table loaded");

    Ok(LoadedTable {
        table: table.to_string(),
        source: display,
        row_count,
        columns,
    })
}

fn unique_headers(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, h)| {
            let base = match h.trim() {
                "" => format!("column_{}", i + 1),
                trimmed => trimmed.to_string(),
            };
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.to_ascii_lowercase()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            name
        })
        .collect()
}

type Parsed = (Vec<ColumnInfo>, Vec<Vec<Value>>);

fn read_csv(path: &Path) -> std::result::Result<Parsed, LoadError> {
    let display = path.display().to_string();
    let parse_err = |e: csv::Error| LoadError::Parse {
        path: display.clone(),
        message: e.to_string(),
    };

    let mut reader = csv::Reader::from_path(path).map_err(parse_err)?;
    let headers = unique_headers(reader.headers().map_err(parse_err)?.iter().map(String::from).collect());

    let mut raw: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(parse_err)?;
        raw.push(record.iter().map(|f| f.trim().to_string()).collect());
    }

    let types: Vec<ColumnType> = (0..headers.len())
        .map(|i| infer_type(raw.iter().filter_map(|r| r.get(i)).map(String::as_str)))
        .collect();

    let rows = raw
        .into_iter()
        .map(|record| {
            types
                .iter()
                .enumerate()
                .map(|(i, ty)| convert(record.get(i).map(String::as_str).unwrap_or(""), *ty))
                .collect()
        })
        .collect();

    let columns = headers
        .into_iter()
        .zip(types)
        .map(|(name, ty)| ColumnInfo::new(name, ty))
        .collect();
    Ok((columns, rows))
}

fn infer_type<'a>(cells: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut ty = ColumnType::Integer;
    let mut any = false;
    for cell in cells.filter(|c| !c.is_empty()) {
        any = true;
        if ty == ColumnType::Integer && cell.parse::<i64>().is_err() {
            ty = ColumnType::Real;
        }
        if ty == ColumnType::Real && cell.parse::<f64>().is_err() {
            return ColumnType::Text;
        }
    }
    if any {
        ty
    } else {
        ColumnType::Text
    }
}

fn convert(cell: &str, ty: ColumnType) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    match ty {
        ColumnType::Integer => cell.parse::<i64>().map_or(Value::Null, Value::from),
        ColumnType::Real => cell
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
        _ => Value::String(cell.to_string()),
    }
}

fn read_json(path: &Path) -> std::result::Result<Parsed, LoadError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| LoadError::Parse {
        path: display.clone(),
        message: e.to_string(),
    })?;
    if text.trim().is_empty() {
        return Err(LoadError::Empty(display));
    }

    let value: Value = serde_json::from_str(&text).map_err(|e| LoadError::Parse {
        path: display.clone(),
        message: e.to_string(),
    })?;
    let Value::Array(items) = value else {
        return Err(LoadError::Parse {
            path: display,
            message: "expected an array of objects".to_string(),
        });
    };

    let mut records = Vec::with_capacity(items.len());
    let mut keys: Vec<String> = Vec::new();
    for item in items {
        let Value::Object(map) = item else {
            return Err(LoadError::Parse {
                path: display,
                message: "every array element must be an object".to_string(),
            });
        };
        for key in map.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        records.push(map);
    }

    let types: Vec<ColumnType> = keys
        .iter()
        .map(|k| json_type(records.iter().filter_map(|r| r.get(k))))
        .collect();

    let rows = records
        .iter()
        .map(|r| {
            keys.iter()
                .zip(&types)
                .map(|(k, ty)| match r.get(k) {
                    None | Some(Value::Null) => Value::Null,
                    Some(Value::Bool(b)) => Value::from(i64::from(*b)),
                    Some(v @ Value::Number(_)) if ty.is_numeric() => v.clone(),
                    Some(Value::String(s)) => Value::String(s.clone()),
                    Some(other) => Value::String(other.to_string()),
                })
                .collect()
        })
        .collect();

    let columns = unique_headers(keys)
        .into_iter()
        .zip(types)
        .map(|(name, ty)| ColumnInfo::new(name, ty))
        .collect();
    Ok((columns, rows))
}

fn json_type<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnType {
    let mut ty = ColumnType::Integer;
    let mut any = false;
    for value in values {
        match value {
            Value::Null => continue,
            Value::Bool(_) => {}
            Value::Number(n) if n.is_i64() || n.is_u64() => {}
            Value::Number(_) => ty = ColumnType::Real,
            _ => return ColumnType::Text,
        }
        any = true;
    }
    if any {
        ty
    } else {
        ColumnType::Text
    }
}
