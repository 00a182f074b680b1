//! Relational Adapter Layer
//!
//! Trait-based abstraction over the relational store. Relations whose
//! owner or related side is relational, and every pivot table, go through
//! this layer. SQLite is the only backend.

pub mod query;
pub mod sqlite;

pub use query::SqlQuery;
pub use sqlite::SqliteAdapter;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Universal result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

/// A row keyed by column name
pub type Row = serde_json::Map<String, Value>;

/// Core database adapter trait
pub trait DatabaseAdapter: Send + Sync {
    /// Execute a query that returns rows (SELECT, PRAGMA, etc.)
    fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<QueryResult>;

    /// Execute a statement that modifies data (INSERT, UPDATE, DELETE, CREATE, etc.)
    fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<ExecResult>;

    /// Execute multiple statements as a batch
    fn execute_batch(&self, sql: &str) -> AdapterResult<()>;

    /// Insert all rows inside one transaction, returning the new row ids in order
    fn insert_rows(&self, table: &str, rows: &[Row]) -> AdapterResult<Vec<i64>>;

    /// Test the connection is alive
    fn test_connection(&self) -> AdapterResult<()>;
}

/// SQL value for parameterized queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

/// Result from a SELECT-type query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Zip each row with the column names
    pub fn into_rows(self) -> Vec<Row> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect()
    }
}

/// Result from an INSERT/UPDATE/DELETE-type statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub affected_rows: u64,
    pub last_insert_id: Option<i64>,
    pub execution_time_ms: u64,
}

/// Database adapter errors
#[derive(Debug)]
pub enum AdapterError {
    Connection(String),
    Query(String),
    Schema(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::Connection(e) => write!(f, "Connection error: {}", e),
            AdapterError::Query(e) => write!(f, "Query error: {}", e),
            AdapterError::Schema(e) => write!(f, "Schema error: {}", e),
        }
    }
}

impl std::error::Error for AdapterError {}
