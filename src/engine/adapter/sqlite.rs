//! SQLite Adapter
//!
//! Implements DatabaseAdapter for SQLite using rusqlite + r2d2 connection pooling.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSql, ValueRef};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{AdapterError, AdapterResult, DatabaseAdapter, ExecResult, QueryResult, Row, SqlValue};
use crate::engine::config::RelationalConfig;

type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;

pub struct SqliteAdapter {
    pool: DbPool,
    db_path: PathBuf,
}

impl SqliteAdapter {
    pub fn new(db_path: &Path, pool_size: u32) -> AdapterResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        let adapter = Self {
            pool,
            db_path: db_path.to_path_buf(),
        };
        adapter.init_pragmas(true)?;
        Ok(adapter)
    }

    /// Every in-memory connection is its own database, so the pool holds one.
    pub fn in_memory() -> AdapterResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        let adapter = Self {
            pool,
            db_path: PathBuf::from(":memory:"),
        };
        adapter.init_pragmas(false)?;
        Ok(adapter)
    }

    pub fn from_config(config: &RelationalConfig) -> AdapterResult<Self> {
        match &config.path {
            Some(path) => Self::new(path, config.pool_size),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init_pragmas(&self, wal: bool) -> AdapterResult<()> {
        let conn = self.get_conn()?;

        if wal {
            let _: String = conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                .map_err(|e| AdapterError::Schema(e.to_string()))?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON")
            .map_err(|e| AdapterError::Schema(e.to_string()))?;

        Ok(())
    }

    fn get_conn(&self) -> AdapterResult<DbConn> {
        self.pool
            .get()
            .map_err(|e| AdapterError::Connection(e.to_string()))
    }

    /// Convert a rusqlite ValueRef to serde_json Value
    fn value_ref_to_json(val: ValueRef<'_>) -> Value {
        match val {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => json!(i),
            ValueRef::Real(f) => json!(f),
            ValueRef::Text(t) => json!(String::from_utf8_lossy(t).to_string()),
            ValueRef::Blob(b) => json!(format!("BLOB({} bytes)", b.len())),
        }
    }

    fn boxed_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql>> {
        params
            .iter()
            .map(|p| -> Box<dyn ToSql> {
                match p {
                    SqlValue::Null => Box::new(rusqlite::types::Null),
                    SqlValue::Integer(i) => Box::new(*i),
                    SqlValue::Real(f) => Box::new(*f),
                    SqlValue::Text(s) => Box::new(s.clone()),
                    SqlValue::Bool(b) => Box::new(*b as i64),
                    SqlValue::Blob(b) => Box::new(b.clone()),
                }
            })
            .collect()
    }

    fn insert_sql(table: &str, row: &Row) -> (String, Vec<SqlValue>) {
        let col_names: Vec<String> = row.keys().map(|c| format!("\"{}\"", c)).collect();
        let placeholders: Vec<String> = (1..=col_names.len()).map(|i| format!("?{}", i)).collect();

        let sql = if col_names.is_empty() {
            format!("INSERT INTO \"{}\" DEFAULT VALUES", table)
        } else {
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                table,
                col_names.join(", "),
                placeholders.join(", ")
            )
        };
        let values = row.values().map(SqlValue::from).collect();
        (sql, values)
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<QueryResult> {
        let conn = self.get_conn()?;
        let start = Instant::now();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let param_values = Self::boxed_params(params);
        let param_refs: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                let mut vals = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    vals.push(Self::value_ref_to_json(row.get_ref(i)?));
                }
                Ok(vals)
            })
            .map_err(|e| AdapterError::Query(e.to_string()))?
            .collect::<Result<Vec<Vec<Value>>, _>>()
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        Ok(QueryResult {
            columns,
            rows,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<ExecResult> {
        let conn = self.get_conn()?;
        let start = Instant::now();

        let param_values = Self::boxed_params(params);
        let param_refs: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();

        let affected = conn
            .execute(sql, param_refs.as_slice())
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let last_id = conn.last_insert_rowid();

        Ok(ExecResult {
            affected_rows: affected as u64,
            last_insert_id: Some(last_id),
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn execute_batch(&self, sql: &str) -> AdapterResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(sql)
            .map_err(|e| AdapterError::Query(e.to_string()))
    }

    fn insert_rows(&self, table: &str, rows: &[Row]) -> AdapterResult<Vec<i64>> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let (sql, params) = Self::insert_sql(table, row);
            let param_values = Self::boxed_params(&params);
            let param_refs: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
            tx.execute(&sql, param_refs.as_slice())
                .map_err(|e| AdapterError::Query(e.to_string()))?;
            ids.push(tx.last_insert_rowid());
        }

        tx.commit()
            .map_err(|e| AdapterError::Query(e.to_string()))?;
        Ok(ids)
    }

    fn test_connection(&self) -> AdapterResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch("SELECT 1")
            .map_err(|e| AdapterError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn users_adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter
            .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        adapter
    }

    #[test]
    fn test_insert_rows_returns_ids_in_order() {
        let adapter = users_adapter();
        let rows: Vec<Row> = ["ada", "grace"]
            .iter()
            .map(|name| {
                let mut row = Row::new();
                row.insert("name".into(), json!(name));
                row
            })
            .collect();

        let ids = adapter.insert_rows("users", &rows).unwrap();
        assert_eq!(ids, vec![1, 2]);

        let result = adapter
            .query("SELECT name FROM users WHERE id = ?1", &[SqlValue::Integer(2)])
            .unwrap();
        assert_eq!(result.rows, vec![vec![json!("grace")]]);
    }

    #[test]
    fn test_failed_insert_rolls_back_batch() {
        let adapter = users_adapter();
        let mut good = Row::new();
        good.insert("name".into(), json!("ada"));
        let mut bad = Row::new();
        bad.insert("missing_column".into(), json!(1));

        assert!(adapter.insert_rows("users", &[good, bad]).is_err());
        let result = adapter.query("SELECT COUNT(*) FROM users", &[]).unwrap();
        assert_eq!(result.rows[0][0], json!(0));
    }

    #[test]
    fn test_file_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let adapter = SqliteAdapter::new(&path, 2).unwrap();
        adapter.test_connection().unwrap();
        assert!(path.exists());
        assert_eq!(adapter.path(), path.as_path());
    }
}
