#![allow(dead_code)]

use hybrid_model::engine::adapter::DatabaseAdapter;
use hybrid_model::{HybridDb, Model, Schema};
use serde_json::{Map, Value};
use std::error::Error;

pub type TestResult<T = ()> = Result<T, Box<dyn Error>>;

pub fn attrs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// In-memory engine with the given tables created
pub fn open(schema: Schema, ddl: &str) -> TestResult<HybridDb> {
    let db = HybridDb::in_memory(schema)?;
    db.sql().execute_batch(ddl)?;
    Ok(db)
}

pub fn create_all(db: &HybridDb, model: &str, rows: &[Value]) -> TestResult<Vec<Model>> {
    let mut created = Vec::with_capacity(rows.len());
    for row in rows {
        created.push(db.create(model, attrs(row.clone()))?);
    }
    Ok(created)
}

/// Primary keys of `models`, sorted
pub fn ids(models: &[Model]) -> Vec<String> {
    let mut ids: Vec<String> = models.iter().filter_map(Model::id).collect();
    ids.sort();
    ids
}

/// Everything held by both stores: (key-value keys, relational rows in `tables`)
pub fn store_footprint(db: &HybridDb, tables: &[&str]) -> TestResult<(u64, u64)> {
    let keys = db.repository().count_by_pattern("*")?;
    let mut rows = 0;
    for table in tables {
        rows += db.table(table).count()?;
    }
    Ok((keys, rows))
}
