//! Many-to-many relation through a pivot table
//!
//! The pivot always lives in the relational store, whatever backend the two
//! endpoints use. Relational-to-relational pairs join the pivot in one
//! query; every other pairing reads pivot rows first and resolves each
//! related id through the related model's own store.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{distinct_keys, Pairing, RelationContext};
use crate::engine::adapter::{Row, SqlQuery};
use crate::engine::error::{HybridError, Result};
use crate::engine::model::{value_to_key, Model, ModelDef, RelationValue};

/// Alias prefix for pivot columns in joined selects
const PIVOT_PREFIX: &str = "__pivot_";

/// Label given to pivot models when `using` is not set
const DEFAULT_PIVOT_MODEL: &str = "pivot";

#[derive(Debug, Clone, PartialEq)]
pub struct PivotKeys {
    pub table: String,
    /// Pivot column holding the declaring model's key
    pub foreign_pivot_key: String,
    /// Pivot column holding the related model's key
    pub related_pivot_key: String,
    /// Declaring model attribute stored in `foreign_pivot_key`
    pub parent_key: String,
    /// Related model attribute stored in `related_pivot_key`
    pub related_key: String,
}

#[derive(Clone)]
pub struct BelongsToMany {
    ctx: RelationContext,
    keys: PivotKeys,
    accessor: String,
    pivot_def: Arc<ModelDef>,
    pivot_columns: Vec<String>,
    timestamps: Option<(String, String)>,
}

impl BelongsToMany {
    pub(crate) fn new(ctx: RelationContext, keys: PivotKeys, accessor: String) -> Self {
        let pivot_def = Arc::new(ModelDef::relational(DEFAULT_PIVOT_MODEL, &keys.table));
        Self {
            ctx,
            keys,
            accessor,
            pivot_def,
            pivot_columns: Vec::new(),
            timestamps: None,
        }
    }

    pub(crate) fn context(&self) -> &RelationContext {
        &self.ctx
    }

    pub fn keys(&self) -> &PivotKeys {
        &self.keys
    }

    pub fn accessor(&self) -> &str {
        &self.accessor
    }

    /// Expose the pivot under a different attribute name
    pub fn as_accessor(mut self, accessor: &str) -> Self {
        self.accessor = accessor.to_string();
        self
    }

    /// Name the pivot model type
    pub fn using(mut self, pivot_model: &str) -> Self {
        self.pivot_def = Arc::new(ModelDef::relational(pivot_model, &self.keys.table));
        self
    }

    pub fn with_pivot<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.pivot_columns.contains(&column) {
                self.pivot_columns.push(column);
            }
        }
        self
    }

    pub fn with_timestamps(mut self, created_at: &str, updated_at: &str) -> Self {
        self.timestamps = Some((created_at.to_string(), updated_at.to_string()));
        self
    }

    /// Every pivot column read back onto the pivot model
    fn pivot_select(&self) -> Vec<String> {
        let mut columns = vec![self.keys.foreign_pivot_key.clone(), self.keys.related_pivot_key.clone()];
        columns.extend(self.pivot_columns.iter().cloned());
        if let Some((created_at, updated_at)) = &self.timestamps {
            columns.push(created_at.clone());
            columns.push(updated_at.clone());
        }
        let mut seen = HashSet::new();
        columns.retain(|column| seen.insert(column.clone()));
        columns
    }

    fn pivot_query(&self) -> SqlQuery {
        self.ctx.db.table(&self.keys.table).select(self.pivot_select())
    }

    fn pivot_model(&self, row: Row) -> Model {
        Model::hydrate(self.pivot_def.clone(), row, None)
    }

    fn with_pivot_relation(&self, mut model: Model, pivot: Model) -> Model {
        model.set_relation(&self.accessor, RelationValue::One(Some(Box::new(pivot))));
        model
    }

    /// Relational related side: join the pivot and split the aliased columns
    fn joined(&self, owner_keys: &[String]) -> Result<Vec<Model>> {
        let related_table = self.ctx.related.table();
        let aliases: HashMap<String, String> = self
            .pivot_select()
            .into_iter()
            .map(|column| (format!("{}{}", PIVOT_PREFIX, column), column))
            .collect();
        let mut columns = vec![format!("{}.*", related_table)];
        for (alias, column) in &aliases {
            columns.push(format!("{}.{} as {}", self.keys.table, column, alias));
        }

        let rows = self
            .ctx
            .db
            .table(related_table)
            .select(columns)
            .join(
                &self.keys.table,
                &format!("{}.{}", related_table, self.keys.related_key),
                &format!("{}.{}", self.keys.table, self.keys.related_pivot_key),
            )
            .where_in(
                &format!("{}.{}", self.keys.table, self.keys.foreign_pivot_key),
                owner_keys.iter().cloned().map(Value::String).collect(),
            )
            .get()?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let (pivot, attributes): (Row, Row) =
                    row.into_iter().partition(|(column, _)| aliases.contains_key(column));
                let pivot: Row = pivot
                    .into_iter()
                    .filter_map(|(alias, value)| aliases.get(&alias).map(|column| (column.clone(), value)))
                    .collect();
                let model = Model::hydrate(self.ctx.related.clone(), attributes, None);
                self.with_pivot_relation(model, self.pivot_model(pivot))
            })
            .collect())
    }

    /// Other pairings: one related lookup per distinct related id
    fn resolve_pivot_rows(&self, rows: Vec<Row>) -> Result<Vec<Model>> {
        let mut resolved: HashMap<String, Option<Model>> = HashMap::new();
        let mut results = Vec::with_capacity(rows.len());

        for row in rows {
            let Some(related_id) = row.get(&self.keys.related_pivot_key).and_then(value_to_key) else {
                continue;
            };
            let related = match resolved.get(&related_id) {
                Some(hit) => hit.clone(),
                None => {
                    let found = self.ctx.lookup_first(&self.keys.related_key, &related_id)?;
                    resolved.insert(related_id, found.clone());
                    found
                }
            };
            if let Some(model) = related {
                results.push(self.with_pivot_relation(model, self.pivot_model(row)));
            }
        }
        Ok(results)
    }

    fn fetch(&self, owner_keys: Vec<String>) -> Result<Vec<Model>> {
        if owner_keys.is_empty() {
            return Ok(Vec::new());
        }

        match self.ctx.pairing() {
            Pairing::RelationalToRelational => self.joined(&owner_keys),
            Pairing::RelationalToKeyValue | Pairing::KeyValueToRelational | Pairing::KeyValueToKeyValue => {
                let rows = self
                    .pivot_query()
                    .where_in(
                        &self.keys.foreign_pivot_key,
                        owner_keys.into_iter().map(Value::String).collect(),
                    )
                    .get()?;
                debug!(relation = %self.ctx.name, pivots = rows.len(), "pivot rows");
                self.resolve_pivot_rows(rows)
            }
        }
    }

    pub fn get(&self, owner: &Model) -> Result<Vec<Model>> {
        self.fetch(owner.key_string(&self.keys.parent_key).into_iter().collect())
    }

    pub fn get_eager(&self, owners: &[Model]) -> Result<Vec<Model>> {
        self.fetch(distinct_keys(owners, |owner| owner.key_string(&self.keys.parent_key)))
    }

    pub fn owner_match_key(&self, owner: &Model) -> Option<String> {
        owner.key_string(&self.keys.parent_key)
    }

    pub fn result_match_key(&self, result: &Model) -> Option<String> {
        result
            .related_one(&self.accessor)
            .and_then(|pivot| pivot.key_string(&self.keys.foreign_pivot_key))
    }

    /// Insert one pivot row per id
    pub fn attach(&self, owner: &Model, ids: &[Value], extra: &Map<String, Value>) -> Result<()> {
        let parent_id = owner
            .get(&self.keys.parent_key)
            .filter(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| HybridError::MissingAttribute {
                model: owner.name().to_string(),
                attribute: self.keys.parent_key.clone(),
            })?;
        if ids.is_empty() {
            return Ok(());
        }

        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let rows: Vec<Row> = ids
            .iter()
            .map(|id| {
                let mut row = Row::new();
                row.insert(self.keys.foreign_pivot_key.clone(), parent_id.clone());
                row.insert(self.keys.related_pivot_key.clone(), id.clone());
                for (column, value) in extra {
                    row.insert(column.clone(), value.clone());
                }
                if let Some((created_at, updated_at)) = &self.timestamps {
                    row.insert(created_at.clone(), Value::String(now.clone()));
                    row.insert(updated_at.clone(), Value::String(now.clone()));
                }
                row
            })
            .collect();

        debug!(relation = %self.ctx.name, table = %self.keys.table, rows = rows.len(), "attach");
        self.ctx.db.table(&self.keys.table).insert(&rows)?;
        Ok(())
    }

    /// Attach by related models, reading their related key
    pub fn attach_models(&self, owner: &Model, related: &[Model], extra: &Map<String, Value>) -> Result<()> {
        let ids: Vec<Value> = related
            .iter()
            .filter_map(|model| model.get(&self.keys.related_key).cloned())
            .filter(|value| !value.is_null())
            .collect();
        self.attach(owner, &ids, extra)
    }

    /// Pivot rows for `owner`, without resolving the related side
    pub fn pivot_rows(&self, owner: &Model) -> Result<Vec<Model>> {
        let Some(key) = owner.key_string(&self.keys.parent_key) else {
            return Ok(Vec::new());
        };
        let rows = self.pivot_query().where_eq(&self.keys.foreign_pivot_key, key).get()?;
        Ok(rows.into_iter().map(|row| self.pivot_model(row)).collect())
    }
}
