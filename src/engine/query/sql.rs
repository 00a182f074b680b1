//! Relational query builder
//!
//! Thin model layer over `SqlQuery`: rows come back hydrated as `Model`s
//! and requested relations are eager-loaded after the select.

use serde_json::{Map, Value};
use std::sync::Arc;

use super::RelationQueryable;
use crate::engine::adapter::SqlQuery;
use crate::engine::error::{HybridError, Result};
use crate::engine::hybrid::HybridDb;
use crate::engine::model::{Model, ModelDef};
use crate::engine::relations;

#[derive(Clone)]
pub struct SqlModelQuery {
    db: HybridDb,
    model: Arc<ModelDef>,
    query: SqlQuery,
    eager: Vec<String>,
}

impl SqlModelQuery {
    pub(crate) fn new(db: HybridDb, model: Arc<ModelDef>) -> Self {
        let query = db.table(model.table());
        Self {
            db,
            model,
            query,
            eager: Vec::new(),
        }
    }

    pub fn new_query(&self) -> Self {
        Self::new(self.db.clone(), self.model.clone())
    }

    /// The underlying table query
    pub fn to_sql(&self) -> &SqlQuery {
        &self.query
    }

    fn hydrate(&self, rows: Vec<Map<String, Value>>) -> Vec<Model> {
        rows.into_iter()
            .map(|row| Model::hydrate(self.model.clone(), row, None))
            .collect()
    }

    fn load_relations(&self, models: &mut [Model]) -> Result<()> {
        if self.eager.is_empty() {
            return Ok(());
        }
        relations::eager_load(&self.db, &self.model, models, &self.eager)
    }

    /// Page through the matching rows ordered by primary key
    pub fn chunk<F>(self, size: usize, mut callback: F) -> Result<()>
    where
        F: FnMut(Vec<Model>) -> Result<()>,
    {
        if size < 1 {
            return Err(HybridError::InvalidBatchSize);
        }
        relations::resolve_all(&self.db, &self.model, &self.eager)?;

        let ordered = self.query.clone().order_by(self.model.key_name());
        let mut offset = 0;
        loop {
            let rows = ordered.clone().limit(size).offset(offset).get()?;
            let fetched = rows.len();
            if fetched == 0 {
                break;
            }

            let mut models = self.hydrate(rows);
            self.load_relations(&mut models)?;
            callback(models)?;

            if fetched < size {
                break;
            }
            offset += fetched;
        }
        Ok(())
    }

    pub fn destroy(self) -> Result<bool> {
        Ok(self.query.delete()? > 0)
    }

    pub fn is_exists(&self, attributes: &Map<String, Value>) -> Result<bool> {
        let query = attributes
            .iter()
            .fold(self.new_query().query, |query, (column, value)| {
                query.where_eq(column, value.clone())
            });
        Ok(query.count()? > 0)
    }

    /// Insert a new row; the generated id is written back to the model
    pub fn create(&self, attributes: Map<String, Value>) -> Result<Model> {
        let mut model = Model::new_instance(self.model.clone(), attributes);
        self.db.save(&mut model)?;
        Ok(model)
    }

    pub fn first_or_create(self, attributes: Map<String, Value>, values: Map<String, Value>) -> Result<Model> {
        let creator = self.new_query();
        if let Some(found) = self.where_map(&attributes).first()? {
            return Ok(found);
        }
        let mut merged = attributes;
        merged.extend(values);
        creator.create(merged)
    }
}

impl RelationQueryable for SqlModelQuery {
    fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    fn where_eq(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.where_eq(attribute, value);
        self
    }

    fn where_in(mut self, attribute: &str, values: Vec<Value>) -> Self {
        self.query = self.query.where_in(attribute, values);
        self
    }

    fn with(mut self, relation: &str) -> Self {
        if !self.eager.iter().any(|r| r == relation) {
            self.eager.push(relation.to_string());
        }
        self
    }

    fn get(self) -> Result<Vec<Model>> {
        let rows = self.query.get()?;
        let mut models = self.hydrate(rows);
        self.load_relations(&mut models)?;
        Ok(models)
    }

    fn first(self) -> Result<Option<Model>> {
        let rows = self.query.clone().limit(1).get()?;
        let mut models = self.hydrate(rows);
        self.load_relations(&mut models)?;
        Ok(models.into_iter().next())
    }

    fn count(self) -> Result<u64> {
        Ok(self.query.count()?)
    }
}
