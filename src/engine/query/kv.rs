//! Key-value query builder
//!
//! Conditions on key-scheme attributes are compiled into the scan pattern.
//! Conditions on any other attribute are equality filters checked after the
//! records are fetched. `where_in` has no native form, so it fans out into
//! one sub-query per value (per combination when several are pending).

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::RelationQueryable;
use crate::engine::error::{HybridError, Result};
use crate::engine::hybrid::HybridDb;
use crate::engine::kv::{ConditionSession, KeyScheme, Record};
use crate::engine::model::{Model, ModelDef};
use crate::engine::relations;

#[derive(Debug, Clone)]
struct WhereIn {
    attribute: String,
    values: Vec<String>,
}

#[derive(Clone)]
pub struct KvQuery {
    db: HybridDb,
    model: Arc<ModelDef>,
    scheme: KeyScheme,
    conditions: ConditionSession,
    filters: BTreeMap<String, String>,
    where_ins: Vec<WhereIn>,
    eager: Vec<String>,
    pattern: String,
}

impl KvQuery {
    pub(crate) fn new(db: HybridDb, model: Arc<ModelDef>) -> Self {
        let scheme = model.key_scheme();
        let conditions = ConditionSession::new();
        let pattern = scheme.compile(&conditions);
        Self {
            db,
            model,
            scheme,
            conditions,
            filters: BTreeMap::new(),
            where_ins: Vec::new(),
            eager: Vec::new(),
            pattern,
        }
    }

    /// A fresh builder bound to the same model
    pub fn new_query(&self) -> Self {
        Self::new(self.db.clone(), self.model.clone())
    }

    /// The compiled scan pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn conditions(&self) -> &ConditionSession {
        &self.conditions
    }

    /// Bind an already-cast value
    fn bind(mut self, attribute: &str, stored: String) -> Self {
        if self.scheme.contains(attribute) {
            self.conditions.insert(attribute.to_string(), stored);
            self.pattern = self.scheme.compile(&self.conditions);
        } else {
            self.filters.insert(attribute.to_string(), stored);
        }
        self
    }

    fn passes_filters(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .all(|(attribute, expected)| record.get(attribute) == Some(expected))
    }

    fn hydrate(&self, fetched: Vec<(String, Record)>) -> Vec<Model> {
        fetched
            .into_iter()
            .filter(|(_, record)| self.passes_filters(record))
            .map(|(key, record)| Model::hydrate(self.model.clone(), self.model.from_record(&record), Some(key)))
            .collect()
    }

    /// Every sub-query a pending `where_in` expands to, in value order
    fn branches(&self) -> Vec<KvQuery> {
        let mut base = self.clone();
        base.where_ins.clear();

        let mut branches = vec![base];
        for condition in &self.where_ins {
            let mut next = Vec::with_capacity(branches.len() * condition.values.len());
            for branch in &branches {
                for value in &condition.values {
                    next.push(branch.clone().bind(&condition.attribute, value.clone()));
                }
            }
            branches = next;
        }
        branches
    }

    fn get_models(&self) -> Result<Vec<Model>> {
        let fetched = self.db.repository().fetch_by_pattern(&self.pattern)?;
        Ok(self.hydrate(fetched))
    }

    fn matching_keys(&self) -> Result<Vec<String>> {
        let keys = self.db.repository().get_by_pattern(&self.pattern)?;
        if self.filters.is_empty() {
            return Ok(keys);
        }
        Ok(self
            .db
            .repository()
            .fetch_by_keys(&keys)?
            .into_iter()
            .filter(|(_, record)| self.passes_filters(record))
            .map(|(key, _)| key)
            .collect())
    }

    fn count_single(&self) -> Result<u64> {
        if self.filters.is_empty() {
            self.db.repository().count_by_pattern(&self.pattern)
        } else {
            Ok(self.get_models()?.len() as u64)
        }
    }

    fn load_relations(&self, models: &mut [Model]) -> Result<()> {
        if self.eager.is_empty() {
            return Ok(());
        }
        relations::eager_load(&self.db, &self.model, models, &self.eager)
    }

    /// Scan in batches of about `size` keys, hydrating and eager-loading each batch
    pub fn chunk<F>(self, size: usize, mut callback: F) -> Result<()>
    where
        F: FnMut(Vec<Model>) -> Result<()>,
    {
        if size < 1 {
            return Err(HybridError::InvalidBatchSize);
        }
        relations::resolve_all(&self.db, &self.model, &self.eager)?;

        for branch in self.branches() {
            let repository = branch.db.repository();
            repository.scan_by_pattern(&branch.pattern, size, |keys| {
                let mut models = branch.hydrate(repository.fetch_by_keys(&keys)?);
                if models.is_empty() {
                    return Ok(());
                }
                branch.load_relations(&mut models)?;
                callback(models)
            })?;
        }
        Ok(())
    }

    /// Delete every matching record; whether any key was removed
    pub fn destroy(self) -> Result<bool> {
        let mut removed = false;
        for branch in self.branches() {
            let keys = branch.matching_keys()?;
            debug!(pattern = %branch.pattern, keys = keys.len(), "destroy");
            removed |= self.db.repository().destroy_by_keys(&keys)?;
        }
        Ok(removed)
    }

    /// Whether any key matches a pattern compiled from only `attributes`
    pub fn is_exists(&self, attributes: &Map<String, Value>) -> Result<bool> {
        let mut conditions = ConditionSession::new();
        for (attribute, value) in attributes {
            if !self.scheme.contains(attribute) {
                continue;
            }
            if let Some(stored) = self.model.cast_for_store(attribute, value) {
                conditions.insert(attribute.clone(), stored);
            }
        }
        let pattern = self.scheme.compile(&conditions);
        Ok(!self.db.repository().get_by_pattern(&pattern)?.is_empty())
    }

    /// Persist a new record. The primary key is generated when absent.
    pub fn create(&self, attributes: Map<String, Value>) -> Result<Model> {
        let mut model = Model::new_instance(self.model.clone(), attributes);
        self.db.save(&mut model)?;
        Ok(model)
    }

    /// First record matching `attributes`, or a new one built from
    /// `attributes` merged with `values`
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

impl RelationQueryable for KvQuery {
    fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    /// Null values are ignored
    fn where_eq(self, attribute: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.model.cast_for_store(attribute, &value) {
            Some(stored) => self.bind(attribute, stored),
            None => self,
        }
    }

    fn where_in(mut self, attribute: &str, values: Vec<Value>) -> Self {
        let values = values
            .iter()
            .filter_map(|value| self.model.cast_for_store(attribute, value))
            .collect();
        self.where_ins.push(WhereIn {
            attribute: attribute.to_string(),
            values,
        });
        self
    }

    fn with(mut self, relation: &str) -> Self {
        if !self.eager.iter().any(|r| r == relation) {
            self.eager.push(relation.to_string());
        }
        self
    }

    fn get(self) -> Result<Vec<Model>> {
        let mut models = if self.where_ins.is_empty() {
            self.get_models()?
        } else {
            let branches = self.branches();
            debug!(pattern = %self.pattern, branches = branches.len(), "where_in fan-out");
            let mut models = Vec::new();
            for branch in &branches {
                models.extend(branch.get_models()?);
            }
            models
        };

        self.load_relations(&mut models)?;
        Ok(models)
    }

    fn first(self) -> Result<Option<Model>> {
        Ok(self.get()?.into_iter().next())
    }

    fn count(self) -> Result<u64> {
        let mut total = 0;
        for branch in self.branches() {
            total += branch.count_single()?;
        }
        Ok(total)
    }
}
