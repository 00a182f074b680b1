//! Model queries
//!
//! `RelationQueryable` is the fluent surface shared by the key-value
//! builder (`KvQuery`) and the relational one (`SqlModelQuery`). Relations
//! only talk to this trait, and `ModelQuery` picks the implementation from
//! the model's storage backend.

pub mod kv;
pub mod sql;

pub use kv::KvQuery;
pub use sql::SqlModelQuery;

use serde_json::{Map, Value};
use std::sync::Arc;

use super::error::{HybridError, Result};
use super::model::{Model, ModelDef, StorageBackend};
use super::relations::RelationDecl;

pub trait RelationQueryable: Sized {
    fn model(&self) -> &Arc<ModelDef>;

    /// Equality condition; later calls on the same attribute replace earlier ones
    fn where_eq(self, attribute: &str, value: impl Into<Value>) -> Self;

    fn where_in(self, attribute: &str, values: Vec<Value>) -> Self;

    /// Eager-load a relation declared on the model
    fn with(self, relation: &str) -> Self;

    fn get(self) -> Result<Vec<Model>>;

    fn first(self) -> Result<Option<Model>>;

    fn count(self) -> Result<u64>;

    fn where_map(self, attributes: &Map<String, Value>) -> Self {
        attributes
            .iter()
            .fold(self, |query, (attribute, value)| query.where_eq(attribute, value.clone()))
    }

    fn where_key(self, id: impl Into<Value>) -> Self {
        let key = self.model().key_name().to_string();
        self.where_eq(&key, id)
    }

    fn find(self, id: impl Into<Value>) -> Result<Option<Model>> {
        self.where_key(id).first()
    }

    fn first_where(self, attribute: &str, value: impl Into<Value>) -> Result<Option<Model>> {
        self.where_eq(attribute, value).first()
    }

    fn with_all<I, S>(self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        relations
            .into_iter()
            .fold(self, |query, relation| query.with(relation.as_ref()))
    }
}

/// Constrain `query` to records belonging to any of `parents` through a
/// belongs-to relation. The relation defaults to the parents' model name.
pub fn where_belongs_to<Q: RelationQueryable>(query: Q, parents: &[Model], relation: Option<&str>) -> Result<Q> {
    let first = parents
        .first()
        .ok_or_else(|| HybridError::InvalidArgument("where_belongs_to needs at least one parent".into()))?;
    let related = first.definition();
    let name = relation.unwrap_or_else(|| related.name());

    let decl = match query.model().relation_decl(name) {
        Some(RelationDecl::BelongsTo(decl)) => decl,
        _ => return Err(HybridError::relation_not_found(query.model().name(), name)),
    };
    if decl.related() != related.name() {
        return Err(HybridError::InvalidArgument(format!(
            "relation '{}' belongs to '{}', not '{}'",
            name,
            decl.related(),
            related.name()
        )));
    }

    let (foreign_key, owner_key) = decl.keys(related);
    let mut values: Vec<Value> = parents
        .iter()
        .filter_map(|parent| parent.get(&owner_key).cloned())
        .filter(|value| !value.is_null())
        .collect();

    Ok(if values.len() == 1 {
        query.where_eq(&foreign_key, values.swap_remove(0))
    } else {
        query.where_in(&foreign_key, values)
    })
}

/// A query over either backend
#[derive(Clone)]
pub enum ModelQuery {
    KeyValue(KvQuery),
    Relational(SqlModelQuery),
}

macro_rules! delegate {
    ($self:ident, $q:ident => $e:expr) => {
        match $self {
            ModelQuery::KeyValue($q) => $e,
            ModelQuery::Relational($q) => $e,
        }
    };
}

macro_rules! delegate_wrap {
    ($self:ident, $q:ident => $e:expr) => {
        match $self {
            ModelQuery::KeyValue($q) => ModelQuery::KeyValue($e),
            ModelQuery::Relational($q) => ModelQuery::Relational($e),
        }
    };
}

impl ModelQuery {
    pub fn backend(&self) -> StorageBackend {
        match self {
            ModelQuery::KeyValue(_) => StorageBackend::KeyValue,
            ModelQuery::Relational(_) => StorageBackend::Relational,
        }
    }

    /// Call `callback` with batches of at most about `size` models
    pub fn chunk<F>(self, size: usize, callback: F) -> Result<()>
    where
        F: FnMut(Vec<Model>) -> Result<()>,
    {
        delegate!(self, q => q.chunk(size, callback))
    }

    /// Delete every matching record; whether anything was removed
    pub fn destroy(self) -> Result<bool> {
        delegate!(self, q => q.destroy())
    }

    pub fn is_exists(&self, attributes: &Map<String, Value>) -> Result<bool> {
        delegate!(self, q => q.is_exists(attributes))
    }

    pub fn create(&self, attributes: Map<String, Value>) -> Result<Model> {
        delegate!(self, q => q.create(attributes))
    }

    pub fn first_or_create(self, attributes: Map<String, Value>, values: Map<String, Value>) -> Result<Model> {
        delegate!(self, q => q.first_or_create(attributes, values))
    }

    /// A fresh query over the same model
    pub fn new_query(&self) -> Self {
        delegate_wrap!(self, q => q.new_query())
    }
}

impl RelationQueryable for ModelQuery {
    fn model(&self) -> &Arc<ModelDef> {
        delegate!(self, q => q.model())
    }

    fn where_eq(self, attribute: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        delegate_wrap!(self, q => q.where_eq(attribute, value))
    }

    fn where_in(self, attribute: &str, values: Vec<Value>) -> Self {
        delegate_wrap!(self, q => q.where_in(attribute, values))
    }

    fn with(self, relation: &str) -> Self {
        delegate_wrap!(self, q => q.with(relation))
    }

    fn get(self) -> Result<Vec<Model>> {
        delegate!(self, q => q.get())
    }

    fn first(self) -> Result<Option<Model>> {
        delegate!(self, q => q.first())
    }

    fn count(self) -> Result<u64> {
        delegate!(self, q => q.count())
    }
}
