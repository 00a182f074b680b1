//! Hybrid engine handle
//!
//! `HybridDb` owns the model schema, the key-value repository and the
//! relational adapter. Queries, relations and persistence for both backends
//! go through it. Cloning is cheap and every clone shares the same stores.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adapter::{DatabaseAdapter, Row, SqlQuery, SqliteAdapter};
use super::config::HybridConfig;
use super::error::{HybridError, Result};
use super::kv::{ConditionSession, KeyValueStore, MemoryStore, Repository};
use super::model::{Model, ModelDef, RelationValue, Schema, StorageBackend};
use super::query::{KvQuery, ModelQuery, SqlModelQuery};
use super::relations::{PendingThrough, Relation};

struct Inner {
    schema: Schema,
    repository: Repository,
    sql: Arc<dyn DatabaseAdapter>,
    config: HybridConfig,
}

#[derive(Clone)]
pub struct HybridDb {
    inner: Arc<Inner>,
}

impl HybridDb {
    /// Wire a schema to existing stores. Fails on malformed relation declarations.
    pub fn new(
        schema: Schema,
        kv: Arc<dyn KeyValueStore>,
        sql: Arc<dyn DatabaseAdapter>,
        config: HybridConfig,
    ) -> Result<Self> {
        config.validate()?;
        schema.validate()?;
        let repository = Repository::new(kv, config.key_value.count_batch_size);
        Ok(Self {
            inner: Arc::new(Inner {
                schema,
                repository,
                sql,
                config,
            }),
        })
    }

    /// SQLite from `config.relational` with an in-process key-value store
    pub fn open(config: HybridConfig, schema: Schema) -> Result<Self> {
        config.validate()?;
        let sql = SqliteAdapter::from_config(&config.relational)?;
        info!(
            database = %sql.path().display(),
            models = schema.models().count(),
            "hybrid engine opened"
        );
        Self::new(schema, Arc::new(MemoryStore::new()), Arc::new(sql), config)
    }

    pub fn in_memory(schema: Schema) -> Result<Self> {
        Self::open(HybridConfig::default(), schema)
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &HybridConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &Repository {
        &self.inner.repository
    }

    pub fn sql(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.inner.sql
    }

    pub fn definition(&self, model: &str) -> Result<Arc<ModelDef>> {
        self.inner.schema.get(model)
    }

    /// Raw query builder over a relational table
    pub fn table(&self, table: &str) -> SqlQuery {
        SqlQuery::table(self.inner.sql.clone(), table)
    }

    pub fn query(&self, model: &str) -> Result<ModelQuery> {
        Ok(self.query_def(self.definition(model)?))
    }

    pub fn query_def(&self, def: Arc<ModelDef>) -> ModelQuery {
        match def.backend() {
            StorageBackend::KeyValue => ModelQuery::KeyValue(KvQuery::new(self.clone(), def)),
            StorageBackend::Relational => ModelQuery::Relational(SqlModelQuery::new(self.clone(), def)),
        }
    }

    /// Chunk every record of `model` using the configured scan batch size
    pub fn each<F>(&self, model: &str, callback: F) -> Result<()>
    where
        F: FnMut(Vec<Model>) -> Result<()>,
    {
        self.query(model)?
            .chunk(self.inner.config.key_value.scan_batch_size, callback)
    }

    /// Resolve a relation declared on `model`
    pub fn relation(&self, model: &str, relation: &str) -> Result<Relation> {
        Relation::resolve(self, &self.definition(model)?, relation)
    }

    /// Start a fluent through-chain from a relation declared on `model`
    pub fn through(&self, model: &str, relation: &str) -> Result<PendingThrough> {
        PendingThrough::new(self, self.definition(model)?, relation)
    }

    /// Lazily load `relation` onto `model`, replacing any cached value
    pub fn load<'a>(&self, model: &'a mut Model, relation: &str) -> Result<&'a RelationValue> {
        let resolved = Relation::resolve(self, model.definition(), relation)?;
        let value = resolved.get_results(model)?;
        Ok(model.set_relation(relation, value))
    }

    /// Build and persist a new `model` record
    pub fn create(&self, model: &str, attributes: Map<String, Value>) -> Result<Model> {
        self.query(model)?.create(attributes)
    }

    pub fn save(&self, model: &mut Model) -> Result<()> {
        match model.backend() {
            StorageBackend::KeyValue => self.save_key_value(model),
            StorageBackend::Relational => self.save_relational(model),
        }
    }

    fn save_key_value(&self, model: &mut Model) -> Result<()> {
        let def = model.definition().clone();
        let primary_key = def.key_name().to_string();
        if model.id().is_none() {
            model.set(&primary_key, Uuid::new_v4().to_string());
        }

        let record = def.to_record(model.attributes());
        for attribute in def.sub_key_names() {
            if !record.contains_key(attribute) {
                return Err(HybridError::MissingAttribute {
                    model: def.name().to_string(),
                    attribute: attribute.clone(),
                });
            }
        }

        let scheme = def.key_scheme();
        let key = scheme.physical_key(&record);

        if !model.exists() {
            let mut by_id = ConditionSession::new();
            if let Some(id) = record.get(&primary_key) {
                by_id.insert(primary_key.clone(), id.clone());
            }
            if !self.repository().get_by_pattern(&scheme.compile(&by_id))?.is_empty() {
                return Err(HybridError::DuplicateKey(key));
            }
        } else if let Some(previous) = model.key().filter(|previous| *previous != key) {
            warn!(
                model = %def.name(),
                previous = %previous,
                current = %key,
                "key attributes changed; the record is written under the new key and the old key is left in place"
            );
        }

        self.repository().save(&key, &record)?;
        debug!(model = %def.name(), key = %key, "saved");
        model.mark_persisted(Some(key));
        Ok(())
    }

    fn save_relational(&self, model: &mut Model) -> Result<()> {
        let def = model.definition().clone();
        let primary_key = def.key_name().to_string();

        if model.exists() {
            let id = model.get(&primary_key).cloned().ok_or_else(|| HybridError::MissingAttribute {
                model: def.name().to_string(),
                attribute: primary_key.clone(),
            })?;
            let values: Row = model
                .attributes()
                .iter()
                .filter(|(column, _)| **column != primary_key)
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            self.table(def.table()).where_eq(&primary_key, id).update(&values)?;
        } else {
            let ids = self.table(def.table()).insert(&[model.attributes().clone()])?;
            if model.id().is_none() {
                if let Some(id) = ids.first() {
                    model.set(&primary_key, *id);
                }
            }
        }

        debug!(model = %def.name(), id = ?model.id(), "saved");
        model.mark_persisted(None);
        Ok(())
    }

    /// Remove a persisted record; whether anything was deleted
    pub fn delete(&self, model: &mut Model) -> Result<bool> {
        let def = model.definition().clone();
        let removed = match def.backend() {
            StorageBackend::KeyValue => {
                let key = match model.key() {
                    Some(key) => key.to_string(),
                    None => def.key_scheme().physical_key(&def.to_record(model.attributes())),
                };
                self.repository().destroy_by_keys(&[key])?
            }
            StorageBackend::Relational => match model.get(def.key_name()).cloned() {
                Some(id) if !id.is_null() => self.table(def.table()).where_eq(def.key_name(), id).delete()? > 0,
                _ => false,
            },
        };

        if removed {
            model.mark_deleted();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::CastKind;
    use crate::engine::query::RelationQueryable;
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn db() -> HybridDb {
        let schema = Schema::new()
            .register(ModelDef::relational("project", "projects"))
            .register(
                ModelDef::key_value("environment", "environments")
                    .sub_keys(["project_id"])
                    .cast("id", CastKind::Integer)
                    .cast("project_id", CastKind::Integer),
            );
        let db = HybridDb::in_memory(schema).unwrap();
        db.sql()
            .execute_batch("CREATE TABLE projects (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        db
    }

    #[test]
    fn test_relational_create_assigns_id() {
        let db = db();
        let project = db.create("project", attrs(json!({"name": "alpha"}))).unwrap();
        assert!(project.exists());
        assert_eq!(project.id(), Some("1".to_string()));
        assert_eq!(db.query("project").unwrap().count().unwrap(), 1);
    }

    #[test]
    fn test_relational_update_and_delete() {
        let db = db();
        let mut project = db.create("project", attrs(json!({"name": "alpha"}))).unwrap();
        project.set("name", "beta");
        db.save(&mut project).unwrap();

        let found = db.query("project").unwrap().find(1).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!("beta")));

        assert!(db.delete(&mut project).unwrap());
        assert!(!project.exists());
        assert!(!db.delete(&mut project).unwrap());
    }

    #[test]
    fn test_key_value_save_builds_physical_key() {
        let db = db();
        let env = db
            .create("environment", attrs(json!({"id": 3, "project_id": 1, "name": "prod"})))
            .unwrap();
        assert_eq!(env.key(), Some("environments:id:3:project_id:1"));
        assert_eq!(db.repository().count_by_pattern("environments:*").unwrap(), 1);
    }

    #[test]
    fn test_key_value_generates_missing_id() {
        let db = db();
        let env = db
            .create("environment", attrs(json!({"project_id": 1})))
            .unwrap();
        let id = env.get("id").and_then(Value::as_str).unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_key_value_duplicate_id_rejected() {
        let db = db();
        db.create("environment", attrs(json!({"id": 3, "project_id": 1})))
            .unwrap();
        let err = db
            .create("environment", attrs(json!({"id": 3, "project_id": 2})))
            .unwrap_err();
        assert!(matches!(err, HybridError::DuplicateKey(_)));
    }

    #[test]
    fn test_key_value_missing_sub_key_rejected() {
        let db = db();
        let err = db.create("environment", attrs(json!({"id": 3}))).unwrap_err();
        assert!(matches!(err, HybridError::MissingAttribute { .. }));
    }

    #[test]
    fn test_rekey_leaves_previous_key() {
        let db = db();
        let mut env = db
            .create("environment", attrs(json!({"id": 3, "project_id": 1})))
            .unwrap();
        env.set("project_id", 2);
        db.save(&mut env).unwrap();

        assert_eq!(env.key(), Some("environments:id:3:project_id:2"));
        let keys = db.repository().get_by_pattern("environments:*").unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_unknown_model() {
        let db = db();
        assert!(matches!(db.query("nope"), Err(HybridError::UnknownModel(_))));
    }
}
