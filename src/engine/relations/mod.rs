//! Hybrid Relations
//!
//! Relation resolution across relational and key-value models. Every kind
//! supports the same four steps:
//! - lazy lookup for one owner
//! - batched lookup for a set of owners
//! - a dictionary keyed by the stringified join value
//! - matching dictionary entries back onto the owners
//!
//! Which lookup strategy runs is decided by the `(owner, related)` backend
//! pairing, never by inspecting model instances.

pub mod belongs_to;
pub mod belongs_to_many;
pub mod decl;
pub mod default_model;
pub mod has_one_or_many;
pub mod through;

pub use belongs_to::BelongsTo;
pub use belongs_to_many::{BelongsToMany, PivotKeys};
pub use decl::{
    BelongsToDecl, FluentThroughDecl, HasDecl, PendingThroughDecl, PivotDecl, RelationDecl, ThroughDecl,
};
pub use default_model::DefaultModel;
pub use has_one_or_many::HasOneOrMany;
pub use through::{PendingThrough, ThroughChain};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::error::{HybridError, Result};
use super::hybrid::HybridDb;
use super::model::{Model, ModelDef, RelationValue, StorageBackend};
use super::query::{ModelQuery, RelationQueryable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    BelongsTo,
    ManyToManyPivot,
    OneThroughOne,
    ManyThroughMany,
}

impl RelationKind {
    /// Kinds that resolve to a single record
    pub fn is_one(&self) -> bool {
        matches!(
            self,
            RelationKind::OneToOne | RelationKind::BelongsTo | RelationKind::OneThroughOne
        )
    }
}

/// Which store each side of a relation lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pairing {
    RelationalToRelational,
    RelationalToKeyValue,
    KeyValueToRelational,
    KeyValueToKeyValue,
}

impl Pairing {
    pub fn of(owner: StorageBackend, related: StorageBackend) -> Self {
        match (owner, related) {
            (StorageBackend::Relational, StorageBackend::Relational) => Pairing::RelationalToRelational,
            (StorageBackend::Relational, StorageBackend::KeyValue) => Pairing::RelationalToKeyValue,
            (StorageBackend::KeyValue, StorageBackend::Relational) => Pairing::KeyValueToRelational,
            (StorageBackend::KeyValue, StorageBackend::KeyValue) => Pairing::KeyValueToKeyValue,
        }
    }

    /// Only relational-to-relational can push a single `IN` predicate
    pub fn batches_with_in(&self) -> bool {
        matches!(self, Pairing::RelationalToRelational)
    }
}

/// What a relation joins on. Built without touching either store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub kind: RelationKind,
    pub owner: String,
    pub related: String,
    pub pairing: Pairing,
    pub foreign_key: String,
    pub local_key: String,
    pub pivot_table: Option<String>,
    pub through: Option<String>,
    pub has_default: bool,
}

/// Results of one batched lookup keyed by the stringified join value
#[derive(Debug, Clone)]
pub enum Dictionary {
    One(HashMap<String, Model>),
    Many(HashMap<String, Vec<Model>>),
}

impl Dictionary {
    /// Key each result with `key_of`. One-to-one dictionaries keep the first hit.
    pub fn build<F>(one: bool, results: Vec<Model>, key_of: F) -> Self
    where
        F: Fn(&Model) -> Option<String>,
    {
        if one {
            let mut map = HashMap::new();
            for result in results {
                if let Some(key) = key_of(&result) {
                    map.entry(key).or_insert(result);
                }
            }
            Dictionary::One(map)
        } else {
            let mut map: HashMap<String, Vec<Model>> = HashMap::new();
            for result in results {
                if let Some(key) = key_of(&result) {
                    map.entry(key).or_default().push(result);
                }
            }
            Dictionary::Many(map)
        }
    }

    pub fn one(&self, key: &str) -> Option<&Model> {
        match self {
            Dictionary::One(map) => map.get(key),
            Dictionary::Many(map) => map.get(key).and_then(|models| models.first()),
        }
    }

    pub fn many(&self, key: &str) -> &[Model] {
        match self {
            Dictionary::One(map) => map.get(key).map(std::slice::from_ref).unwrap_or(&[]),
            Dictionary::Many(map) => map.get(key).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        match self {
            Dictionary::One(map) => map.len(),
            Dictionary::Many(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Distinct non-null values of `key_of` across `models`, first-seen order
pub(crate) fn distinct_keys<'a, I, F>(models: I, key_of: F) -> Vec<String>
where
    I: IntoIterator<Item = &'a Model>,
    F: Fn(&Model) -> Option<String>,
{
    let mut seen = HashSet::new();
    models
        .into_iter()
        .filter_map(key_of)
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// The two model types a relation connects and the engine handle it uses
#[derive(Clone)]
pub struct RelationContext {
    pub(crate) db: HybridDb,
    pub(crate) name: String,
    pub(crate) parent: Arc<ModelDef>,
    pub(crate) related: Arc<ModelDef>,
}

impl RelationContext {
    pub(crate) fn new(db: &HybridDb, name: &str, parent: Arc<ModelDef>, related: Arc<ModelDef>) -> Self {
        Self {
            db: db.clone(),
            name: name.to_string(),
            parent,
            related,
        }
    }

    pub fn pairing(&self) -> Pairing {
        Pairing::of(self.parent.backend(), self.related.backend())
    }

    pub(crate) fn related_query(&self) -> ModelQuery {
        self.db.query_def(self.related.clone())
    }

    pub(crate) fn lookup_first(&self, attribute: &str, key: &str) -> Result<Option<Model>> {
        self.related_query().where_eq(attribute, key).first()
    }

    pub(crate) fn lookup(&self, attribute: &str, key: &str) -> Result<Vec<Model>> {
        self.related_query().where_eq(attribute, key).get()
    }

    /// Batched lookup for eager loading, dispatched on the backend pairing
    pub(crate) fn lookup_eager(&self, attribute: &str, keys: &[String], first_per_key: bool) -> Result<Vec<Model>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        match self.pairing() {
            Pairing::RelationalToRelational => {
                debug!(relation = %self.name, attribute, keys = keys.len(), "eager lookup with IN");
                let values = keys.iter().cloned().map(Value::String).collect();
                self.related_query().where_in(attribute, values).get()
            }
            Pairing::RelationalToKeyValue | Pairing::KeyValueToRelational | Pairing::KeyValueToKeyValue => {
                debug!(relation = %self.name, attribute, keys = keys.len(), "eager lookup per key");
                let mut results = Vec::new();
                for key in keys {
                    if first_per_key {
                        results.extend(self.lookup_first(attribute, key)?);
                    } else {
                        results.extend(self.lookup(attribute, key)?);
                    }
                }
                Ok(results)
            }
        }
    }
}

/// A resolved relation, bound to its owner model type
#[derive(Clone)]
pub enum Relation {
    HasOneOrMany(HasOneOrMany),
    BelongsTo(BelongsTo),
    BelongsToMany(BelongsToMany),
    Through(ThroughChain),
}

impl Relation {
    /// Look up `name` on `parent` and build its resolver
    pub fn resolve(db: &HybridDb, parent: &Arc<ModelDef>, name: &str) -> Result<Relation> {
        let decl = parent
            .relation_decl(name)
            .ok_or_else(|| HybridError::relation_not_found(parent.name(), name))?;
        decl.build(db, parent, name)
    }

    fn context(&self) -> &RelationContext {
        match self {
            Relation::HasOneOrMany(r) => r.context(),
            Relation::BelongsTo(r) => r.context(),
            Relation::BelongsToMany(r) => r.context(),
            Relation::Through(r) => r.context(),
        }
    }

    pub fn name(&self) -> &str {
        &self.context().name
    }

    pub fn parent(&self) -> &Arc<ModelDef> {
        &self.context().parent
    }

    pub fn related(&self) -> &Arc<ModelDef> {
        &self.context().related
    }

    pub fn pairing(&self) -> Pairing {
        self.context().pairing()
    }

    pub fn kind(&self) -> RelationKind {
        match self {
            Relation::HasOneOrMany(r) if r.is_one() => RelationKind::OneToOne,
            Relation::HasOneOrMany(_) => RelationKind::OneToMany,
            Relation::BelongsTo(_) => RelationKind::BelongsTo,
            Relation::BelongsToMany(_) => RelationKind::ManyToManyPivot,
            Relation::Through(r) if r.is_one() => RelationKind::OneThroughOne,
            Relation::Through(_) => RelationKind::ManyThroughMany,
        }
    }

    pub fn is_one(&self) -> bool {
        self.kind().is_one()
    }

    pub fn describe(&self) -> RelationDescriptor {
        let ctx = self.context();
        let (foreign_key, local_key, pivot_table, through, has_default) = match self {
            Relation::HasOneOrMany(r) => (
                r.foreign_key().to_string(),
                r.local_key().to_string(),
                None,
                None,
                r.has_default(),
            ),
            Relation::BelongsTo(r) => (
                r.foreign_key().to_string(),
                r.owner_key().to_string(),
                None,
                None,
                r.has_default(),
            ),
            Relation::BelongsToMany(r) => (
                r.keys().foreign_pivot_key.clone(),
                r.keys().parent_key.clone(),
                Some(r.keys().table.clone()),
                None,
                false,
            ),
            Relation::Through(r) => {
                let (foreign_key, local_key) = r.join_keys();
                (
                    foreign_key,
                    local_key,
                    None,
                    Some(r.intermediate().name().to_string()),
                    r.has_default(),
                )
            }
        };

        RelationDescriptor {
            name: ctx.name.clone(),
            kind: self.kind(),
            owner: ctx.parent.name().to_string(),
            related: ctx.related.name().to_string(),
            pairing: ctx.pairing(),
            foreign_key,
            local_key,
            pivot_table,
            through,
            has_default,
        }
    }

    /// Attach a default-model policy. To-many relations ignore it.
    pub fn with_default(self, policy: DefaultModel) -> Self {
        match self {
            Relation::HasOneOrMany(r) => Relation::HasOneOrMany(r.with_default(policy)),
            Relation::BelongsTo(r) => Relation::BelongsTo(r.with_default(policy)),
            Relation::Through(r) => Relation::Through(r.with_default(policy)),
            other => other,
        }
    }

    /// Related records for one owner. Default models are never included.
    pub fn get(&self, owner: &Model) -> Result<Vec<Model>> {
        match self {
            Relation::HasOneOrMany(r) => r.get(owner),
            Relation::BelongsTo(r) => r.get(owner),
            Relation::BelongsToMany(r) => r.get(owner),
            Relation::Through(r) => r.get(owner),
        }
    }

    /// The relation value for one owner, falling back to the default model
    pub fn get_results(&self, owner: &Model) -> Result<RelationValue> {
        let mut results = self.get(owner)?;
        if self.is_one() {
            let found = if results.is_empty() {
                self.default_for(owner)
            } else {
                Some(results.swap_remove(0))
            };
            Ok(RelationValue::One(found.map(Box::new)))
        } else {
            Ok(RelationValue::Many(results))
        }
    }

    /// Related records for a batch of owners
    pub fn get_eager(&self, owners: &[Model]) -> Result<Vec<Model>> {
        match self {
            Relation::HasOneOrMany(r) => r.get_eager(owners),
            Relation::BelongsTo(r) => r.get_eager(owners),
            Relation::BelongsToMany(r) => r.get_eager(owners),
            Relation::Through(r) => r.get_eager(owners),
        }
    }

    /// Join value read off an owner
    pub fn owner_match_key(&self, owner: &Model) -> Option<String> {
        match self {
            Relation::HasOneOrMany(r) => r.owner_match_key(owner),
            Relation::BelongsTo(r) => r.owner_match_key(owner),
            Relation::BelongsToMany(r) => r.owner_match_key(owner),
            Relation::Through(r) => r.owner_match_key(owner),
        }
    }

    /// Join value read off a related record. Through-relations key far
    /// records by their intermediate.
    pub fn result_match_key(&self, result: &Model) -> Option<String> {
        match self {
            Relation::HasOneOrMany(r) => r.result_match_key(result),
            Relation::BelongsTo(r) => r.result_match_key(result),
            Relation::BelongsToMany(r) => r.result_match_key(result),
            Relation::Through(r) => r.result_match_key(result),
        }
    }

    pub fn build_dictionary(&self, results: Vec<Model>) -> Dictionary {
        let one = matches!(self, Relation::HasOneOrMany(_) | Relation::BelongsTo(_)) && self.is_one();
        Dictionary::build(one, results, |m| self.result_match_key(m))
    }

    fn default_for(&self, owner: &Model) -> Option<Model> {
        match self {
            Relation::HasOneOrMany(r) => r.default_for(owner),
            Relation::BelongsTo(r) => r.default_for(owner),
            Relation::BelongsToMany(_) => None,
            Relation::Through(r) => r.default_for(owner),
        }
    }

    /// Set `name` on every owner from a dictionary built by this relation
    pub fn match_eager(&self, owners: &mut [Model], dictionary: &Dictionary, name: &str) {
        for owner in owners.iter_mut() {
            let key = self.owner_match_key(owner);
            let value = if self.is_one() {
                let found = key
                    .as_deref()
                    .and_then(|k| dictionary.one(k))
                    .cloned()
                    .or_else(|| self.default_for(owner));
                RelationValue::One(found.map(Box::new))
            } else {
                let found = key.as_deref().map(|k| dictionary.many(k).to_vec());
                RelationValue::Many(found.unwrap_or_default())
            };
            owner.set_relation(name, value);
        }
    }

    /// Load this relation onto every owner under `name`
    pub fn eager_load(&self, owners: &mut [Model], name: &str) -> Result<()> {
        if owners.is_empty() {
            return Ok(());
        }
        match self {
            Relation::Through(chain) => chain.eager_load(owners, name),
            _ => {
                let results = self.get_eager(owners)?;
                debug!(relation = %name, owners = owners.len(), results = results.len(), "eager load");
                let dictionary = self.build_dictionary(results);
                self.match_eager(owners, &dictionary, name);
                Ok(())
            }
        }
    }
}

/// Resolve every named relation on `def`, failing on the first unknown name
pub(crate) fn resolve_all<'a>(
    db: &HybridDb,
    def: &Arc<ModelDef>,
    names: &'a [String],
) -> Result<Vec<(&'a String, Relation)>> {
    names
        .iter()
        .map(|name| Relation::resolve(db, def, name).map(|relation| (name, relation)))
        .collect()
}

/// Eager-load each named relation declared on `def` onto `models`
pub(crate) fn eager_load(db: &HybridDb, def: &Arc<ModelDef>, models: &mut [Model], names: &[String]) -> Result<()> {
    let relations = resolve_all(db, def, names)?;
    if models.is_empty() {
        return Ok(());
    }
    for (name, relation) in relations {
        relation.eager_load(models, name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn model(def: &Arc<ModelDef>, pairs: &[(&str, Value)]) -> Model {
        let attrs: Map<String, Value> = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        Model::hydrate(def.clone(), attrs, None)
    }

    #[test]
    fn test_pairing_table() {
        use StorageBackend::*;
        assert_eq!(Pairing::of(Relational, Relational), Pairing::RelationalToRelational);
        assert_eq!(Pairing::of(Relational, KeyValue), Pairing::RelationalToKeyValue);
        assert_eq!(Pairing::of(KeyValue, Relational), Pairing::KeyValueToRelational);
        assert_eq!(Pairing::of(KeyValue, KeyValue), Pairing::KeyValueToKeyValue);
        assert!(Pairing::RelationalToRelational.batches_with_in());
        assert!(!Pairing::RelationalToKeyValue.batches_with_in());
    }

    #[test]
    fn test_dictionary_keys_are_stringified_and_case_sensitive() {
        let def = Arc::new(ModelDef::key_value("ticket", "tickets"));
        let results = vec![
            model(&def, &[("id", json!(1)), ("customer_id", json!(7))]),
            model(&def, &[("id", json!(2)), ("customer_id", json!("7"))]),
            model(&def, &[("id", json!(3)), ("customer_id", json!("a"))]),
            model(&def, &[("id", json!(4))]),
        ];

        let dictionary = Dictionary::build(false, results, |m| m.key_string("customer_id"));
        assert_eq!(dictionary.len(), 2);
        assert_eq!(dictionary.many("7").len(), 2);
        assert_eq!(dictionary.many("a").len(), 1);
        assert!(dictionary.many("A").is_empty());
    }

    #[test]
    fn test_one_dictionary_keeps_first() {
        let def = Arc::new(ModelDef::key_value("owner", "owners"));
        let results = vec![
            model(&def, &[("id", json!(1)), ("car_id", json!(5))]),
            model(&def, &[("id", json!(2)), ("car_id", json!(5))]),
        ];
        let dictionary = Dictionary::build(true, results, |m| m.key_string("car_id"));
        assert_eq!(dictionary.one("5").and_then(|m| m.id()), Some("1".to_string()));
        assert_eq!(dictionary.many("5").len(), 1);
    }

    #[test]
    fn test_distinct_keys_preserves_first_seen_order() {
        let def = Arc::new(ModelDef::relational("project", "projects"));
        let models = vec![
            model(&def, &[("id", json!(3))]),
            model(&def, &[("id", json!(1))]),
            model(&def, &[("id", json!(3))]),
            model(&def, &[("id", Value::Null)]),
        ];
        assert_eq!(distinct_keys(&models, |m| m.id()), vec!["3", "1"]);
    }

    #[test]
    fn test_kind_cardinality() {
        assert!(RelationKind::OneToOne.is_one());
        assert!(RelationKind::BelongsTo.is_one());
        assert!(RelationKind::OneThroughOne.is_one());
        assert!(!RelationKind::ManyToManyPivot.is_one());
        assert!(!RelationKind::ManyThroughMany.is_one());
    }
}
