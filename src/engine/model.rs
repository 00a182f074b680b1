//! Model definitions and instances
//!
//! A `ModelDef` is the schema of one model type: where it lives, how its
//! key is built, how attributes are cast and which relations it declares.
//! A `Model` is one hydrated (or not yet persisted) record plus any
//! relations loaded onto it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::error::{HybridError, Result};
use super::kv::{KeyScheme, Record};
use super::relations::RelationDecl;

/// Which store a model type is persisted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Relational,
    KeyValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastKind {
    String,
    Integer,
    Float,
    Boolean,
    Json,
}

/// Stringify a value for keying and key-value storage. `Null` has no key.
pub fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        other => Some(other.to_string()),
    }
}

/// Canonical integer text for `raw`; exact for whole numbers, truncated for fractions
fn integer_key(raw: &str) -> Option<String> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(i.to_string());
    }
    if let Ok(u) = raw.parse::<u64>() {
        return Some(u.to_string());
    }
    raw.parse::<f64>().ok().map(|f| (f as i64).to_string())
}

#[derive(Debug, Clone)]
pub struct ModelDef {
    name: String,
    table: String,
    backend: StorageBackend,
    primary_key: String,
    sub_keys: Vec<String>,
    casts: HashMap<String, CastKind>,
    relations: BTreeMap<String, RelationDecl>,
}

impl ModelDef {
    pub fn new(name: &str, table: &str, backend: StorageBackend) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            backend,
            primary_key: "id".to_string(),
            sub_keys: Vec::new(),
            casts: HashMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn key_value(name: &str, collection: &str) -> Self {
        Self::new(name, collection, StorageBackend::KeyValue)
    }

    pub fn relational(name: &str, table: &str) -> Self {
        Self::new(name, table, StorageBackend::Relational)
    }

    pub fn primary_key(mut self, key: &str) -> Self {
        self.primary_key = key.to_string();
        self
    }

    pub fn sub_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn cast(mut self, attribute: &str, kind: CastKind) -> Self {
        self.casts.insert(attribute.to_string(), kind);
        self
    }

    pub fn relation(mut self, name: &str, decl: impl Into<RelationDecl>) -> Self {
        self.relations.insert(name.to_string(), decl.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn backend(&self) -> StorageBackend {
        self.backend
    }

    pub fn key_name(&self) -> &str {
        &self.primary_key
    }

    pub fn sub_key_names(&self) -> &[String] {
        &self.sub_keys
    }

    pub fn key_scheme(&self) -> KeyScheme {
        KeyScheme::new(&self.table, &self.primary_key, self.sub_keys.iter().cloned())
    }

    pub fn relation_decl(&self, name: &str) -> Option<&RelationDecl> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = (&String, &RelationDecl)> {
        self.relations.iter()
    }

    /// `<name>_<primary key>`, the conventional foreign key pointing at this model
    pub fn foreign_key(&self) -> String {
        format!("{}_{}", self.name, self.primary_key)
    }

    /// Normalize a value to the string the key-value store holds
    pub fn cast_for_store(&self, attribute: &str, value: &Value) -> Option<String> {
        if value.is_null() {
            return None;
        }
        match self.casts.get(attribute) {
            Some(CastKind::Integer) => Some(match value {
                Value::Bool(b) => (*b as i64).to_string(),
                Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                    (Some(i), _) => i.to_string(),
                    (None, Some(u)) => u.to_string(),
                    _ => (n.as_f64().unwrap_or_default() as i64).to_string(),
                },
                Value::String(s) => integer_key(s.trim()).unwrap_or_else(|| s.clone()),
                other => other.to_string(),
            }),
            Some(CastKind::Float) => Some(match value {
                Value::Number(n) => n.as_f64().unwrap_or_default().to_string(),
                Value::String(s) => s.trim().parse::<f64>().map(|f| f.to_string()).unwrap_or_else(|_| s.clone()),
                other => value_to_key(other).unwrap_or_default(),
            }),
            Some(CastKind::Boolean) => {
                let truthy = match value {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                    Value::String(s) => !matches!(s.as_str(), "" | "0" | "false"),
                    _ => true,
                };
                Some(if truthy { "1" } else { "0" }.to_string())
            }
            Some(CastKind::Json) => Some(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            Some(CastKind::String) | None => value_to_key(value),
        }
    }

    /// Turn a stored string back into a typed attribute
    pub fn cast_from_store(&self, attribute: &str, raw: &str) -> Value {
        match self.casts.get(attribute) {
            Some(CastKind::Integer) => raw
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| raw.parse::<u64>().map(Value::from))
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            Some(CastKind::Float) => raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())),
            Some(CastKind::Boolean) => Value::Bool(matches!(raw, "1" | "true")),
            Some(CastKind::Json) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            }
            Some(CastKind::String) | None => Value::String(raw.to_string()),
        }
    }

    /// Stored form of every non-null attribute
    pub fn to_record(&self, attributes: &Map<String, Value>) -> Record {
        attributes
            .iter()
            .filter_map(|(k, v)| self.cast_for_store(k, v).map(|s| (k.clone(), s)))
            .collect()
    }

    pub fn from_record(&self, record: &Record) -> Map<String, Value> {
        record
            .iter()
            .map(|(k, v)| (k.clone(), self.cast_from_store(k, v)))
            .collect()
    }
}

/// A loaded relation on a model
#[derive(Debug, Clone)]
pub enum RelationValue {
    One(Option<Box<Model>>),
    Many(Vec<Model>),
}

impl RelationValue {
    pub fn as_one(&self) -> Option<&Model> {
        match self {
            RelationValue::One(model) => model.as_deref(),
            RelationValue::Many(models) => models.first(),
        }
    }

    pub fn as_many(&self) -> &[Model] {
        match self {
            RelationValue::One(Some(model)) => std::slice::from_ref(model.as_ref()),
            RelationValue::One(None) => &[],
            RelationValue::Many(models) => models,
        }
    }

    pub fn into_models(self) -> Vec<Model> {
        match self {
            RelationValue::One(model) => model.map(|m| vec![*m]).unwrap_or_default(),
            RelationValue::Many(models) => models,
        }
    }

    pub fn len(&self) -> usize {
        self.as_many().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    def: Arc<ModelDef>,
    attributes: Map<String, Value>,
    original: Map<String, Value>,
    exists: bool,
    key: Option<String>,
    relations: BTreeMap<String, RelationValue>,
}

impl Model {
    /// A fresh, unsaved instance
    pub fn new_instance(def: Arc<ModelDef>, attributes: Map<String, Value>) -> Self {
        Self {
            def,
            attributes,
            original: Map::new(),
            exists: false,
            key: None,
            relations: BTreeMap::new(),
        }
    }

    /// An instance read back from a store, original attributes synced
    pub fn hydrate(def: Arc<ModelDef>, attributes: Map<String, Value>, key: Option<String>) -> Self {
        Self {
            def,
            original: attributes.clone(),
            attributes,
            exists: true,
            key,
            relations: BTreeMap::new(),
        }
    }

    pub fn definition(&self) -> &Arc<ModelDef> {
        &self.def
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn backend(&self) -> StorageBackend {
        self.def.backend()
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Physical key for key-value models that have been read or written
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Attribute stringified for keying; `None` when missing or null
    pub fn key_string(&self, attribute: &str) -> Option<String> {
        self.attributes.get(attribute).and_then(value_to_key)
    }

    pub fn id(&self) -> Option<String> {
        self.key_string(self.def.key_name())
    }

    pub fn set(&mut self, attribute: &str, value: impl Into<Value>) {
        self.attributes.insert(attribute.to_string(), value.into());
    }

    pub fn fill(&mut self, attributes: Map<String, Value>) {
        self.attributes.extend(attributes);
    }

    pub fn is_dirty(&self) -> bool {
        self.attributes != self.original
    }

    pub(crate) fn mark_persisted(&mut self, key: Option<String>) {
        self.exists = true;
        self.key = key;
        self.original = self.attributes.clone();
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.exists = false;
        self.key = None;
    }

    pub fn set_relation(&mut self, name: &str, value: RelationValue) -> &RelationValue {
        match self.relations.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(value);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(value),
        }
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    pub fn relation_loaded(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn related_one(&self, name: &str) -> Option<&Model> {
        self.relations.get(name).and_then(RelationValue::as_one)
    }

    pub fn related_many(&self, name: &str) -> &[Model] {
        self.relations
            .get(name)
            .map(RelationValue::as_many)
            .unwrap_or(&[])
    }

    pub fn unset_relation(&mut self, name: &str) -> Option<RelationValue> {
        self.relations.remove(name)
    }
}

/// Registry of every model type the engine can resolve
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: HashMap<String, Arc<ModelDef>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, def: ModelDef) -> Self {
        self.models.insert(def.name().to_string(), Arc::new(def));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelDef>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| HybridError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelDef>> {
        self.models.values()
    }

    /// Check every declared relation points at registered models and relations
    pub fn validate(&self) -> Result<()> {
        for def in self.models.values() {
            for (name, decl) in def.relations() {
                decl.validate(self, def, name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket_def() -> ModelDef {
        ModelDef::key_value("ticket", "tickets")
            .sub_keys(["customer_id"])
            .cast("customer_id", CastKind::Integer)
            .cast("open", CastKind::Boolean)
            .cast("price", CastKind::Float)
            .cast("meta", CastKind::Json)
    }

    #[test]
    fn test_cast_for_store() {
        let def = ticket_def();
        assert_eq!(def.cast_for_store("customer_id", &json!(1)), Some("1".into()));
        assert_eq!(def.cast_for_store("customer_id", &json!("2")), Some("2".into()));
        assert_eq!(def.cast_for_store("open", &json!(true)), Some("1".into()));
        assert_eq!(def.cast_for_store("open", &json!("false")), Some("0".into()));
        assert_eq!(def.cast_for_store("meta", &json!({"a": 1})), Some("{\"a\":1}".into()));
        assert_eq!(def.cast_for_store("title", &json!(5)), Some("5".into()));
        assert_eq!(def.cast_for_store("title", &Value::Null), None);
    }

    #[test]
    fn test_integer_cast_keeps_large_ids_exact() {
        let def = ticket_def();
        let big = 9007199254740993i64;
        assert_eq!(def.cast_for_store("customer_id", &json!(big)), Some(big.to_string()));
        assert_eq!(def.cast_for_store("customer_id", &json!("9007199254740993")), Some(big.to_string()));
        assert_eq!(def.cast_for_store("customer_id", &json!(" 9007199254740993 ")), Some(big.to_string()));
        assert_eq!(def.cast_for_store("customer_id", &json!(u64::MAX)), Some(u64::MAX.to_string()));
        assert_eq!(def.cast_for_store("customer_id", &json!(u64::MAX.to_string())), Some(u64::MAX.to_string()));
        assert_eq!(def.cast_for_store("customer_id", &json!("3.7")), Some("3".into()));
        assert_eq!(def.cast_for_store("customer_id", &json!(3.7)), Some("3".into()));
        assert_eq!(def.cast_for_store("customer_id", &json!("abc")), Some("abc".into()));

        let record = def.to_record(&json!({"customer_id": "9007199254740993"}).as_object().cloned().unwrap_or_default());
        assert_eq!(def.from_record(&record).get("customer_id"), Some(&json!(big)));
        assert_eq!(def.cast_from_store("customer_id", &u64::MAX.to_string()), json!(u64::MAX));
    }

    #[test]
    fn test_cast_from_store() {
        let def = ticket_def();
        assert_eq!(def.cast_from_store("customer_id", "7"), json!(7));
        assert_eq!(def.cast_from_store("open", "1"), json!(true));
        assert_eq!(def.cast_from_store("price", "2.5"), json!(2.5));
        assert_eq!(def.cast_from_store("meta", "{\"a\":1}"), json!({"a": 1}));
        assert_eq!(def.cast_from_store("title", "x"), json!("x"));
    }

    #[test]
    fn test_key_scheme_from_definition() {
        let scheme = ticket_def().key_scheme();
        assert_eq!(scheme.collection(), "tickets");
        assert_eq!(scheme.keys().to_vec(), vec!["id", "customer_id"]);
    }

    #[test]
    fn test_model_state() {
        let def = Arc::new(ticket_def());
        let mut attrs = Map::new();
        attrs.insert("id".into(), json!(3));
        let mut model = Model::new_instance(def.clone(), attrs);
        assert!(!model.exists());
        assert_eq!(model.id(), Some("3".into()));

        model.mark_persisted(Some("tickets:id:3:customer_id:*".into()));
        assert!(model.exists());
        assert!(!model.is_dirty());
        model.set("title", "changed");
        assert!(model.is_dirty());
    }

    #[test]
    fn test_relation_values() {
        let def = Arc::new(ticket_def());
        let mut owner = Model::new_instance(def.clone(), Map::new());
        assert!(owner.related_many("tickets").is_empty());

        let child = Model::new_instance(def, Map::new());
        owner.set_relation("ticket", RelationValue::One(Some(Box::new(child))));
        assert!(owner.related_one("ticket").is_some());
        assert_eq!(owner.relation("ticket").map(RelationValue::len), Some(1));

        owner.set_relation("ticket", RelationValue::One(None));
        assert!(owner.relation("ticket").is_some_and(RelationValue::is_empty));
    }

    #[test]
    fn test_unknown_model() {
        let schema = Schema::new().register(ticket_def());
        assert!(schema.get("ticket").is_ok());
        assert!(matches!(schema.get("nope"), Err(HybridError::UnknownModel(_))));
    }
}
