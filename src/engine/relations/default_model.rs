//! Default models for empty one-to-one relations
//!
//! The placeholder is a fresh instance of the related model with
//! `exists() == false`. It is never written to either store.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::engine::model::{Model, ModelDef};

type Initializer = Arc<dyn Fn(&mut Model, &Model) + Send + Sync>;

#[derive(Clone)]
pub enum DefaultModel {
    /// A blank instance
    Empty,
    /// A blank instance filled with these attributes
    Attributes(Map<String, Value>),
    /// A blank instance handed to a callback with the owner
    Initializer(Initializer),
}

impl DefaultModel {
    pub fn attributes(attributes: Map<String, Value>) -> Self {
        DefaultModel::Attributes(attributes)
    }

    pub fn initializer<F>(f: F) -> Self
    where
        F: Fn(&mut Model, &Model) + Send + Sync + 'static,
    {
        DefaultModel::Initializer(Arc::new(f))
    }

    /// Build the placeholder. `prepare` runs before the policy is applied.
    pub(crate) fn build<F>(&self, related: &Arc<ModelDef>, owner: &Model, prepare: F) -> Model
    where
        F: FnOnce(&mut Model),
    {
        let mut instance = Model::new_instance(related.clone(), Map::new());
        prepare(&mut instance);

        match self {
            DefaultModel::Empty => {}
            DefaultModel::Attributes(attributes) => instance.fill(attributes.clone()),
            DefaultModel::Initializer(init) => init(&mut instance, owner),
        }
        instance
    }
}

impl fmt::Debug for DefaultModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultModel::Empty => write!(f, "Empty"),
            DefaultModel::Attributes(attributes) => f.debug_tuple("Attributes").field(attributes).finish(),
            DefaultModel::Initializer(_) => write!(f, "Initializer(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defs() -> (Arc<ModelDef>, Model) {
        let related = Arc::new(ModelDef::key_value("owner", "owners").sub_keys(["car_id"]));
        let mut attrs = Map::new();
        attrs.insert("id".into(), json!(9));
        attrs.insert("name".into(), json!("garage"));
        let parent = Model::hydrate(Arc::new(ModelDef::relational("car", "cars")), attrs, None);
        (related, parent)
    }

    #[test]
    fn test_empty_default() {
        let (related, parent) = defs();
        let model = DefaultModel::Empty.build(&related, &parent, |_| {});
        assert!(!model.exists());
        assert!(model.attributes().is_empty());
        assert_eq!(model.name(), "owner");
    }

    #[test]
    fn test_attribute_default_after_prepare() {
        let (related, parent) = defs();
        let mut attrs = Map::new();
        attrs.insert("name".into(), json!("Unknown"));
        let model = DefaultModel::attributes(attrs).build(&related, &parent, |m| m.set("car_id", 9));
        assert_eq!(model.get("name"), Some(&json!("Unknown")));
        assert_eq!(model.get("car_id"), Some(&json!(9)));
    }

    #[test]
    fn test_initializer_sees_owner() {
        let (related, parent) = defs();
        let policy = DefaultModel::initializer(|instance, owner| {
            let label = format!("owner of {}", owner.get("name").and_then(Value::as_str).unwrap_or("?"));
            instance.set("name", label);
        });
        let model = policy.build(&related, &parent, |_| {});
        assert_eq!(model.get("name"), Some(&json!("owner of garage")));
        assert!(format!("{:?}", policy).starts_with("Initializer"));
    }
}
