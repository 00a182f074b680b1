//! Inverse one-to-one / one-to-many relation
//!
//! The declaring (child) model carries `foreign_key`, matched against the
//! related owner's `owner_key`.

use serde_json::Value;

use super::default_model::DefaultModel;
use super::{distinct_keys, RelationContext};
use crate::engine::error::Result;
use crate::engine::model::{Model, RelationValue};
use crate::engine::query::{ModelQuery, RelationQueryable};

#[derive(Clone)]
pub struct BelongsTo {
    ctx: RelationContext,
    foreign_key: String,
    owner_key: String,
    default: Option<DefaultModel>,
}

impl BelongsTo {
    pub(crate) fn new(ctx: RelationContext, foreign_key: String, owner_key: String) -> Self {
        Self {
            ctx,
            foreign_key,
            owner_key,
            default: None,
        }
    }

    pub(crate) fn context(&self) -> &RelationContext {
        &self.ctx
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn owner_key(&self) -> &str {
        &self.owner_key
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn with_default(mut self, policy: DefaultModel) -> Self {
        self.default = Some(policy);
        self
    }

    pub fn query(&self, child: &Model) -> Option<ModelQuery> {
        let key = child.key_string(&self.foreign_key)?;
        Some(self.ctx.related_query().where_eq(&self.owner_key, key))
    }

    pub fn get(&self, child: &Model) -> Result<Vec<Model>> {
        let Some(key) = child.key_string(&self.foreign_key) else {
            return Ok(Vec::new());
        };
        Ok(self.ctx.lookup_first(&self.owner_key, &key)?.into_iter().collect())
    }

    pub fn get_eager(&self, children: &[Model]) -> Result<Vec<Model>> {
        let keys = distinct_keys(children, |child| child.key_string(&self.foreign_key));
        self.ctx.lookup_eager(&self.owner_key, &keys, true)
    }

    pub fn owner_match_key(&self, child: &Model) -> Option<String> {
        child.key_string(&self.foreign_key)
    }

    pub fn result_match_key(&self, result: &Model) -> Option<String> {
        result.key_string(&self.owner_key)
    }

    pub(crate) fn default_for(&self, child: &Model) -> Option<Model> {
        let policy = self.default.as_ref()?;
        Some(policy.build(&self.ctx.related, child, |_| {}))
    }

    /// Point `child` at `parent` and cache the relation. Nothing is saved.
    pub fn associate(&self, child: &mut Model, parent: &Model) {
        let key = parent.get(&self.owner_key).cloned().unwrap_or(Value::Null);
        child.set(&self.foreign_key, key);
        child.set_relation(&self.ctx.name, RelationValue::One(Some(Box::new(parent.clone()))));
    }

    /// Clear the foreign key on `child`. Nothing is saved.
    pub fn dissociate(&self, child: &mut Model) {
        child.set(&self.foreign_key, Value::Null);
        child.set_relation(&self.ctx.name, RelationValue::One(None));
    }
}
