//! One-to-one and one-to-many relations
//!
//! The related model carries `foreign_key`, matched against the owner's
//! `local_key`.

use serde_json::{Map, Value};

use super::default_model::DefaultModel;
use super::{distinct_keys, RelationContext};
use crate::engine::error::{HybridError, Result};
use crate::engine::model::Model;
use crate::engine::query::{ModelQuery, RelationQueryable};

#[derive(Clone)]
pub struct HasOneOrMany {
    ctx: RelationContext,
    foreign_key: String,
    local_key: String,
    one: bool,
    default: Option<DefaultModel>,
}

impl HasOneOrMany {
    pub(crate) fn new(ctx: RelationContext, foreign_key: String, local_key: String, one: bool) -> Self {
        Self {
            ctx,
            foreign_key,
            local_key,
            one,
            default: None,
        }
    }

    pub(crate) fn context(&self) -> &RelationContext {
        &self.ctx
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn is_one(&self) -> bool {
        self.one
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn with_default(mut self, policy: DefaultModel) -> Self {
        if self.one {
            self.default = Some(policy);
        }
        self
    }

    /// Query over the owner's related records; `None` when the owner has no local key
    pub fn query(&self, owner: &Model) -> Option<ModelQuery> {
        let key = owner.key_string(&self.local_key)?;
        Some(self.ctx.related_query().where_eq(&self.foreign_key, key))
    }

    pub fn get(&self, owner: &Model) -> Result<Vec<Model>> {
        let Some(key) = owner.key_string(&self.local_key) else {
            return Ok(Vec::new());
        };
        if self.one {
            Ok(self.ctx.lookup_first(&self.foreign_key, &key)?.into_iter().collect())
        } else {
            self.ctx.lookup(&self.foreign_key, &key)
        }
    }

    pub fn get_eager(&self, owners: &[Model]) -> Result<Vec<Model>> {
        let keys = distinct_keys(owners, |owner| owner.key_string(&self.local_key));
        self.ctx.lookup_eager(&self.foreign_key, &keys, self.one)
    }

    pub fn owner_match_key(&self, owner: &Model) -> Option<String> {
        owner.key_string(&self.local_key)
    }

    pub fn result_match_key(&self, result: &Model) -> Option<String> {
        result.key_string(&self.foreign_key)
    }

    /// The default carries the owner's key in its foreign key
    pub(crate) fn default_for(&self, owner: &Model) -> Option<Model> {
        let policy = self.default.as_ref()?;
        Some(policy.build(&self.ctx.related, owner, |instance| {
            if let Some(value) = owner.get(&self.local_key) {
                instance.set(&self.foreign_key, value.clone());
            }
        }))
    }

    /// An unsaved related instance pointing at `owner`
    pub fn make(&self, owner: &Model, attributes: Map<String, Value>) -> Result<Model> {
        let key = owner
            .get(&self.local_key)
            .filter(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| HybridError::MissingAttribute {
                model: owner.name().to_string(),
                attribute: self.local_key.clone(),
            })?;

        let mut model = Model::new_instance(self.ctx.related.clone(), attributes);
        model.set(&self.foreign_key, key);
        Ok(model)
    }

    /// Create and persist a related record pointing at `owner`
    pub fn create(&self, owner: &Model, attributes: Map<String, Value>) -> Result<Model> {
        let mut model = self.make(owner, attributes)?;
        self.ctx.db.save(&mut model)?;
        Ok(model)
    }
}
