//! Through-relations
//!
//! A `ThroughChain` composes a `through` relation (owner to intermediate)
//! with a `has` relation (intermediate to far). Declared has-one/has-many
//! through relations and the fluent `through(x).has(y)` form both end up
//! here, so they resolve identically.

use std::sync::Arc;
use tracing::debug;

use super::default_model::DefaultModel;
use super::{Dictionary, Relation, RelationContext};
use crate::engine::error::{HybridError, Result};
use crate::engine::hybrid::HybridDb;
use crate::engine::model::{Model, ModelDef, RelationValue};

#[derive(Clone)]
pub struct ThroughChain {
    ctx: RelationContext,
    through: Box<Relation>,
    has: Box<Relation>,
    one: bool,
    default: Option<DefaultModel>,
}

impl ThroughChain {
    pub(crate) fn new(ctx: RelationContext, through: Relation, has: Relation, one: bool) -> Self {
        Self {
            ctx,
            through: Box::new(through),
            has: Box::new(has),
            one,
            default: None,
        }
    }

    /// Chain an already-resolved `through` relation with `has` declared on
    /// the intermediate model. Single when `has` is single.
    pub(crate) fn compose(
        db: &HybridDb,
        name: &str,
        parent: Arc<ModelDef>,
        through: Relation,
        has: &str,
    ) -> Result<Self> {
        if matches!(through, Relation::Through(_)) {
            return Err(HybridError::malformed(parent.name(), name, "through relations cannot be nested"));
        }

        let intermediate = through.related().clone();
        let has = Relation::resolve(db, &intermediate, has).map_err(|e| match e {
            HybridError::RelationNotFound { relation, .. } => HybridError::malformed(
                parent.name(),
                name,
                format!("unknown relation '{}' on '{}'", relation, intermediate.name()),
            ),
            other => other,
        })?;
        if matches!(has, Relation::Through(_)) {
            return Err(HybridError::malformed(parent.name(), name, "through relations cannot be nested"));
        }

        let one = has.is_one();
        let ctx = RelationContext::new(db, name, parent, has.related().clone());
        Ok(Self::new(ctx, through, has, one))
    }

    pub(crate) fn context(&self) -> &RelationContext {
        &self.ctx
    }

    pub fn is_one(&self) -> bool {
        self.one
    }

    pub fn intermediate(&self) -> &Arc<ModelDef> {
        self.through.related()
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

    /// (key on the far model, key on the owner)
    pub(crate) fn join_keys(&self) -> (String, String) {
        let far = self.has.describe();
        let near = self.through.describe();
        (far.foreign_key, near.local_key)
    }

    /// Intermediates for one owner; single chains follow only the first
    fn intermediates_for(&self, owner: &Model) -> Result<Vec<Model>> {
        let mut intermediates = self.through.get(owner)?;
        if self.one {
            intermediates.truncate(1);
        }
        Ok(intermediates)
    }

    pub fn get(&self, owner: &Model) -> Result<Vec<Model>> {
        let mut far = Vec::new();
        for intermediate in self.intermediates_for(owner)? {
            far.extend(self.has.get(&intermediate)?);
        }
        if self.one {
            far.truncate(1);
        }
        Ok(far)
    }

    /// Far records for a batch of owners, without owner grouping
    pub fn get_eager(&self, owners: &[Model]) -> Result<Vec<Model>> {
        let intermediates = self.through.get_eager(owners)?;
        if intermediates.is_empty() {
            return Ok(Vec::new());
        }
        self.has.get_eager(&intermediates)
    }

    pub fn owner_match_key(&self, owner: &Model) -> Option<String> {
        self.through.owner_match_key(owner)
    }

    pub fn result_match_key(&self, result: &Model) -> Option<String> {
        self.has.result_match_key(result)
    }

    pub(crate) fn default_for(&self, owner: &Model) -> Option<Model> {
        let policy = self.default.as_ref()?;
        Some(policy.build(&self.ctx.related, owner, |_| {}))
    }

    /// Intermediates are resolved once for all owners, far records once for
    /// all intermediates, then joined back per owner.
    pub fn eager_load(&self, owners: &mut [Model], name: &str) -> Result<()> {
        let intermediates = self.through.get_eager(owners)?;
        let far = if intermediates.is_empty() {
            Vec::new()
        } else {
            self.has.get_eager(&intermediates)?
        };
        debug!(
            relation = %name,
            owners = owners.len(),
            intermediates = intermediates.len(),
            far = far.len(),
            "eager load through"
        );

        let by_owner = Dictionary::build(false, intermediates, |m| self.through.result_match_key(m));
        let by_intermediate = Dictionary::build(false, far, |m| self.has.result_match_key(m));

        for owner in owners.iter_mut() {
            let mut intermediates = self
                .owner_match_key(owner)
                .map(|key| by_owner.many(&key))
                .unwrap_or(&[]);
            if self.one && intermediates.len() > 1 {
                intermediates = &intermediates[..1];
            }

            let mut results: Vec<Model> = intermediates
                .iter()
                .filter_map(|intermediate| self.has.owner_match_key(intermediate))
                .flat_map(|key| by_intermediate.many(&key).to_vec())
                .collect();

            let value = if self.one {
                let found = if results.is_empty() {
                    self.default_for(owner)
                } else {
                    Some(results.swap_remove(0))
                };
                RelationValue::One(found.map(Box::new))
            } else {
                RelationValue::Many(results)
            };
            owner.set_relation(name, value);
        }
        Ok(())
    }
}

/// First half of a fluent `through(x).has(y)` chain
pub struct PendingThrough {
    db: HybridDb,
    parent: Arc<ModelDef>,
    through: Relation,
}

impl PendingThrough {
    pub(crate) fn new(db: &HybridDb, parent: Arc<ModelDef>, relation: &str) -> Result<Self> {
        let through = Relation::resolve(db, &parent, relation)?;
        if matches!(through, Relation::Through(_)) {
            return Err(HybridError::malformed(parent.name(), relation, "through relations cannot be nested"));
        }
        Ok(Self {
            db: db.clone(),
            parent,
            through,
        })
    }

    /// The intermediate model type
    pub fn intermediate(&self) -> &Arc<ModelDef> {
        self.through.related()
    }

    /// Complete the chain with a relation declared on the intermediate model
    pub fn has(self, relation: &str) -> Result<Relation> {
        let name = format!("{}.{}", self.through.name(), relation);
        let intermediate = self.through.related().clone();
        if intermediate.relation_decl(relation).is_none() {
            return Err(HybridError::relation_not_found(intermediate.name(), relation));
        }
        let chain = ThroughChain::compose(&self.db, &name, self.parent, self.through, relation)?;
        Ok(Relation::Through(chain))
    }
}
