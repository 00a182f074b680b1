//! Relation declarations
//!
//! Declarations are plain data attached to a `ModelDef`. Turning one into a
//! resolver happens per call in `build`, which is also where conventional
//! key names are filled in.

use std::sync::Arc;

use super::belongs_to::BelongsTo;
use super::belongs_to_many::{BelongsToMany, PivotKeys};
use super::default_model::DefaultModel;
use super::has_one_or_many::HasOneOrMany;
use super::through::ThroughChain;
use super::{Relation, RelationContext};
use crate::engine::error::{HybridError, Result};
use crate::engine::hybrid::HybridDb;
use crate::engine::model::{ModelDef, Schema};

#[derive(Debug, Clone)]
pub enum RelationDecl {
    Has(HasDecl),
    BelongsTo(BelongsToDecl),
    BelongsToMany(PivotDecl),
    HasThrough(ThroughDecl),
    Through(FluentThroughDecl),
}

/// `hasOne` / `hasMany`: the foreign key lives on the related model
#[derive(Debug, Clone)]
pub struct HasDecl {
    related: String,
    one: bool,
    foreign_key: Option<String>,
    local_key: Option<String>,
    default: Option<DefaultModel>,
}

/// `belongsTo`: the foreign key lives on the declaring model
#[derive(Debug, Clone)]
pub struct BelongsToDecl {
    related: String,
    foreign_key: Option<String>,
    owner_key: Option<String>,
    default: Option<DefaultModel>,
}

/// `belongsToMany` through a relational pivot table
#[derive(Debug, Clone)]
pub struct PivotDecl {
    related: String,
    table: Option<String>,
    foreign_pivot_key: Option<String>,
    related_pivot_key: Option<String>,
    parent_key: Option<String>,
    related_key: Option<String>,
    pivot_columns: Vec<String>,
    timestamps: bool,
    accessor: Option<String>,
    using: Option<String>,
}

/// `hasOneThrough` / `hasManyThrough` declared with explicit keys
#[derive(Debug, Clone)]
pub struct ThroughDecl {
    related: String,
    through: String,
    one: bool,
    first_key: Option<String>,
    second_key: Option<String>,
    local_key: Option<String>,
    second_local_key: Option<String>,
    default: Option<DefaultModel>,
}

/// `through(relation).has(relation)` composed from two declared relations
#[derive(Debug, Clone)]
pub struct FluentThroughDecl {
    through: String,
    has: String,
    default: Option<DefaultModel>,
}

#[derive(Debug, Clone)]
pub struct PendingThroughDecl {
    through: String,
}

impl RelationDecl {
    pub fn has_one(related: &str) -> HasDecl {
        HasDecl::new(related, true)
    }

    pub fn has_many(related: &str) -> HasDecl {
        HasDecl::new(related, false)
    }

    pub fn belongs_to(related: &str) -> BelongsToDecl {
        BelongsToDecl {
            related: related.to_string(),
            foreign_key: None,
            owner_key: None,
            default: None,
        }
    }

    pub fn belongs_to_many(related: &str) -> PivotDecl {
        PivotDecl {
            related: related.to_string(),
            table: None,
            foreign_pivot_key: None,
            related_pivot_key: None,
            parent_key: None,
            related_key: None,
            pivot_columns: Vec::new(),
            timestamps: false,
            accessor: None,
            using: None,
        }
    }

    pub fn has_one_through(related: &str, through: &str) -> ThroughDecl {
        ThroughDecl::new(related, through, true)
    }

    pub fn has_many_through(related: &str, through: &str) -> ThroughDecl {
        ThroughDecl::new(related, through, false)
    }

    pub fn through(relation: &str) -> PendingThroughDecl {
        PendingThroughDecl {
            through: relation.to_string(),
        }
    }

    /// The related model name, when the declaration names one directly
    pub fn related_model(&self) -> Option<&str> {
        match self {
            RelationDecl::Has(d) => Some(&d.related),
            RelationDecl::BelongsTo(d) => Some(&d.related),
            RelationDecl::BelongsToMany(d) => Some(&d.related),
            RelationDecl::HasThrough(d) => Some(&d.related),
            RelationDecl::Through(_) => None,
        }
    }

    pub fn is_through(&self) -> bool {
        matches!(self, RelationDecl::HasThrough(_) | RelationDecl::Through(_))
    }

    fn default_policy(&self) -> Option<&DefaultModel> {
        match self {
            RelationDecl::Has(d) => d.default.as_ref(),
            RelationDecl::BelongsTo(d) => d.default.as_ref(),
            RelationDecl::BelongsToMany(_) => None,
            RelationDecl::HasThrough(d) => d.default.as_ref(),
            RelationDecl::Through(d) => d.default.as_ref(),
        }
    }

    /// Whether the declared relation yields at most one model
    pub(crate) fn returns_one(&self) -> bool {
        match self {
            RelationDecl::Has(d) => d.one,
            RelationDecl::BelongsTo(_) => true,
            RelationDecl::BelongsToMany(_) | RelationDecl::Through(_) => false,
            RelationDecl::HasThrough(d) => d.one,
        }
    }

    pub(crate) fn validate(&self, schema: &Schema, parent: &ModelDef, name: &str) -> Result<()> {
        let require = |model: &str| {
            schema
                .get(model)
                .map_err(|_| HybridError::malformed(parent.name(), name, format!("unknown model '{}'", model)))
        };

        match self {
            RelationDecl::Has(d) => {
                require(&d.related)?;
                if d.default.is_some() && !d.one {
                    return Err(HybridError::malformed(
                        parent.name(),
                        name,
                        "withDefault is only supported on one-to-one relations",
                    ));
                }
            }
            RelationDecl::BelongsTo(d) => {
                require(&d.related)?;
            }
            RelationDecl::BelongsToMany(d) => {
                require(&d.related)?;
                if d.accessor.as_deref() == Some("") {
                    return Err(HybridError::malformed(parent.name(), name, "pivot accessor must not be empty"));
                }
            }
            RelationDecl::HasThrough(d) => {
                require(&d.related)?;
                require(&d.through)?;
                if d.default.is_some() && !d.one {
                    return Err(HybridError::malformed(
                        parent.name(),
                        name,
                        "withDefault is only supported on one-to-one relations",
                    ));
                }
            }
            RelationDecl::Through(d) => {
                let through = parent.relation_decl(&d.through).ok_or_else(|| {
                    HybridError::malformed(parent.name(), name, format!("unknown relation '{}'", d.through))
                })?;
                if through.is_through() {
                    return Err(HybridError::malformed(parent.name(), name, "through relations cannot be nested"));
                }
                let intermediate_name = through.related_model().unwrap_or_default();
                let intermediate = require(intermediate_name)?;
                let has = intermediate.relation_decl(&d.has).ok_or_else(|| {
                    HybridError::malformed(
                        parent.name(),
                        name,
                        format!("unknown relation '{}' on '{}'", d.has, intermediate.name()),
                    )
                })?;
                if has.is_through() {
                    return Err(HybridError::malformed(parent.name(), name, "through relations cannot be nested"));
                }
                if d.default.is_some() && !has.returns_one() {
                    return Err(HybridError::malformed(
                        parent.name(),
                        name,
                        "withDefault is only supported on one-to-one relations",
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn build(&self, db: &HybridDb, parent: &Arc<ModelDef>, name: &str) -> Result<Relation> {
        let lookup = |model: &str| {
            db.definition(model)
                .map_err(|_| HybridError::malformed(parent.name(), name, format!("unknown model '{}'", model)))
        };

        let relation = match self {
            RelationDecl::Has(d) => {
                let related = lookup(&d.related)?;
                let foreign_key = d.foreign_key.clone().unwrap_or_else(|| parent.foreign_key());
                let local_key = d.local_key.clone().unwrap_or_else(|| parent.key_name().to_string());
                let ctx = RelationContext::new(db, name, parent.clone(), related);
                Relation::HasOneOrMany(HasOneOrMany::new(ctx, foreign_key, local_key, d.one))
            }
            RelationDecl::BelongsTo(d) => {
                let related = lookup(&d.related)?;
                let (foreign_key, owner_key) = d.keys(&related);
                let ctx = RelationContext::new(db, name, parent.clone(), related);
                Relation::BelongsTo(BelongsTo::new(ctx, foreign_key, owner_key))
            }
            RelationDecl::BelongsToMany(d) => {
                let related = lookup(&d.related)?;
                let pivot = &db.config().pivot;
                let table = d.table.clone().unwrap_or_else(|| {
                    let mut names = [parent.name().to_string(), related.name().to_string()];
                    names.sort();
                    names.join("_")
                });
                let keys = PivotKeys {
                    table,
                    foreign_pivot_key: d.foreign_pivot_key.clone().unwrap_or_else(|| parent.foreign_key()),
                    related_pivot_key: d.related_pivot_key.clone().unwrap_or_else(|| related.foreign_key()),
                    parent_key: d.parent_key.clone().unwrap_or_else(|| parent.key_name().to_string()),
                    related_key: d.related_key.clone().unwrap_or_else(|| related.key_name().to_string()),
                };
                let accessor = d.accessor.clone().unwrap_or_else(|| pivot.accessor.clone());
                let ctx = RelationContext::new(db, name, parent.clone(), related);

                let mut relation = BelongsToMany::new(ctx, keys, accessor).with_pivot(d.pivot_columns.clone());
                if let Some(using) = &d.using {
                    relation = relation.using(using);
                }
                if d.timestamps {
                    relation = relation.with_timestamps(&pivot.created_at, &pivot.updated_at);
                }
                Relation::BelongsToMany(relation)
            }
            RelationDecl::HasThrough(d) => {
                let far = lookup(&d.related)?;
                let intermediate = lookup(&d.through)?;
                let first_key = d.first_key.clone().unwrap_or_else(|| parent.foreign_key());
                let second_key = d.second_key.clone().unwrap_or_else(|| intermediate.foreign_key());
                let local_key = d.local_key.clone().unwrap_or_else(|| parent.key_name().to_string());
                let second_local_key = d
                    .second_local_key
                    .clone()
                    .unwrap_or_else(|| intermediate.key_name().to_string());

                let through = HasOneOrMany::new(
                    RelationContext::new(db, name, parent.clone(), intermediate.clone()),
                    first_key,
                    local_key,
                    false,
                );
                let has = HasOneOrMany::new(
                    RelationContext::new(db, name, intermediate, far.clone()),
                    second_key,
                    second_local_key,
                    false,
                );
                Relation::Through(ThroughChain::new(
                    RelationContext::new(db, name, parent.clone(), far),
                    Relation::HasOneOrMany(through),
                    Relation::HasOneOrMany(has),
                    d.one,
                ))
            }
            RelationDecl::Through(d) => {
                let through = Relation::resolve(db, parent, &d.through).map_err(|e| match e {
                    HybridError::RelationNotFound { .. } => {
                        HybridError::malformed(parent.name(), name, format!("unknown relation '{}'", d.through))
                    }
                    other => other,
                })?;
                let chain = ThroughChain::compose(db, name, parent.clone(), through, &d.has)?;
                Relation::Through(chain)
            }
        };

        Ok(match self.default_policy() {
            Some(policy) => relation.with_default(policy.clone()),
            None => relation,
        })
    }
}

impl HasDecl {
    fn new(related: &str, one: bool) -> Self {
        Self {
            related: related.to_string(),
            one,
            foreign_key: None,
            local_key: None,
            default: None,
        }
    }

    pub fn foreign_key(mut self, key: &str) -> Self {
        self.foreign_key = Some(key.to_string());
        self
    }

    pub fn local_key(mut self, key: &str) -> Self {
        self.local_key = Some(key.to_string());
        self
    }

    pub fn with_default(mut self, policy: DefaultModel) -> Self {
        self.default = Some(policy);
        self
    }
}

impl BelongsToDecl {
    pub fn foreign_key(mut self, key: &str) -> Self {
        self.foreign_key = Some(key.to_string());
        self
    }

    pub fn owner_key(mut self, key: &str) -> Self {
        self.owner_key = Some(key.to_string());
        self
    }

    pub fn with_default(mut self, policy: DefaultModel) -> Self {
        self.default = Some(policy);
        self
    }

    pub fn related(&self) -> &str {
        &self.related
    }

    /// (foreign key on the child, owner key on the related model)
    pub(crate) fn keys(&self, related: &ModelDef) -> (String, String) {
        (
            self.foreign_key.clone().unwrap_or_else(|| related.foreign_key()),
            self.owner_key.clone().unwrap_or_else(|| related.key_name().to_string()),
        )
    }
}

impl PivotDecl {
    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Pivot columns referencing the declaring and the related model
    pub fn pivot_keys(mut self, foreign_pivot_key: &str, related_pivot_key: &str) -> Self {
        self.foreign_pivot_key = Some(foreign_pivot_key.to_string());
        self.related_pivot_key = Some(related_pivot_key.to_string());
        self
    }

    pub fn parent_key(mut self, key: &str) -> Self {
        self.parent_key = Some(key.to_string());
        self
    }

    pub fn related_key(mut self, key: &str) -> Self {
        self.related_key = Some(key.to_string());
        self
    }

    pub fn with_pivot<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pivot_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Name the pivot is exposed under on each related model
    pub fn as_accessor(mut self, accessor: &str) -> Self {
        self.accessor = Some(accessor.to_string());
        self
    }

    /// Label the pivot model
    pub fn using(mut self, pivot_model: &str) -> Self {
        self.using = Some(pivot_model.to_string());
        self
    }
}

impl ThroughDecl {
    fn new(related: &str, through: &str, one: bool) -> Self {
        Self {
            related: related.to_string(),
            through: through.to_string(),
            one,
            first_key: None,
            second_key: None,
            local_key: None,
            second_local_key: None,
            default: None,
        }
    }

    /// Key on the intermediate model pointing at the declaring model
    pub fn first_key(mut self, key: &str) -> Self {
        self.first_key = Some(key.to_string());
        self
    }

    /// Key on the far model pointing at the intermediate model
    pub fn second_key(mut self, key: &str) -> Self {
        self.second_key = Some(key.to_string());
        self
    }

    pub fn local_key(mut self, key: &str) -> Self {
        self.local_key = Some(key.to_string());
        self
    }

    pub fn second_local_key(mut self, key: &str) -> Self {
        self.second_local_key = Some(key.to_string());
        self
    }

    pub fn with_default(mut self, policy: DefaultModel) -> Self {
        self.default = Some(policy);
        self
    }
}

impl PendingThroughDecl {
    pub fn has(self, relation: &str) -> FluentThroughDecl {
        FluentThroughDecl {
            through: self.through,
            has: relation.to_string(),
            default: None,
        }
    }
}

impl FluentThroughDecl {
    pub fn with_default(mut self, policy: DefaultModel) -> Self {
        self.default = Some(policy);
        self
    }
}

impl From<HasDecl> for RelationDecl {
    fn from(decl: HasDecl) -> Self {
        RelationDecl::Has(decl)
    }
}

impl From<BelongsToDecl> for RelationDecl {
    fn from(decl: BelongsToDecl) -> Self {
        RelationDecl::BelongsTo(decl)
    }
}

impl From<PivotDecl> for RelationDecl {
    fn from(decl: PivotDecl) -> Self {
        RelationDecl::BelongsToMany(decl)
    }
}

impl From<ThroughDecl> for RelationDecl {
    fn from(decl: ThroughDecl) -> Self {
        RelationDecl::HasThrough(decl)
    }
}

impl From<FluentThroughDecl> for RelationDecl {
    fn from(decl: FluentThroughDecl) -> Self {
        RelationDecl::Through(decl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new()
            .register(
                ModelDef::relational("mechanic", "mechanics")
                    .relation("cars", RelationDecl::has_many("car"))
                    .relation("car_owner", RelationDecl::through("cars").has("owner")),
            )
            .register(
                ModelDef::key_value("car", "cars")
                    .sub_keys(["mechanic_id"])
                    .relation("owner", RelationDecl::has_one("owner")),
            )
            .register(ModelDef::key_value("owner", "owners").sub_keys(["car_id"]))
    }

    #[test]
    fn test_valid_schema() {
        assert!(schema().validate().is_ok());
    }

    #[test]
    fn test_unknown_related_model_is_malformed() {
        let schema = schema().register(
            ModelDef::relational("garage", "garages").relation("bays", RelationDecl::has_many("bay")),
        );
        let err = schema.validate().unwrap_err();
        assert!(err.to_string().contains("garage::bays"));
    }

    #[test]
    fn test_fluent_through_requires_existing_relations() {
        let schema = schema().register(
            ModelDef::relational("shop", "shops")
                .relation("cars", RelationDecl::has_many("car"))
                .relation("car_driver", RelationDecl::through("cars").has("driver")),
        );
        assert!(matches!(
            schema.validate(),
            Err(HybridError::MalformedRelation { ref relation, .. }) if relation == "car_driver"
        ));
    }

    #[test]
    fn test_default_on_to_many_is_malformed() {
        let schema = schema().register(
            ModelDef::relational("fleet", "fleets")
                .relation("cars", RelationDecl::has_many("car").with_default(DefaultModel::Empty)),
        );
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_belongs_to_default_keys() {
        let related = ModelDef::key_value("customer", "customers");
        let (fk, owner) = RelationDecl::belongs_to("customer").keys(&related);
        assert_eq!(fk, "customer_id");
        assert_eq!(owner, "id");
    }
}
