//! Hybrid model storage
//!
//! Models live either in a relational database (SQLite) or in a key-value
//! store of hash records addressed by composite keys. Relations between them
//! resolve the same way whatever the pairing, lazily per owner or eagerly for
//! a batch of owners.

pub mod engine;

pub use engine::config::HybridConfig;
pub use engine::error::{HybridError, Result};
pub use engine::hybrid::HybridDb;
pub use engine::kv::{KeyScheme, KeyValueStore, MemoryStore, Repository};
pub use engine::model::{CastKind, Model, ModelDef, RelationValue, Schema, StorageBackend};
pub use engine::query::{where_belongs_to, ModelQuery, RelationQueryable};
pub use engine::relations::{DefaultModel, Relation, RelationDecl, RelationKind};
