//! Hybrid Model Error Types
//!
//! Transport errors from either store are wrapped, never rewritten.
//! Absence of a record is not an error anywhere in the engine.

use thiserror::Error;

use super::adapter::AdapterError;
use super::config::ConfigError;
use super::kv::StoreError;

#[derive(Error, Debug)]
pub enum HybridError {
    #[error("Relational store error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Key-value store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model not registered: {0}")]
    UnknownModel(String),

    #[error("Call to undefined relationship [{relation}] on model [{model}]")]
    RelationNotFound { model: String, relation: String },

    #[error("{model}::{relation} must return a relationship instance: {reason}")]
    MalformedRelation {
        model: String,
        relation: String,
        reason: String,
    },

    #[error("Scan batch size must be at least 1")]
    InvalidBatchSize,

    #[error("Record already exists: {0}")]
    DuplicateKey(String),

    #[error("Missing attribute '{attribute}' on model [{model}]")]
    MissingAttribute { model: String, attribute: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl HybridError {
    pub(crate) fn malformed(model: &str, relation: &str, reason: impl Into<String>) -> Self {
        HybridError::MalformedRelation {
            model: model.to_string(),
            relation: relation.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn relation_not_found(model: &str, relation: &str) -> Self {
        HybridError::RelationNotFound {
            model: model.to_string(),
            relation: relation.to_string(),
        }
    }

    /// True for failures raised by either backing store.
    pub fn is_transport(&self) -> bool {
        matches!(self, HybridError::Adapter(_) | HybridError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, HybridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_relation_names_declaring_method() {
        let err = HybridError::malformed("mechanic", "car_owner", "unknown model 'owner'");
        let message = err.to_string();
        assert!(message.contains("mechanic::car_owner"));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_store_errors_are_transport() {
        let err: HybridError = StoreError::Poisoned.into();
        assert!(err.is_transport());
    }
}
