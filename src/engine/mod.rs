// Hybrid engine - core module structure
pub mod adapter;
pub mod config;
pub mod error;
pub mod hybrid;
pub mod kv;
pub mod logging;
pub mod model;
pub mod query;
pub mod relations;

pub use config::HybridConfig;
pub use error::{HybridError, Result};
pub use hybrid::HybridDb;
