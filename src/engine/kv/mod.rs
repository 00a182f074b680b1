//! Key-Value Engine
//!
//! Hash records addressed by composite physical keys:
//! - `store`: client contract and in-process store
//! - `key_scheme`: physical key format and pattern compiler
//! - `repository`: scan-based access path used by queries and relations

pub mod key_scheme;
pub mod repository;
pub mod store;

pub use key_scheme::{ConditionSession, KeyScheme};
pub use repository::Repository;
pub use store::{KeyValueStore, MemoryStore, Record, ScanPage, StoreError};
