//! Key-value repository
//!
//! Pattern lookup, cursor scanning, bulk fetch, counting and deletion over a
//! `KeyValueStore`. No caching: every call is a store round trip.

use std::sync::Arc;
use tracing::debug;

use super::store::{KeyValueStore, Record};
use crate::engine::error::{HybridError, Result};

#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn KeyValueStore>,
    count_batch_size: usize,
}

impl Repository {
    pub fn new(store: Arc<dyn KeyValueStore>, count_batch_size: usize) -> Self {
        Self {
            store,
            count_batch_size: count_batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Every key currently matching `pattern`
    pub fn get_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let keys = self.store.keys(pattern)?;
        debug!(pattern, matched = keys.len(), "get by pattern");
        Ok(keys)
    }

    /// Walk the keyspace with a cursor, handing each non-empty page of
    /// matching keys to `on_batch`. Stops at the first callback error.
    pub fn scan_by_pattern<F>(&self, pattern: &str, batch_size: usize, mut on_batch: F) -> Result<()>
    where
        F: FnMut(Vec<String>) -> Result<()>,
    {
        if batch_size < 1 {
            return Err(HybridError::InvalidBatchSize);
        }

        let mut cursor: Option<String> = None;
        loop {
            let page = self.store.scan(cursor.as_deref(), pattern, batch_size)?;
            debug!(pattern, keys = page.keys.len(), done = page.cursor.is_none(), "scan page");
            if !page.keys.is_empty() {
                on_batch(page.keys)?;
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Bulk read; keys without data are left out. Input order is kept.
    pub fn fetch_by_keys(&self, keys: &[String]) -> Result<Vec<(String, Record)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.store.get_many(keys)?;
        Ok(keys
            .iter()
            .zip(records)
            .filter_map(|(key, record)| record.map(|r| (key.clone(), r)))
            .collect())
    }

    pub fn fetch_by_pattern(&self, pattern: &str) -> Result<Vec<(String, Record)>> {
        let keys = self.get_by_pattern(pattern)?;
        self.fetch_by_keys(&keys)
    }

    /// Count matches without fetching any record
    pub fn count_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut total = 0u64;
        self.scan_by_pattern(pattern, self.count_batch_size, |keys| {
            total += keys.len() as u64;
            Ok(())
        })?;
        debug!(pattern, total, "count by pattern");
        Ok(total)
    }

    /// Returns whether anything was removed. Absent keys are not an error.
    pub fn destroy_by_keys(&self, keys: &[String]) -> Result<bool> {
        if keys.is_empty() {
            return Ok(false);
        }
        let removed = self.store.delete(keys)?;
        debug!(requested = keys.len(), removed, "destroy by keys");
        Ok(removed > 0)
    }

    pub fn save(&self, key: &str, record: &Record) -> Result<()> {
        self.store.put(key, record)?;
        Ok(())
    }
}
