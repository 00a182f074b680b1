//! Key-value store client contract
//!
//! Records are flat string hashes addressed by physical key. The client
//! exposes the primitives a Redis-like store offers: glob `KEYS`,
//! cursor-based `SCAN`, pipelined `HGETALL`, `HSET` and `DEL`.

use regex::Regex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;
use thiserror::Error;

/// One stored hash
pub type Record = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,

    #[error("invalid key pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("connection error: {0}")]
    Connection(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One page of a cursor scan. `cursor == None` means the scan is complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
}

pub trait KeyValueStore: Send + Sync {
    /// All keys matching `pattern` in one response
    fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Examine up to `count` keys after `cursor`, returning those matching `pattern`
    fn scan(&self, cursor: Option<&str>, pattern: &str, count: usize) -> StoreResult<ScanPage>;

    /// Bulk `HGETALL`; missing or empty hashes come back as `None`
    fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Record>>>;

    /// Replace the hash at `key`
    fn put(&self, key: &str, record: &Record) -> StoreResult<()>;

    /// Remove keys, returning how many existed
    fn delete(&self, keys: &[String]) -> StoreResult<u64>;
}

/// A compiled glob: `*` any run, `?` one char, `\x` literal `x`.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Regex,
    prefix: String,
}

impl GlobPattern {
    pub fn compile(pattern: &str) -> StoreResult<Self> {
        let mut source = String::with_capacity(pattern.len() + 8);
        let mut prefix = String::new();
        let mut literal = true;
        let mut chars = pattern.chars();

        source.push('^');
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    literal = false;
                    source.push_str(".*");
                }
                '?' => {
                    literal = false;
                    source.push('.');
                }
                '\\' => {
                    let escaped = chars.next().unwrap_or('\\');
                    if literal {
                        prefix.push(escaped);
                    }
                    source.push_str(&regex::escape(&escaped.to_string()));
                }
                other => {
                    if literal {
                        prefix.push(other);
                    }
                    source.push_str(&regex::escape(&other.to_string()));
                }
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|source| StoreError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex, prefix })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The leading run of literal characters
    pub fn literal_prefix(&self) -> &str {
        &self.prefix
    }
}

/// In-process store over an ordered map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.data.read().map_err(|_| StoreError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl KeyValueStore for MemoryStore {
    fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let glob = GlobPattern::compile(pattern)?;
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        let prefix = glob.literal_prefix();

        Ok(data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| glob.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn scan(&self, cursor: Option<&str>, pattern: &str, count: usize) -> StoreResult<ScanPage> {
        let glob = GlobPattern::compile(pattern)?;
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        let prefix = glob.literal_prefix();
        let count = count.max(1);

        let lower = match cursor {
            Some(after) => Bound::Excluded(after),
            None => Bound::Included(prefix),
        };
        let mut range = data
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix));

        let mut page = ScanPage::default();
        let mut examined = 0;
        let mut last: Option<&String> = None;
        for (key, _) in range.by_ref() {
            examined += 1;
            if glob.matches(key) {
                page.keys.push(key.clone());
            }
            last = Some(key);
            if examined == count {
                break;
            }
        }

        if examined == count && range.next().is_some() {
            page.cursor = last.cloned();
        }
        Ok(page)
    }

    fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Record>>> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(keys
            .iter()
            .map(|key| data.get(key).filter(|record| !record.is_empty()).cloned())
            .collect())
    }

    fn put(&self, key: &str, record: &Record) -> StoreResult<()> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        data.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        Ok(keys.iter().filter(|key| data.remove(key.as_str()).is_some()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .put(&format!("tickets:id:{}:customer_id:{}", i, i % 3), &record(&[("id", "x")]))
                .unwrap();
        }
        store.put("tickets_archive:id:1", &record(&[("id", "1")])).unwrap();
        store.put("customers:id:1", &record(&[("id", "1")])).unwrap();
        store
    }

    #[test]
    fn test_glob_pattern() {
        let glob = GlobPattern::compile("users:id:*:email:a?c").unwrap();
        assert_eq!(glob.literal_prefix(), "users:id:");
        assert!(glob.matches("users:id:7:email:abc"));
        assert!(!glob.matches("users:id:7:email:abcd"));

        let escaped = GlobPattern::compile(r"a\*b").unwrap();
        assert!(escaped.matches("a*b"));
        assert!(!escaped.matches("axb"));
        assert_eq!(escaped.literal_prefix(), "a*b");
    }

    #[test]
    fn test_keys_stays_inside_collection() {
        let store = seeded();
        let keys = store.keys("tickets:*").unwrap();
        assert_eq!(keys.len(), 25);
        assert!(keys.iter().all(|k| k.starts_with("tickets:")));
    }

    #[test]
    fn test_scan_visits_every_match_once() {
        let store = seeded();
        let mut cursor: Option<String> = None;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = store
                .scan(cursor.as_deref(), "tickets:id:*:customer_id:1", 4)
                .unwrap();
            pages += 1;
            seen.extend(page.keys);
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }
        assert!(pages > 1);
        assert_eq!(seen.len(), 8);
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), seen.len());
    }

    #[test]
    fn test_get_many_skips_missing() {
        let store = seeded();
        let found = store
            .get_many(&["customers:id:1".to_string(), "customers:id:404".to_string()])
            .unwrap();
        assert!(found[0].is_some());
        assert!(found[1].is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = seeded();
        let keys = vec!["customers:id:1".to_string()];
        assert_eq!(store.delete(&keys).unwrap(), 1);
        assert_eq!(store.delete(&keys).unwrap(), 0);
        assert_eq!(store.len().unwrap(), 26);
    }
}
