//! Key scheme and pattern compiler
//!
//! A physical key is `<collection>:<key1>:<value1>:<key2>:<value2>...` where
//! the key list is the primary key followed by the declared sub-keys.
//! Unbound attributes compile to `*`. Values are percent-escaped so a bound
//! value can never introduce a delimiter or a glob metacharacter.

use std::collections::BTreeMap;

pub const DELIMITER: char = ':';
pub const WILDCARD: &str = "*";

/// Attribute bindings accumulated by `where` calls; last write wins
pub type ConditionSession = BTreeMap<String, String>;

const RESERVED: &[char] = &['%', ':', '*', '?', '[', ']', '\\'];

/// Escape a value for embedding in a key segment
pub fn encode_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if RESERVED.contains(&c) || c.is_control() || c == ' ' {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Inverse of `encode_segment`; malformed escapes are kept verbatim
pub fn decode_segment(segment: &str) -> String {
    fn hex(byte: u8) -> Option<u8> {
        (byte as char).to_digit(16).map(|d| d as u8)
    }

    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScheme {
    collection: String,
    keys: Vec<String>,
}

impl KeyScheme {
    pub fn new<I, S>(collection: &str, primary_key: &str, sub_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys = vec![primary_key.to_string()];
        for sub_key in sub_keys {
            let sub_key = sub_key.into();
            if !keys.contains(&sub_key) {
                keys.push(sub_key);
            }
        }
        Self {
            collection: collection.to_string(),
            keys,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Primary key followed by sub-keys
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn primary_key(&self) -> &str {
        &self.keys[0]
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.keys.iter().any(|k| k == attribute)
    }

    /// Compile a condition session into a scan pattern
    pub fn compile(&self, conditions: &ConditionSession) -> String {
        self.render(|key| conditions.get(key).map(String::as_str))
    }

    /// The physical key for a record's stored attribute strings
    pub fn physical_key(&self, attributes: &BTreeMap<String, String>) -> String {
        self.render(|key| attributes.get(key).map(String::as_str))
    }

    fn render<'a, F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut out = encode_segment(&self.collection);
        for key in &self.keys {
            out.push(DELIMITER);
            out.push_str(&encode_segment(key));
            out.push(DELIMITER);
            match lookup(key) {
                Some(value) => out.push_str(&encode_segment(value)),
                None => out.push_str(WILDCARD),
            }
        }
        out
    }

    /// Recover key-scheme bindings from a physical key. Wildcard segments are skipped.
    pub fn parse(&self, physical_key: &str) -> Option<BTreeMap<String, String>> {
        let mut segments = physical_key.split(DELIMITER);
        if segments.next()? != encode_segment(&self.collection) {
            return None;
        }

        let mut bindings = BTreeMap::new();
        for key in &self.keys {
            if segments.next()? != encode_segment(key) {
                return None;
            }
            let value = segments.next()?;
            if value != WILDCARD {
                bindings.insert(key.clone(), decode_segment(value));
            }
        }
        if segments.next().is_some() {
            return None;
        }
        Some(bindings)
    }
}
