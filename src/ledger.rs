//! Content hash ledger.
//!
//! Records, per `(collection, sourceId)`, a digest of the primary-locale
//! projection that was last written to the destination. A matching digest
//! means the destination already holds that content and no write is issued.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::mapping::{flat_key, split_flat_key};
use crate::models::{CollectionKey, FieldMap};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HashLedger {
    entries: HashMap<(CollectionKey, String), String>,
}

impl HashLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: CollectionKey, source_id: &str) -> Option<&str> {
        self.entries
            .get(&(collection, source_id.to_string()))
            .map(String::as_str)
    }

    pub fn set(&mut self, collection: CollectionKey, source_id: &str, hash: String) {
        self.entries.insert((collection, source_id.to_string()), hash);
    }

    pub fn delete(&mut self, collection: CollectionKey, source_id: &str) -> Option<String> {
        self.entries.remove(&(collection, source_id.to_string()))
    }

    pub fn count(&self, collection: CollectionKey) -> usize {
        self.entries.keys().filter(|(c, _)| *c == collection).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear_collection(&mut self, collection: CollectionKey) {
        self.entries.retain(|(c, _), _| *c != collection);
    }

    /// Whether `hash` equals the recorded digest for the record.
    pub fn matches(&self, collection: CollectionKey, source_id: &str, hash: &str) -> bool {
        self.get(collection, source_id) == Some(hash)
    }

    pub fn to_json(&self) -> String {
        let flat: BTreeMap<String, &String> = self
            .entries
            .iter()
            .map(|((c, s), h)| (flat_key(*c, s), h))
            .collect();
        serde_json::to_string(&flat).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the persisted form. Unreadable input yields an empty ledger.
    pub fn from_json(raw: Option<&str>) -> Self {
        let flat = match raw.map(serde_json::from_str::<BTreeMap<String, String>>) {
            None => return Self::new(),
            Some(Ok(flat)) => flat,
            Some(Err(e)) => {
                warn!(error = %e, "hash ledger unreadable, starting empty");
                return Self::new();
            }
        };

        let mut ledger = Self::new();
        for (key, hash) in flat {
            if let Some((collection, source_id)) = split_flat_key(&key) {
                ledger.set(collection, source_id, hash);
            }
        }
        ledger
    }
}

/// Stable 128-bit digest of a field projection, as lowercase hex.
///
/// Object keys are sorted at every depth before hashing, so insertion order
/// never changes the digest. Array order is significant.
pub fn content_hash(fields: &FieldMap) -> String {
    let mut canonical = String::new();
    write_canonical_object(fields, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

fn write_canonical_object(map: &serde_json::Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String((*key).clone()).to_string());
        out.push(':');
        write_canonical(&map[key.as_str()], out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
