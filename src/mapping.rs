//! Identity mapping store.
//!
//! Bidirectional association between a source record's stable id and the
//! destination record's id, partitioned by collection. Persisted as a flat
//! JSON object whose keys are `collection:sourceId`.
//!
//! Within one collection a source id maps to at most one destination id and
//! a destination id is claimed by at most one source id; [`IdentityMap::set`]
//! drops whatever binding it displaces on either side.

use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::models::{CollectionKey, DestinationRecord};
use crate::projector::slugify;

type Key = (CollectionKey, String);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IdentityMap {
    forward: HashMap<Key, String>,
    reverse: HashMap<Key, String>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: CollectionKey, source_id: &str) -> Option<&str> {
        self.forward
            .get(&(collection, source_id.to_string()))
            .map(String::as_str)
    }

    /// The source id bound to `destination_id`, if any.
    pub fn source_for(&self, collection: CollectionKey, destination_id: &str) -> Option<&str> {
        self.reverse
            .get(&(collection, destination_id.to_string()))
            .map(String::as_str)
    }

    pub fn set(&mut self, collection: CollectionKey, source_id: &str, destination_id: &str) {
        self.delete(collection, source_id);
        if let Some(previous_source) = self
            .reverse
            .remove(&(collection, destination_id.to_string()))
        {
            self.forward.remove(&(collection, previous_source));
        }
        self.forward.insert(
            (collection, source_id.to_string()),
            destination_id.to_string(),
        );
        self.reverse.insert(
            (collection, destination_id.to_string()),
            source_id.to_string(),
        );
    }

    /// Remove the mapping for `source_id`, returning the destination id it held.
    pub fn delete(&mut self, collection: CollectionKey, source_id: &str) -> Option<String> {
        let destination_id = self.forward.remove(&(collection, source_id.to_string()))?;
        self.reverse.remove(&(collection, destination_id.clone()));
        Some(destination_id)
    }

    pub fn count(&self, collection: CollectionKey) -> usize {
        self.forward.keys().filter(|(c, _)| *c == collection).count()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Drop every mapping of one collection.
    pub fn clear_collection(&mut self, collection: CollectionKey) {
        self.forward.retain(|(c, _), _| *c != collection);
        self.reverse.retain(|(c, _), _| *c != collection);
    }

    /// `(source_id, destination_id)` pairs of one collection, sorted by source id.
    pub fn entries(&self, collection: CollectionKey) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .forward
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|((_, s), d)| (s.as_str(), d.as_str()))
            .collect();
        entries.sort();
        entries
    }

    pub fn to_flat(&self) -> BTreeMap<String, String> {
        self.forward
            .iter()
            .map(|((c, s), d)| (flat_key(*c, s), d.clone()))
            .collect()
    }

    pub fn from_flat(flat: BTreeMap<String, String>) -> Self {
        let mut map = Self::new();
        for (key, destination_id) in flat {
            match split_flat_key(&key) {
                Some((collection, source_id)) => map.set(collection, source_id, &destination_id),
                None => warn!(key = %key, "ignoring identity mapping with unknown collection"),
            }
        }
        map
    }

    /// Parse the persisted form. Unreadable input yields an empty map.
    pub fn from_json(raw: Option<&str>) -> Self {
        match raw.map(serde_json::from_str::<BTreeMap<String, String>>) {
            None => Self::new(),
            Some(Ok(flat)) => Self::from_flat(flat),
            Some(Err(e)) => {
                warn!(error = %e, "identity mappings unreadable, starting empty");
                Self::new()
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_flat()).unwrap_or_else(|_| "{}".to_string())
    }
}

pub(crate) fn flat_key(collection: CollectionKey, source_id: &str) -> String {
    format!("{}:{}", collection.as_str(), source_id)
}

pub(crate) fn split_flat_key(key: &str) -> Option<(CollectionKey, &str)> {
    let (collection, source_id) = key.split_once(':')?;
    let collection = collection.parse().ok()?;
    if source_id.is_empty() {
        return None;
    }
    Some((collection, source_id))
}

/// What the rebuild needs to know about a source record.
#[derive(Debug, Clone)]
pub struct RebuildCandidate<'a> {
    pub source_id: &'a str,
    pub slug: Option<&'a str>,
    pub name: Option<&'a str>,
}

/// Reconstruct mappings for one collection from the destination listing.
///
/// Each destination record is matched against the unmatched source records
/// by slug equality, then name equality, then the slug generated from the
/// source name. First match wins. Returns the number of mappings created.
pub fn rebuild_from_destination(
    map: &mut IdentityMap,
    collection: CollectionKey,
    candidates: &[RebuildCandidate<'_>],
    destination: &[DestinationRecord],
) -> usize {
    let mut taken = vec![false; candidates.len()];
    let mut created = 0;

    for record in destination {
        let slug = record.slug();
        let name = record.name();

        let by_slug = |c: &RebuildCandidate<'_>| slug.is_some() && c.slug == slug;
        let by_name = |c: &RebuildCandidate<'_>| name.is_some() && c.name == name;
        let by_generated = |c: &RebuildCandidate<'_>| match (slug, c.name) {
            (Some(s), Some(n)) => slugify(n) == s,
            _ => false,
        };
        let tiers: [&dyn Fn(&RebuildCandidate<'_>) -> bool; 3] =
            [&by_slug, &by_name, &by_generated];

        let hit = tiers.iter().find_map(|matches| {
            candidates
                .iter()
                .enumerate()
                .find(|&(i, c)| !taken[i] && matches(c))
                .map(|(i, _)| i)
        });

        if let Some(i) = hit {
            taken[i] = true;
            map.set(collection, candidates[i].source_id, &record.id);
            created += 1;
        }
    }

    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dest(id: &str, slug: &str, name: &str) -> DestinationRecord {
        let mut field_data = serde_json::Map::new();
        field_data.insert("slug".into(), json!(slug));
        field_data.insert("name".into(), json!(name));
        DestinationRecord {
            id: id.to_string(),
            is_draft: false,
            field_data,
        }
    }

    #[test]
    fn set_keeps_one_mapping_per_source() {
        let mut map = IdentityMap::new();
        map.set(CollectionKey::Work, "s1", "d1");
        map.set(CollectionKey::Work, "s1", "d2");
        assert_eq!(map.get(CollectionKey::Work, "s1"), Some("d2"));
        assert_eq!(map.source_for(CollectionKey::Work, "d1"), None);
        assert_eq!(map.count(CollectionKey::Work), 1);
    }

    #[test]
    fn set_steals_destination_from_previous_source() {
        let mut map = IdentityMap::new();
        map.set(CollectionKey::Work, "s1", "d1");
        map.set(CollectionKey::Work, "s2", "d1");
        assert_eq!(map.get(CollectionKey::Work, "s1"), None);
        assert_eq!(map.source_for(CollectionKey::Work, "d1"), Some("s2"));
    }

    #[test]
    fn collections_are_partitioned() {
        let mut map = IdentityMap::new();
        map.set(CollectionKey::Work, "x", "d1");
        map.set(CollectionKey::Creator, "x", "d9");
        assert_eq!(map.get(CollectionKey::Work, "x"), Some("d1"));
        assert_eq!(map.get(CollectionKey::Creator, "x"), Some("d9"));
        map.clear_collection(CollectionKey::Work);
        assert_eq!(map.get(CollectionKey::Work, "x"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn flat_form_uses_prefixed_keys() {
        let mut map = IdentityMap::new();
        map.set(CollectionKey::Creator, "abc:def", "d1");
        let json = map.to_json();
        assert_eq!(json, r#"{"creator:abc:def":"d1"}"#);
        let restored = IdentityMap::from_json(Some(&json));
        assert_eq!(restored, map);
    }

    #[test]
    fn corrupt_json_starts_empty() {
        assert!(IdentityMap::from_json(Some("{not json")).is_empty());
        assert!(IdentityMap::from_json(None).is_empty());
        let unknown = IdentityMap::from_json(Some(r#"{"artwork:1":"d","work:2":"e"}"#));
        assert_eq!(unknown.len(), 1);
    }

    #[test]
    fn rebuild_prefers_slug_then_name_then_generated_slug() {
        let candidates = vec![
            RebuildCandidate {
                source_id: "a",
                slug: Some("sunrise"),
                name: Some("Sunrise"),
            },
            RebuildCandidate {
                source_id: "b",
                slug: None,
                name: Some("Blue Hour"),
            },
            RebuildCandidate {
                source_id: "c",
                slug: None,
                name: Some("Über Land"),
            },
        ];
        let destination = vec![
            dest("d-a", "sunrise", "Something Else"),
            dest("d-b", "custom-slug", "Blue Hour"),
            dest("d-c", "ueber-land", "Renamed"),
            dest("d-x", "nothing", "Nobody"),
        ];

        let mut map = IdentityMap::new();
        let created =
            rebuild_from_destination(&mut map, CollectionKey::Work, &candidates, &destination);

        assert_eq!(created, 3);
        assert_eq!(map.get(CollectionKey::Work, "a"), Some("d-a"));
        assert_eq!(map.get(CollectionKey::Work, "b"), Some("d-b"));
        assert_eq!(map.get(CollectionKey::Work, "c"), Some("d-c"));
        assert_eq!(map.source_for(CollectionKey::Work, "d-x"), None);
    }

    #[test]
    fn rebuild_matches_each_source_once() {
        let candidates = vec![RebuildCandidate {
            source_id: "a",
            slug: Some("dup"),
            name: None,
        }];
        let destination = vec![dest("d1", "dup", "x"), dest("d2", "dup", "y")];
        let mut map = IdentityMap::new();
        let created =
            rebuild_from_destination(&mut map, CollectionKey::Work, &candidates, &destination);
        assert_eq!(created, 1);
        assert_eq!(map.get(CollectionKey::Work, "a"), Some("d1"));
    }
}
