//! The closed set of collections the engine reconciles.
//!
//! Each [`CollectionSpec`] carries everything the pipeline needs for one
//! content type: the source query, the field mapping consumed by the
//! projector, its dependency phase and the back-reference fields filled in
//! after all forward relations exist.
//!
//! | Phase | Collections | Depends on |
//! |-------|-------------|------------|
//! | 1 | category, material, location | — |
//! | 2 | creator | location |
//! | 3 | work | creator, category, material |
//! | reverse | creator.works | work |

use crate::models::CollectionKey;

/// How a source field is read and projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Localized plain text; sent in every locale.
    Text,
    /// Localized block content, converted to HTML; sent in every locale.
    RichText,
    /// Image with localized alt text; structural.
    Asset,
    /// Non-localized scalar; structural.
    Plain,
    /// Reference(s) to another collection; structural.
    Relation { target: CollectionKey, many: bool },
}

impl FieldKind {
    /// Whether the field varies by locale and is re-sent for the secondary locale.
    pub fn is_localized(&self) -> bool {
        matches!(self, FieldKind::Text | FieldKind::RichText)
    }
}

/// Mapping of one source field onto one destination field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub source: &'static str,
    pub destination: &'static str,
    pub kind: FieldKind,
}

/// A destination field holding the ids of records of `from` whose `via`
/// field points back at this record.
#[derive(Debug, Clone, Copy)]
pub struct BackReference {
    pub field: &'static str,
    pub from: CollectionKey,
    pub via: &'static str,
}

#[derive(Debug)]
pub struct CollectionSpec {
    pub key: CollectionKey,
    /// Document type in the source store.
    pub source_type: &'static str,
    /// Collection slug in the destination store, used to resolve its id.
    pub destination_slug: &'static str,
    pub phase: u8,
    /// Source field holding the record's display name.
    pub name_field: &'static str,
    pub fields: &'static [FieldSpec],
    pub back_references: &'static [BackReference],
}

const fn field(source: &'static str, destination: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        source,
        destination,
        kind,
    }
}

static SPECS: [CollectionSpec; 5] = [
    CollectionSpec {
        key: CollectionKey::Category,
        source_type: "category",
        destination_slug: "categories",
        phase: 1,
        name_field: "title",
        fields: &[
            field("title", "name", FieldKind::Text),
            field("description", "description", FieldKind::RichText),
            field("sortOrder", "sort-order", FieldKind::Plain),
        ],
        back_references: &[],
    },
    CollectionSpec {
        key: CollectionKey::Material,
        source_type: "material",
        destination_slug: "materials",
        phase: 1,
        name_field: "title",
        fields: &[
            field("title", "name", FieldKind::Text),
            field("sortOrder", "sort-order", FieldKind::Plain),
        ],
        back_references: &[],
    },
    CollectionSpec {
        key: CollectionKey::Location,
        source_type: "location",
        destination_slug: "locations",
        phase: 1,
        name_field: "title",
        fields: &[
            field("title", "name", FieldKind::Text),
            field("city", "city", FieldKind::Plain),
            field("address", "address", FieldKind::Plain),
            field("openingHours", "opening-hours", FieldKind::Text),
        ],
        back_references: &[],
    },
    CollectionSpec {
        key: CollectionKey::Creator,
        source_type: "creator",
        destination_slug: "creators",
        phase: 2,
        name_field: "name",
        fields: &[
            field("name", "name", FieldKind::Text),
            field("biography", "biography", FieldKind::RichText),
            field("portrait", "portrait", FieldKind::Asset),
            field("birthYear", "birth-year", FieldKind::Plain),
            field(
                "location",
                "location",
                FieldKind::Relation {
                    target: CollectionKey::Location,
                    many: false,
                },
            ),
        ],
        back_references: &[BackReference {
            field: "works",
            from: CollectionKey::Work,
            via: "creator",
        }],
    },
    CollectionSpec {
        key: CollectionKey::Work,
        source_type: "artwork",
        destination_slug: "works",
        phase: 3,
        name_field: "title",
        fields: &[
            field("title", "name", FieldKind::Text),
            field("description", "description", FieldKind::RichText),
            field("image", "main-image", FieldKind::Asset),
            field("year", "year", FieldKind::Plain),
            field("dimensions", "dimensions", FieldKind::Plain),
            field("sortOrder", "sort-order", FieldKind::Plain),
            field(
                "creator",
                "creator",
                FieldKind::Relation {
                    target: CollectionKey::Creator,
                    many: false,
                },
            ),
            field(
                "categories",
                "categories",
                FieldKind::Relation {
                    target: CollectionKey::Category,
                    many: true,
                },
            ),
            field(
                "materials",
                "materials",
                FieldKind::Relation {
                    target: CollectionKey::Material,
                    many: true,
                },
            ),
        ],
        back_references: &[],
    },
];

/// All collection specs, in phase order.
pub fn all() -> &'static [CollectionSpec] {
    &SPECS
}

pub fn spec(key: CollectionKey) -> &'static CollectionSpec {
    SPECS
        .iter()
        .find(|s| s.key == key)
        .unwrap_or_else(|| unreachable!("every collection key has a spec"))
}

/// Specs grouped by phase, ascending.
pub fn phases() -> Vec<(u8, Vec<&'static CollectionSpec>)> {
    let mut phases: Vec<(u8, Vec<&'static CollectionSpec>)> = Vec::new();
    let mut ordered: Vec<&'static CollectionSpec> = SPECS.iter().collect();
    ordered.sort_by_key(|s| s.phase);
    for spec in ordered {
        match phases.last_mut() {
            Some((phase, members)) if *phase == spec.phase => members.push(spec),
            _ => phases.push((spec.phase, vec![spec])),
        }
    }
    phases
}

/// Which source records a query returns.
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    pub limit: Option<usize>,
    pub source_id: Option<String>,
}

impl CollectionSpec {
    pub fn field(&self, source: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.source == source)
    }

    /// Relation targets, i.e. the collections that must be reconciled first.
    pub fn dependencies(&self) -> Vec<CollectionKey> {
        let mut deps: Vec<CollectionKey> = self
            .fields
            .iter()
            .filter_map(|f| match f.kind {
                FieldKind::Relation { target, .. } => Some(target),
                _ => None,
            })
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Source store query selecting this collection's published documents.
    ///
    /// The single-record filter is bound as the `$id` parameter.
    pub fn query(&self, scope: &QueryScope) -> String {
        let mut filter = format!(
            "_type == \"{}\" && !(_id in path(\"drafts.**\"))",
            self.source_type
        );
        if scope.source_id.is_some() {
            filter.push_str(" && _id == $id");
        }

        let mut projection = vec![
            "_id".to_string(),
            "_updatedAt".to_string(),
            "\"slug\": slug.current".to_string(),
        ];
        for f in self.fields {
            projection.push(match f.kind {
                FieldKind::Asset => format!(
                    "\"{0}\": {0}{{ \"url\": asset->url, alt }}",
                    f.source
                ),
                FieldKind::Relation { many: true, .. } => {
                    format!("\"{0}\": {0}[]._ref", f.source)
                }
                FieldKind::Relation { many: false, .. } => {
                    format!("\"{0}\": {0}._ref", f.source)
                }
                _ => f.source.to_string(),
            });
        }

        let slice = match scope.limit {
            Some(n) => format!("[0...{}]", n),
            None => String::new(),
        };

        format!(
            "*[{}] | order(_createdAt asc){} {{ {} }}",
            filter,
            slice,
            projection.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_has_exactly_one_spec() {
        for key in CollectionKey::ALL {
            assert_eq!(all().iter().filter(|s| s.key == key).count(), 1);
            assert_eq!(spec(key).key, key);
        }
    }

    #[test]
    fn dependencies_live_in_earlier_phases() {
        for s in all() {
            for dep in s.dependencies() {
                assert!(
                    spec(dep).phase < s.phase,
                    "{} depends on {} in a later phase",
                    s.key,
                    dep
                );
            }
            for back in s.back_references {
                assert!(spec(back.from).phase > s.phase);
            }
        }
    }

    #[test]
    fn phases_are_ascending_and_complete() {
        let phases = phases();
        assert_eq!(
            phases.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let total: usize = phases.iter().map(|(_, m)| m.len()).sum();
        assert_eq!(total, CollectionKey::ALL.len());
    }

    #[test]
    fn query_respects_scope() {
        let work = spec(CollectionKey::Work);
        let full = work.query(&QueryScope::default());
        assert!(full.starts_with("*[_type == \"artwork\""));
        assert!(full.contains("\"creator\": creator._ref"));
        assert!(full.contains("\"materials\": materials[]._ref"));
        assert!(full.contains("\"image\": image{ \"url\": asset->url, alt }"));
        assert!(!full.contains("$id"));

        let single = work.query(&QueryScope {
            limit: Some(5),
            source_id: Some("w1".into()),
        });
        assert!(single.contains("_id == $id"));
        assert!(single.contains("[0...5]"));
    }

    #[test]
    fn every_spec_projects_a_name() {
        for s in all() {
            let name = s.field(s.name_field).expect("name field declared");
            assert_eq!(name.destination, "name");
            assert!(name.kind.is_localized());
        }
    }
}
