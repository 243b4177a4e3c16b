//! Core data models used throughout the engine.
//!
//! These types represent the source records read from the content store,
//! the destination records held by the collection store, and the field
//! projections that flow between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field data sent to or read from the destination store.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// The closed set of content types the engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKey {
    Category,
    Material,
    Location,
    Creator,
    Work,
}

impl CollectionKey {
    pub const ALL: [CollectionKey; 5] = [
        CollectionKey::Category,
        CollectionKey::Material,
        CollectionKey::Location,
        CollectionKey::Creator,
        CollectionKey::Work,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKey::Category => "category",
            CollectionKey::Material => "material",
            CollectionKey::Location => "location",
            CollectionKey::Creator => "creator",
            CollectionKey::Work => "work",
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown collection '{}'. Available: category, material, location, creator, work",
                    s
                )
            })
    }
}

/// The two locale slots of the destination store.
///
/// Resolved once at the destination boundary from the store's own locale
/// identifiers; nothing past that boundary compares locale strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locale {
    Primary,
    Secondary,
}

impl Locale {
    pub fn other(&self) -> Locale {
        match self {
            Locale::Primary => Locale::Secondary,
            Locale::Secondary => Locale::Primary,
        }
    }
}

/// A value with an optional variant per locale.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Localized<T> {
    pub primary: Option<T>,
    pub secondary: Option<T>,
}

impl<T> Localized<T> {
    pub fn new(primary: Option<T>, secondary: Option<T>) -> Self {
        Self { primary, secondary }
    }

    /// The value for `locale`, falling back to the other locale.
    pub fn get(&self, locale: Locale) -> Option<&T> {
        let (want, fallback) = match locale {
            Locale::Primary => (&self.primary, &self.secondary),
            Locale::Secondary => (&self.secondary, &self.primary),
        };
        want.as_ref().or(fallback.as_ref())
    }
}

impl Localized<String> {
    /// Same text in both locales.
    pub fn both(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            primary: Some(text.clone()),
            secondary: Some(text),
        }
    }
}

/// A span inside a rich-text block.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct Span {
    #[serde(rename = "_type", default = "default_span_type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub marks: Vec<String>,
}

fn default_span_type() -> String {
    "span".to_string()
}

/// Annotation referenced from a span's marks (e.g. a link).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MarkDef {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(default)]
    pub href: Option<String>,
}

/// One block of the source store's structured text.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Block {
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(rename = "listItem", default)]
    pub list_item: Option<String>,
    #[serde(default)]
    pub children: Vec<Span>,
    #[serde(rename = "markDefs", default)]
    pub mark_defs: Vec<MarkDef>,
}

impl Block {
    /// A plain `normal` paragraph with a single unmarked span.
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self {
            kind: "block".to_string(),
            style: Some("normal".to_string()),
            list_item: None,
            children: vec![Span {
                kind: "span".to_string(),
                text: text.into(),
                marks: Vec::new(),
            }],
            mark_defs: Vec::new(),
        }
    }
}

/// An embedded asset. The URL is the asset's locator.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub url: String,
    pub alt: Localized<String>,
}

/// A single source field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Localized plain text.
    Text(Localized<String>),
    /// Localized structured text.
    RichText(Localized<Vec<Block>>),
    /// Embedded image or file.
    Asset(Asset),
    /// Non-localized scalar (numbers, dates, ordering keys, flags).
    Plain(serde_json::Value),
    /// Reference(s) to records of another collection, by source id.
    Relation {
        target: CollectionKey,
        ids: Vec<String>,
        many: bool,
    },
}

/// One unit of content read from the source store.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub source_id: String,
    pub collection: CollectionKey,
    pub slug: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl SourceRecord {
    pub fn new(collection: CollectionKey, source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            collection,
            slug: None,
            updated_at: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Localized text of a field, if the field is text.
    pub fn text(&self, field: &str, locale: Locale) -> Option<&str> {
        match self.fields.get(field) {
            Some(FieldValue::Text(t)) => t.get(locale).map(String::as_str),
            _ => None,
        }
    }
}

/// An item held by the destination store.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationRecord {
    pub id: String,
    pub is_draft: bool,
    pub field_data: FieldMap,
}

impl DestinationRecord {
    pub fn slug(&self) -> Option<&str> {
        self.field_data.get("slug").and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.field_data.get("name").and_then(|v| v.as_str())
    }
}
