//! Locale projector.
//!
//! Turns a [`SourceRecord`] into the destination field map for one locale.
//! Projection never fails on missing localized content: a missing locale
//! falls back to the other locale, then to an empty default.
//!
//! - **Primary** projections carry structural fields (slug, plain values,
//!   relation ids, assets) and localized text.
//! - **Secondary** projections carry localized text only, so structural
//!   fields are never written twice.
//!
//! Relation ids are resolved through the identity mappings of the target
//! collection. An unresolved reference is left out of the projection and
//! logged rather than failing the record.

use serde_json::{json, Value};
use tracing::warn;

use crate::collections::{CollectionSpec, FieldKind};
use crate::error::{SyncError, SyncResult};
use crate::mapping::IdentityMap;
use crate::models::{Block, FieldMap, FieldValue, Locale, SourceRecord, Span};

/// Key of the secondary projection inside [`Projection::hashable`]. Not a
/// valid destination field slug, so it never collides with one.
pub const SECONDARY_KEY: &str = "@secondary";

/// Both locale projections of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub slug: String,
    pub primary: FieldMap,
    pub secondary: FieldMap,
}

impl Projection {
    /// What the hash ledger tracks: the primary projection without the
    /// slug, with the secondary projection nested under [`SECONDARY_KEY`].
    pub fn hashable(&self) -> FieldMap {
        let mut fields = self.primary.clone();
        fields.remove("slug");
        if !self.secondary.is_empty() {
            fields.insert(
                SECONDARY_KEY.to_string(),
                Value::Object(self.secondary.clone()),
            );
        }
        fields
    }
}

/// Project a record into both locales.
///
/// Fails only when no slug can be derived (no explicit slug and no name).
pub fn project_record(
    record: &SourceRecord,
    spec: &CollectionSpec,
    mappings: &IdentityMap,
) -> SyncResult<Projection> {
    let slug = record_slug(record, spec)?;
    let mut primary = project(record, spec, Locale::Primary, mappings);
    primary.insert("slug".to_string(), Value::String(slug.clone()));
    let secondary = project(record, spec, Locale::Secondary, mappings);
    Ok(Projection {
        slug,
        primary,
        secondary,
    })
}

/// Destination fields of `record` for `locale`, without the slug.
pub fn project(
    record: &SourceRecord,
    spec: &CollectionSpec,
    locale: Locale,
    mappings: &IdentityMap,
) -> FieldMap {
    let mut out = FieldMap::new();

    for field in spec.fields {
        if locale == Locale::Secondary && !field.kind.is_localized() {
            continue;
        }
        let Some(value) = record.fields.get(field.source) else {
            continue;
        };

        let projected = match value {
            FieldValue::Text(text) => Some(Value::String(
                text.get(locale).cloned().unwrap_or_default(),
            )),
            FieldValue::RichText(blocks) => Some(Value::String(
                blocks
                    .get(locale)
                    .map(|b| blocks_to_html(b))
                    .unwrap_or_default(),
            )),
            FieldValue::Asset(asset) => Some(json!({
                "url": asset.url,
                "alt": asset.alt.get(locale).cloned().unwrap_or_default(),
            })),
            FieldValue::Plain(v) => Some(v.clone()),
            FieldValue::Relation { target, ids, many } => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    match mappings.get(*target, id) {
                        Some(dest) => resolved.push(Value::String(dest.to_string())),
                        None => warn!(
                            collection = %record.collection,
                            source_id = %record.source_id,
                            field = field.source,
                            target = %target,
                            reference = %id,
                            "unresolved relation, leaving it out"
                        ),
                    }
                }
                if *many {
                    Some(Value::Array(resolved))
                } else {
                    resolved.into_iter().next()
                }
            }
        };

        if let Some(v) = projected {
            out.insert(field.destination.to_string(), v);
        }
    }

    out
}

/// The record's display name in the primary locale.
pub fn record_name<'a>(record: &'a SourceRecord, spec: &CollectionSpec) -> Option<&'a str> {
    record
        .text(spec.name_field, Locale::Primary)
        .filter(|n| !n.trim().is_empty())
}

/// The explicit slug, else one generated from the name.
pub fn record_slug(record: &SourceRecord, spec: &CollectionSpec) -> SyncResult<String> {
    if let Some(slug) = record.slug.as_deref().filter(|s| !s.trim().is_empty()) {
        return Ok(slug.to_string());
    }
    let generated = record_name(record, spec).map(slugify).unwrap_or_default();
    if generated.is_empty() {
        return Err(SyncError::Projection {
            source_id: record.source_id.clone(),
            message: "record has neither a slug nor a name".to_string(),
        });
    }
    Ok(generated)
}

/// Lowercase ASCII slug: umlauts folded, runs of anything else become `-`.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;

    for c in input.chars() {
        let folded: &str = match c {
            'ä' | 'Ä' => "ae",
            'ö' | 'Ö' => "oe",
            'ü' | 'Ü' => "ue",
            'ß' => "ss",
            'à' | 'á' | 'â' | 'À' | 'Á' | 'Â' => "a",
            'è' | 'é' | 'ê' | 'È' | 'É' | 'Ê' => "e",
            'ì' | 'í' | 'î' | 'Ì' | 'Í' | 'Î' => "i",
            'ò' | 'ó' | 'ô' | 'Ò' | 'Ó' | 'Ô' => "o",
            'ù' | 'ú' | 'û' | 'Ù' | 'Ú' | 'Û' => "u",
            'ç' | 'Ç' => "c",
            'ñ' | 'Ñ' => "n",
            _ => "",
        };

        if !folded.is_empty() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push_str(folded);
        } else if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    out
}

/// Convert source blocks to HTML.
///
/// Handles paragraphs, headings, blockquotes, bullet and numbered lists,
/// decorator marks and link annotations. Other block kinds are dropped
/// with a warning.
pub fn blocks_to_html(blocks: &[Block]) -> String {
    let mut html = String::new();
    let mut open_list: Option<&'static str> = None;

    for block in blocks {
        if block.kind != "block" {
            warn!(kind = %block.kind, "dropping unsupported rich text block");
            continue;
        }

        let list_tag = match block.list_item.as_deref() {
            Some("number") => Some("ol"),
            Some(_) => Some("ul"),
            None => None,
        };

        if open_list != list_tag {
            if let Some(tag) = open_list {
                html.push_str(&format!("</{}>", tag));
            }
            if let Some(tag) = list_tag {
                html.push_str(&format!("<{}>", tag));
            }
            open_list = list_tag;
        }

        let inner = render_spans(block);
        if list_tag.is_some() {
            html.push_str(&format!("<li>{}</li>", inner));
            continue;
        }

        let tag = match block.style.as_deref() {
            Some("h1") => "h1",
            Some("h2") => "h2",
            Some("h3") => "h3",
            Some("h4") => "h4",
            Some("blockquote") => "blockquote",
            _ => "p",
        };
        html.push_str(&format!("<{0}>{1}</{0}>", tag, inner));
    }

    if let Some(tag) = open_list {
        html.push_str(&format!("</{}>", tag));
    }

    html
}

fn render_spans(block: &Block) -> String {
    let mut out = String::new();
    for span in &block.children {
        if span.kind != "span" {
            warn!(kind = %span.kind, "dropping unsupported inline element");
            continue;
        }
        out.push_str(&render_span(span, block));
    }
    out
}

fn render_span(span: &Span, block: &Block) -> String {
    let mut text = escape_html(&span.text).replace('\n', "<br>");
    for mark in &span.marks {
        let (open, close) = match mark.as_str() {
            "strong" => ("<strong>".to_string(), "</strong>"),
            "em" => ("<em>".to_string(), "</em>"),
            "code" => ("<code>".to_string(), "</code>"),
            "underline" => ("<u>".to_string(), "</u>"),
            "strike-through" => ("<s>".to_string(), "</s>"),
            key => match block
                .mark_defs
                .iter()
                .find(|d| d.key == key && d.kind == "link")
                .and_then(|d| d.href.as_deref())
            {
                Some(href) => (format!("<a href=\"{}\">", escape_html(href)), "</a>"),
                None => continue,
            },
        };
        text = format!("{}{}{}", open, text, close);
    }
    text
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
