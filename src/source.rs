//! Source content store.
//!
//! The engine only reads content from the source store. [`SourceStore`] is
//! the seam the reconciler depends on; [`HttpSource`] implements it against
//! the store's HTTP query API and also offers a [`StateBackend`] that keeps
//! the engine's settings records as documents in the same dataset.
//!
//! # Query API
//!
//! ```text
//! GET  {base}/v{api}/data/query/{dataset}?query=<q>&$id="<id>"  → { "result": ... }
//! POST {base}/v{api}/data/mutate/{dataset}                      ← { "mutations": [...] }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::collections::{CollectionSpec, FieldKind, QueryScope};
use crate::config::{Config, LocaleConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::{Asset, Block, FieldValue, Localized, SourceRecord};
use crate::state::StateBackend;

/// Read access to source records.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// All published records of one collection within `scope`.
    async fn fetch_records(
        &self,
        spec: &CollectionSpec,
        scope: &QueryScope,
    ) -> SyncResult<Vec<SourceRecord>>;
}

/// Locale keys used inside localized source objects (`{ "de": …, "en": … }`).
#[derive(Debug, Clone)]
pub struct LocaleTags {
    pub primary: String,
    pub secondary: Option<String>,
}

impl From<&LocaleConfig> for LocaleTags {
    fn from(config: &LocaleConfig) -> Self {
        Self {
            primary: config.primary.clone(),
            secondary: config.secondary.clone(),
        }
    }
}

/// [`SourceStore`] over the hosted query API.
pub struct HttpSource {
    http: reqwest::Client,
    api_base: String,
    api_version: String,
    dataset: String,
    token: Option<String>,
    locales: LocaleTags,
}

impl HttpSource {
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.source.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: config.source.api_base(),
            api_version: config.source.api_version.trim_start_matches('v').to_string(),
            dataset: config.source.dataset.clone(),
            token: config.source.token(),
            locales: LocaleTags::from(&config.locales),
        })
    }

    fn endpoint(&self, action: &str) -> String {
        format!(
            "{}/v{}/data/{}/{}",
            self.api_base, self.api_version, action, self.dataset
        )
    }

    /// Run a query; `params` are bound as `$name` JSON-encoded values.
    pub async fn query(&self, query: &str, params: &[(&str, Value)]) -> SyncResult<Value> {
        let mut pairs: Vec<(String, String)> = vec![("query".to_string(), query.to_string())];
        for (name, value) in params {
            pairs.push((format!("${}", name), value.to_string()));
        }

        let mut request = self.http.get(self.endpoint("query")).query(&pairs);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Source(format!("query request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Source(format!("query response unreadable: {}", e)))?;

        if !status.is_success() {
            return Err(SyncError::Source(format!("query failed {}: {}", status, body)));
        }

        let mut parsed: Value = serde_json::from_str(&body)
            .map_err(|e| SyncError::Source(format!("query response is not JSON: {}", e)))?;
        Ok(parsed
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn mutate(&self, mutations: Value) -> SyncResult<()> {
        let token = self.token.as_ref().ok_or_else(|| {
            SyncError::Config("source token required to write settings documents".to_string())
        })?;

        let response = self
            .http
            .post(self.endpoint("mutate"))
            .bearer_auth(token)
            .json(&json!({ "mutations": mutations }))
            .send()
            .await
            .map_err(|e| SyncError::State(format!("mutation request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::State(format!("mutation failed {}: {}", status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStore for HttpSource {
    async fn fetch_records(
        &self,
        spec: &CollectionSpec,
        scope: &QueryScope,
    ) -> SyncResult<Vec<SourceRecord>> {
        let query = spec.query(scope);
        let params: Vec<(&str, Value)> = match scope.source_id {
            Some(ref id) => vec![("id", Value::String(id.clone()))],
            None => Vec::new(),
        };

        let result = self.query(&query, &params).await?;
        let documents = match result {
            Value::Array(docs) => docs,
            Value::Null => Vec::new(),
            other => {
                return Err(SyncError::Source(format!(
                    "expected an array of {} documents, got {}",
                    spec.source_type, other
                )))
            }
        };

        debug!(collection = %spec.key, count = documents.len(), "fetched source documents");

        let mut records = Vec::with_capacity(documents.len());
        for doc in &documents {
            match parse_record(spec, doc, &self.locales) {
                Ok(record) => records.push(record),
                Err(e) => warn!(collection = %spec.key, error = %e, "skipping unreadable source document"),
            }
        }
        Ok(records)
    }
}

fn settings_id(key: &str) -> String {
    format!("settings.{}", key)
}

#[async_trait]
impl StateBackend for HttpSource {
    async fn read(&self, key: &str) -> SyncResult<Option<String>> {
        let value = self
            .query(
                "*[_id == $id][0].value",
                &[("id", Value::String(settings_id(key)))],
            )
            .await
            .map_err(|e| SyncError::State(e.to_string()))?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        self.mutate(json!([{
            "createOrReplace": {
                "_id": settings_id(key),
                "_type": "syncSettings",
                "value": value,
            }
        }]))
        .await
    }
}

/// Build a [`SourceRecord`] from one query result document.
pub fn parse_record(
    spec: &CollectionSpec,
    doc: &Value,
    locales: &LocaleTags,
) -> SyncResult<SourceRecord> {
    let source_id = doc
        .get("_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SyncError::Source(format!("{} document without _id", spec.source_type)))?;

    let mut record = SourceRecord::new(spec.key, source_id);
    record.slug = doc
        .get("slug")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    record.updated_at = doc
        .get("_updatedAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    for field in spec.fields {
        let raw = match doc.get(field.source) {
            None | Some(Value::Null) => continue,
            Some(v) => v,
        };

        let value = match field.kind {
            FieldKind::Text => localized_text(raw, locales).map(FieldValue::Text),
            FieldKind::RichText => {
                localized_blocks(raw, locales, source_id).map(FieldValue::RichText)
            }
            FieldKind::Asset => asset(raw, locales).map(FieldValue::Asset),
            FieldKind::Plain => Some(FieldValue::Plain(raw.clone())),
            FieldKind::Relation { target, many } => Some(FieldValue::Relation {
                target,
                ids: reference_ids(raw),
                many,
            }),
        };

        match value {
            Some(v) => {
                record.fields.insert(field.source.to_string(), v);
            }
            None => warn!(
                collection = %spec.key,
                source_id = %source_id,
                field = field.source,
                "ignoring field with unexpected shape"
            ),
        }
    }

    Ok(record)
}

fn localized<T>(
    raw: &Value,
    locales: &LocaleTags,
    read: impl Fn(&Value) -> Option<T>,
) -> Option<Localized<T>> {
    if let Some(direct) = read(raw) {
        return Some(Localized::new(Some(direct), None));
    }
    let obj = raw.as_object()?;
    let primary = obj.get(&locales.primary).and_then(&read);
    let secondary = locales
        .secondary
        .as_ref()
        .and_then(|tag| obj.get(tag))
        .and_then(&read);
    Some(Localized::new(primary, secondary))
}

fn localized_text(raw: &Value, locales: &LocaleTags) -> Option<Localized<String>> {
    localized(raw, locales, |v| v.as_str().map(str::to_string))
}

fn localized_blocks(
    raw: &Value,
    locales: &LocaleTags,
    source_id: &str,
) -> Option<Localized<Vec<Block>>> {
    localized(raw, locales, |v| {
        let items = v.as_array()?;
        let mut blocks = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<Block>(item.clone()) {
                Ok(block) => blocks.push(block),
                Err(e) => warn!(
                    source_id = source_id,
                    block_type = item.get("_type").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    error = %e,
                    "dropping unreadable rich text block"
                ),
            }
        }
        Some(blocks)
    })
}

fn asset(raw: &Value, locales: &LocaleTags) -> Option<Asset> {
    let url = raw.get("url").and_then(Value::as_str)?.to_string();
    let alt = raw
        .get("alt")
        .and_then(|a| localized_text(a, locales))
        .unwrap_or_default();
    Some(Asset { url, alt })
}

fn reference_ids(raw: &Value) -> Vec<String> {
    fn one(v: &Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o
                .get("_ref")
                .or_else(|| o.get("_id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    match raw {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        other => one(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::spec;
    use crate::models::{CollectionKey, Locale};

    fn tags() -> LocaleTags {
        LocaleTags {
            primary: "de".into(),
            secondary: Some("en".into()),
        }
    }

    #[test]
    fn parses_localized_document() {
        let doc = json!({
            "_id": "w1",
            "_updatedAt": "2024-03-01T10:00:00Z",
            "slug": "sunrise",
            "title": { "de": "Sonnenaufgang", "en": "Sunrise" },
            "description": { "de": [{ "_type": "block", "children": [{ "text": "Hallo" }] }] },
            "image": { "url": "https://cdn/a.jpg", "alt": { "de": "Bild" } },
            "year": 1999,
            "creator": "c1",
            "materials": ["m1", { "_ref": "m2" }],
            "dimensions": null
        });

        let record = parse_record(spec(CollectionKey::Work), &doc, &tags()).unwrap();
        assert_eq!(record.source_id, "w1");
        assert_eq!(record.slug.as_deref(), Some("sunrise"));
        assert!(record.updated_at.is_some());
        assert_eq!(record.text("title", Locale::Secondary), Some("Sunrise"));
        assert!(!record.fields.contains_key("dimensions"));

        match &record.fields["materials"] {
            FieldValue::Relation { ids, many, target } => {
                assert_eq!(ids, &vec!["m1".to_string(), "m2".to_string()]);
                assert!(*many);
                assert_eq!(*target, CollectionKey::Material);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &record.fields["image"] {
            FieldValue::Asset(a) => {
                assert_eq!(a.url, "https://cdn/a.jpg");
                assert_eq!(a.alt.get(Locale::Secondary).unwrap(), "Bild");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn plain_string_text_counts_as_primary() {
        let doc = json!({ "_id": "m1", "title": "Holz" });
        let record = parse_record(spec(CollectionKey::Material), &doc, &tags()).unwrap();
        assert_eq!(record.text("title", Locale::Primary), Some("Holz"));
        assert_eq!(record.text("title", Locale::Secondary), Some("Holz"));
    }

    #[test]
    fn unreadable_blocks_are_dropped_and_the_rest_kept() {
        let doc = json!({
            "_id": "c1",
            "name": "Ada",
            "biography": {
                "de": [
                    { "_type": "block", "children": [{ "text": "Erster" }] },
                    { "children": "not a list" },
                    { "_type": "block", "children": [{ "text": "Zweiter" }] }
                ]
            }
        });
        let record = parse_record(spec(CollectionKey::Creator), &doc, &tags()).unwrap();
        match &record.fields["biography"] {
            FieldValue::RichText(blocks) => {
                let de = blocks.get(Locale::Primary).unwrap();
                assert_eq!(de.len(), 2);
                assert_eq!(de[1].children[0].text, "Zweiter");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn document_without_id_is_rejected() {
        let doc = json!({ "title": "x" });
        assert!(parse_record(spec(CollectionKey::Material), &doc, &tags()).is_err());
    }
}
