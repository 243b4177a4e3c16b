//! Destination collection store.
//!
//! [`Destination`] is the reconciler's view of the collection store: list,
//! fetch, create, update, delete and publish items of one collection.
//! [`RestDestination`] implements it over a shared [`RemoteClient`], so all
//! calls go through the same request spacing and retry policy.
//!
//! Locale identifiers and collection ids are resolved once in
//! [`RestDestination::connect`]; nothing past this module deals in raw
//! locale ids.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collections;
use crate::config::{DestinationConfig, LocaleConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::{CollectionKey, DestinationRecord, FieldMap, Locale};
use crate::remote::{RemoteClient, RemoteRequest};

/// Items requested per listing page; the store's maximum.
pub const PAGE_SIZE: usize = 100;

#[async_trait]
pub trait Destination: Send + Sync {
    /// Whether the site has a secondary locale to write.
    fn has_secondary(&self) -> bool;

    /// Every item of the collection, primary locale, all pages.
    async fn list_items(&self, collection: CollectionKey) -> SyncResult<Vec<DestinationRecord>>;

    /// One item, or `None` if the store answers 404.
    async fn get_item(
        &self,
        collection: CollectionKey,
        id: &str,
    ) -> SyncResult<Option<DestinationRecord>>;

    /// Create an item from primary-locale fields, linked across all site
    /// locales. Returns the new item id.
    async fn create_item(&self, collection: CollectionKey, fields: &FieldMap) -> SyncResult<String>;

    async fn update_item(
        &self,
        collection: CollectionKey,
        id: &str,
        locale: Locale,
        fields: &FieldMap,
    ) -> SyncResult<()>;

    async fn delete_item(&self, collection: CollectionKey, id: &str) -> SyncResult<()>;

    async fn publish_items(&self, collection: CollectionKey, ids: &[String]) -> SyncResult<()>;
}

/// Locale ids of the destination site.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteLocales {
    pub primary: String,
    pub secondary: Option<String>,
}

impl SiteLocales {
    pub fn id(&self, locale: Locale) -> Option<&str> {
        match locale {
            Locale::Primary => Some(&self.primary),
            Locale::Secondary => self.secondary.as_deref(),
        }
    }
}

/// A collection as listed by the destination site.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCollection {
    pub id: String,
    pub slug: String,
    pub display_name: String,
}

/// [`Destination`] over the collection store's REST API.
pub struct RestDestination {
    client: Arc<RemoteClient>,
    locales: SiteLocales,
    collection_ids: BTreeMap<CollectionKey, String>,
    listed: Vec<RemoteCollection>,
}

impl RestDestination {
    /// Resolve site locales and collection ids.
    ///
    /// Fails when the site cannot be read; that is the "destination
    /// unreachable" case that aborts a run.
    pub async fn connect(
        config: &DestinationConfig,
        locales: &LocaleConfig,
        client: Arc<RemoteClient>,
    ) -> SyncResult<Self> {
        let site = client
            .execute(&RemoteRequest::get(format!("/sites/{}", config.site_id)))
            .await?;
        let site_locales = resolve_locales(&site, locales)?;

        let listed = list_collections(&client, &config.site_id).await?;

        let mut collection_ids = BTreeMap::new();
        for spec in collections::all() {
            let id = match config.collection_override(spec.key) {
                Some(id) => Some(id.to_string()),
                None => listed
                    .iter()
                    .find(|c| c.slug == spec.destination_slug)
                    .map(|c| c.id.clone()),
            };
            match id {
                Some(id) => {
                    collection_ids.insert(spec.key, id);
                }
                None => warn!(
                    collection = %spec.key,
                    slug = spec.destination_slug,
                    "no destination collection found"
                ),
            }
        }

        info!(
            site = %config.site_id,
            secondary = site_locales.secondary.is_some(),
            collections = collection_ids.len(),
            "destination connected"
        );

        Ok(Self {
            client,
            locales: site_locales,
            collection_ids,
            listed,
        })
    }

    pub fn locales(&self) -> &SiteLocales {
        &self.locales
    }

    /// The resolved id for `collection`, if any.
    pub fn collection_id(&self, collection: CollectionKey) -> Option<&str> {
        self.collection_ids.get(&collection).map(String::as_str)
    }

    /// Collections listed by the site at connect time.
    pub fn remote_collections(&self) -> &[RemoteCollection] {
        &self.listed
    }

    fn require_collection(&self, collection: CollectionKey) -> SyncResult<&str> {
        self.collection_id(collection).ok_or_else(|| {
            SyncError::Config(format!(
                "no destination collection id for '{}' (set destination.collections.{})",
                collection, collection
            ))
        })
    }

    fn locale_id(&self, locale: Locale) -> SyncResult<&str> {
        self.locales
            .id(locale)
            .ok_or_else(|| SyncError::Config("site has no secondary locale".to_string()))
    }
}

async fn list_collections(client: &RemoteClient, site_id: &str) -> SyncResult<Vec<RemoteCollection>> {
    let body = client
        .execute(&RemoteRequest::get(format!("/sites/{}/collections", site_id)))
        .await?;

    let collections = body
        .get("collections")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    Ok(collections
        .iter()
        .filter_map(|c| {
            Some(RemoteCollection {
                id: c.get("id")?.as_str()?.to_string(),
                slug: c.get("slug").and_then(Value::as_str).unwrap_or("").to_string(),
                display_name: c
                    .get("displayName")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .collect())
}

/// Pick the site's locale ids matching the configured tags.
///
/// A secondary tag matches exactly or as a language prefix (`en` matches
/// `en-US`). A configured secondary the site lacks is dropped with a warning.
fn resolve_locales(site: &Value, config: &LocaleConfig) -> SyncResult<SiteLocales> {
    let locales = site.get("locales");
    let primary = locales
        .and_then(|l| l.get("primary"))
        .ok_or_else(|| SyncError::Config("destination site has no primary locale".to_string()))?;
    let primary_id = primary
        .get("cmsLocaleId")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Config("primary locale without cmsLocaleId".to_string()))?
        .to_string();

    if let Some(tag) = primary.get("tag").and_then(Value::as_str) {
        if !tag_matches(tag, &config.primary) {
            warn!(site_tag = tag, configured = %config.primary, "primary locale tag differs from configuration");
        }
    }

    let secondary = match config.secondary.as_deref() {
        None => None,
        Some(wanted) => {
            let found = locales
                .and_then(|l| l.get("secondary"))
                .and_then(Value::as_array)
                .and_then(|list| {
                    list.iter().find(|l| {
                        l.get("enabled").and_then(Value::as_bool).unwrap_or(true)
                            && l.get("tag")
                                .and_then(Value::as_str)
                                .is_some_and(|t| tag_matches(t, wanted))
                    })
                })
                .and_then(|l| l.get("cmsLocaleId"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if found.is_none() {
                warn!(locale = wanted, "secondary locale not enabled on site, writing primary only");
            }
            found
        }
    };

    Ok(SiteLocales {
        primary: primary_id,
        secondary,
    })
}

fn tag_matches(site_tag: &str, wanted: &str) -> bool {
    let site_tag = site_tag.to_ascii_lowercase();
    let wanted = wanted.to_ascii_lowercase();
    site_tag == wanted || site_tag.starts_with(&format!("{}-", wanted))
}

fn linked_ids_agree(ids: &[&str]) -> bool {
    ids.windows(2).all(|pair| pair[0] == pair[1])
}

/// Read one item as returned by the store.
pub fn parse_item(value: &Value) -> Option<DestinationRecord> {
    let id = value.get("id")?.as_str()?.to_string();
    Some(DestinationRecord {
        id,
        is_draft: value.get("isDraft").and_then(Value::as_bool).unwrap_or(false),
        field_data: value
            .get("fieldData")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    })
}

#[async_trait]
impl Destination for RestDestination {
    fn has_secondary(&self) -> bool {
        self.locales.secondary.is_some()
    }

    async fn list_items(&self, collection: CollectionKey) -> SyncResult<Vec<DestinationRecord>> {
        let collection_id = self.require_collection(collection)?;
        let mut items = Vec::new();
        let mut offset = 0usize;

        loop {
            let page = self
                .client
                .execute(
                    &RemoteRequest::get(format!("/collections/{}/items", collection_id))
                        .with_query("offset", offset)
                        .with_query("limit", PAGE_SIZE)
                        .with_query("cmsLocaleId", &self.locales.primary),
                )
                .await?;

            let batch = page
                .get("items")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let fetched = batch.len();
            items.extend(batch.iter().filter_map(parse_item));
            offset += fetched;

            let total = page
                .get("pagination")
                .and_then(|p| p.get("total"))
                .and_then(Value::as_u64)
                .map(|t| t as usize);
            let done = match total {
                Some(total) => offset >= total || fetched == 0,
                None => fetched < PAGE_SIZE,
            };
            if done {
                break;
            }
        }

        debug!(collection = %collection, count = items.len(), "listed destination items");
        Ok(items)
    }

    async fn get_item(
        &self,
        collection: CollectionKey,
        id: &str,
    ) -> SyncResult<Option<DestinationRecord>> {
        let collection_id = self.require_collection(collection)?;
        let request = RemoteRequest::get(format!("/collections/{}/items/{}", collection_id, id))
            .with_query("cmsLocaleId", &self.locales.primary);
        match self.client.execute(&request).await {
            Ok(value) => Ok(parse_item(&value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_item(&self, collection: CollectionKey, fields: &FieldMap) -> SyncResult<String> {
        let collection_id = self.require_collection(collection)?;
        let mut locale_ids = vec![self.locales.primary.clone()];
        if let Some(ref secondary) = self.locales.secondary {
            locale_ids.push(secondary.clone());
        }

        let body = json!({
            "isDraft": false,
            "isArchived": false,
            "cmsLocaleIds": locale_ids,
            "fieldData": fields,
        });
        let response = self
            .client
            .execute(&RemoteRequest::post(
                format!("/collections/{}/items", collection_id),
                body,
            ))
            .await?;

        // Linked creation answers with one item per locale; all share the id.
        let per_locale = response.get("items").and_then(Value::as_array);
        let created = per_locale
            .and_then(|items| items.first())
            .unwrap_or(&response);
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Remote {
                status: 200,
                body: format!("create response without item id: {}", response),
            })?;

        if let Some(items) = per_locale {
            let ids: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_str))
                .collect();
            if !linked_ids_agree(&ids) {
                warn!(
                    collection = %collection,
                    item_id = %id,
                    ids = ?ids,
                    "linked create returned differing item ids, keeping the first"
                );
            }
        }
        Ok(id)
    }

    async fn update_item(
        &self,
        collection: CollectionKey,
        id: &str,
        locale: Locale,
        fields: &FieldMap,
    ) -> SyncResult<()> {
        let collection_id = self.require_collection(collection)?;
        let body = json!({
            "cmsLocaleId": self.locale_id(locale)?,
            "fieldData": fields,
        });
        self.client
            .execute(&RemoteRequest::patch(
                format!("/collections/{}/items/{}", collection_id, id),
                body,
            ))
            .await?;
        Ok(())
    }

    async fn delete_item(&self, collection: CollectionKey, id: &str) -> SyncResult<()> {
        let collection_id = self.require_collection(collection)?;
        self.client
            .execute(&RemoteRequest::delete(format!(
                "/collections/{}/items/{}",
                collection_id, id
            )))
            .await?;
        Ok(())
    }

    async fn publish_items(&self, collection: CollectionKey, ids: &[String]) -> SyncResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let collection_id = self.require_collection(collection)?;
        self.client
            .execute(&RemoteRequest::post(
                format!("/collections/{}/items/publish", collection_id),
                json!({ "itemIds": ids }),
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemotePolicy;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> Arc<RemoteClient> {
        let policy = RemotePolicy {
            min_interval: Duration::from_millis(0),
            max_retries: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
        };
        Arc::new(RemoteClient::new(&server.uri(), "tok".into(), policy).unwrap())
    }

    fn destination_config(server: &MockServer) -> DestinationConfig {
        let toml = format!(
            r#"
            [source]
            project_id = "p"
            dataset = "production"

            [destination]
            base_url = "{}"
            site_id = "site1"

            [destination.collections]
            material = "col-mat-override"
            "#,
            server.uri()
        );
        crate::config::parse_config(&toml).unwrap().destination
    }

    async fn mount_site(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/sites/site1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "site1",
                "locales": {
                    "primary": { "cmsLocaleId": "loc-de", "tag": "de" },
                    "secondary": [
                        { "cmsLocaleId": "loc-fr", "tag": "fr", "enabled": true },
                        { "cmsLocaleId": "loc-en", "tag": "en-US", "enabled": true }
                    ]
                }
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sites/site1/collections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "collections": [
                    { "id": "col-works", "slug": "works", "displayName": "Works" },
                    { "id": "col-mat", "slug": "materials", "displayName": "Materials" }
                ]
            })))
            .mount(server)
            .await;
    }

    async fn connect(server: &MockServer) -> RestDestination {
        mount_site(server).await;
        RestDestination::connect(
            &destination_config(server),
            &LocaleConfig::default(),
            client(server),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn connect_resolves_locales_and_collections() {
        let server = MockServer::start().await;
        let dest = connect(&server).await;

        assert_eq!(dest.locales().primary, "loc-de");
        assert_eq!(dest.locales().secondary.as_deref(), Some("loc-en"));
        assert!(dest.has_secondary());
        assert_eq!(dest.collection_id(CollectionKey::Work), Some("col-works"));
        assert_eq!(
            dest.collection_id(CollectionKey::Material),
            Some("col-mat-override")
        );
        assert_eq!(dest.collection_id(CollectionKey::Creator), None);
        assert_eq!(dest.remote_collections().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_site_fails_connect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sites/site1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = RestDestination::connect(
            &destination_config(&server),
            &LocaleConfig::default(),
            client(&server),
        )
        .await;
        assert!(matches!(result, Err(SyncError::Remote { status: 401, .. })));
    }

    #[tokio::test]
    async fn list_items_walks_all_pages() {
        let server = MockServer::start().await;
        let dest = connect(&server).await;

        let first: Vec<Value> = (0..PAGE_SIZE)
            .map(|i| json!({ "id": format!("i{}", i), "fieldData": { "slug": format!("s{}", i) } }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/collections/col-works/items"))
            .and(query_param("offset", "0"))
            .and(query_param("cmsLocaleId", "loc-de"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": first,
                "pagination": { "limit": 100, "offset": 0, "total": 101 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/collections/col-works/items"))
            .and(query_param("offset", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{ "id": "last", "isDraft": true, "fieldData": { "slug": "last" } }],
                "pagination": { "limit": 100, "offset": 100, "total": 101 }
            })))
            .mount(&server)
            .await;

        let items = dest.list_items(CollectionKey::Work).await.unwrap();
        assert_eq!(items.len(), 101);
        assert_eq!(items[100].id, "last");
        assert!(items[100].is_draft);
        assert_eq!(items[5].slug(), Some("s5"));
    }

    #[tokio::test]
    async fn missing_item_is_none() {
        let server = MockServer::start().await;
        let dest = connect(&server).await;
        Mock::given(method("GET"))
            .and(path("/collections/col-works/items/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        assert_eq!(dest.get_item(CollectionKey::Work, "gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_links_all_locales() {
        let server = MockServer::start().await;
        let dest = connect(&server).await;
        Mock::given(method("POST"))
            .and(path("/collections/col-works/items"))
            .and(body_partial_json(json!({
                "cmsLocaleIds": ["loc-de", "loc-en"],
                "fieldData": { "name": "Sonnenaufgang", "slug": "sunrise" }
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "items": [{ "id": "new-1", "cmsLocaleId": "loc-de" }, { "id": "new-1", "cmsLocaleId": "loc-en" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Sonnenaufgang"));
        fields.insert("slug".into(), json!("sunrise"));
        let id = dest.create_item(CollectionKey::Work, &fields).await.unwrap();
        assert_eq!(id, "new-1");
    }

    #[tokio::test]
    async fn create_with_differing_linked_ids_keeps_the_first() {
        let server = MockServer::start().await;
        let dest = connect(&server).await;
        Mock::given(method("POST"))
            .and(path("/collections/col-works/items"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "items": [{ "id": "new-1" }, { "id": "new-2" }]
            })))
            .mount(&server)
            .await;

        let id = dest
            .create_item(CollectionKey::Work, &FieldMap::new())
            .await
            .unwrap();
        assert_eq!(id, "new-1");
    }

    #[test]
    fn linked_ids_agree_only_when_identical() {
        assert!(linked_ids_agree(&[]));
        assert!(linked_ids_agree(&["a"]));
        assert!(linked_ids_agree(&["a", "a"]));
        assert!(!linked_ids_agree(&["a", "b"]));
    }

    #[tokio::test]
    async fn update_targets_locale_and_publish_sends_ids() {
        let server = MockServer::start().await;
        let dest = connect(&server).await;
        Mock::given(method("PATCH"))
            .and(path("/collections/col-works/items/d1"))
            .and(body_partial_json(json!({ "cmsLocaleId": "loc-en" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "d1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/col-works/items/publish"))
            .and(body_partial_json(json!({ "itemIds": ["d1", "d2"] })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "publishedItemIds": ["d1", "d2"] })))
            .expect(1)
            .mount(&server)
            .await;

        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Sunrise"));
        dest.update_item(CollectionKey::Work, "d1", Locale::Secondary, &fields)
            .await
            .unwrap();
        dest.publish_items(CollectionKey::Work, &["d1".to_string(), "d2".to_string()])
            .await
            .unwrap();
        dest.publish_items(CollectionKey::Work, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn unresolved_collection_is_a_config_error() {
        let server = MockServer::start().await;
        let dest = connect(&server).await;
        let err = dest.list_items(CollectionKey::Creator).await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn locale_tags_match_by_language_prefix() {
        assert!(tag_matches("en-US", "en"));
        assert!(tag_matches("EN", "en"));
        assert!(!tag_matches("eng", "en"));
    }
}
