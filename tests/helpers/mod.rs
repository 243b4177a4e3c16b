//! In-memory stand-ins for the source and destination stores.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cms_mirror::collections::{spec, CollectionSpec, QueryScope};
use cms_mirror::destination::Destination;
use cms_mirror::error::{SyncError, SyncResult};
use cms_mirror::models::{
    CollectionKey, DestinationRecord, FieldMap, FieldValue, Locale, Localized, SourceRecord,
};
use cms_mirror::pipeline::{Pipeline, PipelineSettings};
use cms_mirror::projector::project_record;
use cms_mirror::ledger::content_hash;
use cms_mirror::state::{MemoryStateBackend, ReconciliationState};

// ============ Source ============

#[derive(Default)]
pub struct FakeSource {
    records: Mutex<BTreeMap<CollectionKey, Vec<SourceRecord>>>,
    failing: Mutex<HashSet<CollectionKey>>,
    queries: Mutex<Vec<(CollectionKey, QueryScope)>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn put(&self, record: SourceRecord) {
        let mut records = self.records.lock().unwrap();
        let list = records.entry(record.collection).or_default();
        list.retain(|r| r.source_id != record.source_id);
        list.push(record);
    }

    pub fn remove(&self, collection: CollectionKey, source_id: &str) {
        if let Some(list) = self.records.lock().unwrap().get_mut(&collection) {
            list.retain(|r| r.source_id != source_id);
        }
    }

    pub fn fail(&self, collection: CollectionKey) {
        self.failing.lock().unwrap().insert(collection);
    }

    pub fn queries(&self) -> Vec<(CollectionKey, QueryScope)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl cms_mirror::source::SourceStore for FakeSource {
    async fn fetch_records(
        &self,
        spec: &CollectionSpec,
        scope: &QueryScope,
    ) -> SyncResult<Vec<SourceRecord>> {
        self.queries.lock().unwrap().push((spec.key, scope.clone()));
        if self.failing.lock().unwrap().contains(&spec.key) {
            return Err(SyncError::Source(format!("{} query failed", spec.key)));
        }
        let records = self.records.lock().unwrap();
        let mut found: Vec<SourceRecord> = records
            .get(&spec.key)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| scope.source_id.as_deref().map_or(true, |id| r.source_id == id))
            .collect();
        if let Some(limit) = scope.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

// ============ Destination ============

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeItem {
    pub primary: FieldMap,
    pub secondary: FieldMap,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List(CollectionKey),
    Get(CollectionKey, String),
    Create(CollectionKey, String),
    Update(CollectionKey, String, Locale),
    Delete(CollectionKey, String),
    Publish(CollectionKey, Vec<String>),
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<CollectionKey, BTreeMap<String, FakeItem>>,
    next_id: u64,
    calls: Vec<Call>,
    rate_limited_creates: u32,
}

pub struct FakeDestination {
    inner: Mutex<Inner>,
    secondary: bool,
    delay: Duration,
}

impl FakeDestination {
    pub fn new(secondary: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            secondary,
            delay: Duration::ZERO,
        }
    }

    /// Every call sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn insert(&self, collection: CollectionKey, id: &str, primary: Value) {
        let primary = primary.as_object().cloned().unwrap_or_default();
        self.inner
            .lock()
            .unwrap()
            .items
            .entry(collection)
            .or_default()
            .insert(
                id.to_string(),
                FakeItem {
                    primary,
                    ..FakeItem::default()
                },
            );
    }

    /// Remove an item behind the engine's back.
    pub fn remove(&self, collection: CollectionKey, id: &str) {
        if let Some(items) = self.inner.lock().unwrap().items.get_mut(&collection) {
            items.remove(id);
        }
    }

    pub fn item(&self, collection: CollectionKey, id: &str) -> Option<FakeItem> {
        self.inner
            .lock()
            .unwrap()
            .items
            .get(&collection)
            .and_then(|items| items.get(id))
            .cloned()
    }

    pub fn ids(&self, collection: CollectionKey) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .items
            .get(&collection)
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    /// Writes among the recorded calls (create, update, delete).
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Create(..) | Call::Update(..) | Call::Delete(..)))
            .collect()
    }

    /// The next `n` creates fail as if the rate limit budget were exhausted.
    pub fn rate_limit_creates(&self, n: u32) {
        self.inner.lock().unwrap().rate_limited_creates = n;
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

fn record(id: &str, item: &FakeItem) -> DestinationRecord {
    DestinationRecord {
        id: id.to_string(),
        is_draft: !item.published,
        field_data: item.primary.clone(),
    }
}

fn not_found(id: &str) -> SyncError {
    SyncError::Remote {
        status: 404,
        body: format!("item {} not found", id),
    }
}

#[async_trait]
impl Destination for FakeDestination {
    fn has_secondary(&self) -> bool {
        self.secondary
    }

    async fn list_items(&self, collection: CollectionKey) -> SyncResult<Vec<DestinationRecord>> {
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::List(collection));
        Ok(inner
            .items
            .get(&collection)
            .map(|items| items.iter().map(|(id, item)| record(id, item)).collect())
            .unwrap_or_default())
    }

    async fn get_item(
        &self,
        collection: CollectionKey,
        id: &str,
    ) -> SyncResult<Option<DestinationRecord>> {
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Get(collection, id.to_string()));
        Ok(inner
            .items
            .get(&collection)
            .and_then(|items| items.get(id))
            .map(|item| record(id, item)))
    }

    async fn create_item(&self, collection: CollectionKey, fields: &FieldMap) -> SyncResult<String> {
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        if inner.rate_limited_creates > 0 {
            inner.rate_limited_creates -= 1;
            return Err(SyncError::RateLimitExhausted { attempts: 4 });
        }
        inner.next_id += 1;
        let id = format!("{}-{}", collection, inner.next_id);
        inner.calls.push(Call::Create(collection, id.clone()));
        inner.items.entry(collection).or_default().insert(
            id.clone(),
            FakeItem {
                primary: fields.clone(),
                secondary: fields.clone(),
                published: false,
            },
        );
        Ok(id)
    }

    async fn update_item(
        &self,
        collection: CollectionKey,
        id: &str,
        locale: Locale,
        fields: &FieldMap,
    ) -> SyncResult<()> {
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(Call::Update(collection, id.to_string(), locale));
        let item = inner
            .items
            .get_mut(&collection)
            .and_then(|items| items.get_mut(id))
            .ok_or_else(|| not_found(id))?;
        let target = match locale {
            Locale::Primary => &mut item.primary,
            Locale::Secondary => &mut item.secondary,
        };
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
        item.published = false;
        Ok(())
    }

    async fn delete_item(&self, collection: CollectionKey, id: &str) -> SyncResult<()> {
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Delete(collection, id.to_string()));
        inner
            .items
            .get_mut(&collection)
            .and_then(|items| items.remove(id))
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }

    async fn publish_items(&self, collection: CollectionKey, ids: &[String]) -> SyncResult<()> {
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Publish(collection, ids.to_vec()));
        if let Some(items) = inner.items.get_mut(&collection) {
            for id in ids {
                if let Some(item) = items.get_mut(id) {
                    item.published = true;
                }
            }
        }
        Ok(())
    }
}

// ============ Wiring ============

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub destination: Arc<FakeDestination>,
    pub state: Arc<MemoryStateBackend>,
    pub pipeline: Pipeline,
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        publish: true,
        publish_batch_size: 100,
        secondary_delay: Duration::ZERO,
        rate_limit_cooldown: Duration::from_millis(10),
    }
}

pub fn harness() -> Harness {
    harness_with(FakeDestination::new(true))
}

pub fn harness_with(destination: FakeDestination) -> Harness {
    let source = Arc::new(FakeSource::new());
    let destination = Arc::new(destination);
    let state = Arc::new(MemoryStateBackend::new());
    let pipeline = Pipeline::new(source.clone(), destination.clone(), state.clone(), settings());
    Harness {
        source,
        destination,
        state,
        pipeline,
    }
}

impl Harness {
    pub async fn state(&self) -> ReconciliationState {
        ReconciliationState::load(self.state.as_ref()).await
    }

    pub async fn save_state(&self, state: &ReconciliationState) {
        state.save(self.state.as_ref()).await.unwrap();
    }
}

// ============ Records ============

pub fn text(primary: &str, secondary: &str) -> FieldValue {
    FieldValue::Text(Localized::new(
        Some(primary.to_string()),
        Some(secondary.to_string()),
    ))
}

pub fn relation(target: CollectionKey, ids: &[&str], many: bool) -> FieldValue {
    FieldValue::Relation {
        target,
        ids: ids.iter().map(|s| s.to_string()).collect(),
        many,
    }
}

pub fn material(id: &str, slug: &str, de: &str, en: &str) -> SourceRecord {
    SourceRecord::new(CollectionKey::Material, id)
        .with_slug(slug)
        .with_field("title", text(de, en))
}

pub fn location(id: &str, slug: &str, name: &str) -> SourceRecord {
    SourceRecord::new(CollectionKey::Location, id)
        .with_slug(slug)
        .with_field("title", text(name, name))
        .with_field("city", FieldValue::Plain(json!("Berlin")))
}

pub fn creator(id: &str, slug: &str, name: &str, location: Option<&str>) -> SourceRecord {
    let record = SourceRecord::new(CollectionKey::Creator, id)
        .with_slug(slug)
        .with_field("name", text(name, name));
    match location {
        Some(l) => record.with_field("location", relation(CollectionKey::Location, &[l], false)),
        None => record,
    }
}

pub fn work(id: &str, slug: &str, title: &str, creator: Option<&str>, materials: &[&str]) -> SourceRecord {
    let mut record = SourceRecord::new(CollectionKey::Work, id)
        .with_slug(slug)
        .with_field("title", text(title, title))
        .with_field("materials", relation(CollectionKey::Material, materials, true));
    if let Some(c) = creator {
        record = record.with_field("creator", relation(CollectionKey::Creator, &[c], false));
    }
    record
}

/// The ledger digest the engine would record for `record` given `state`.
pub fn expected_hash(record: &SourceRecord, state: &ReconciliationState) -> String {
    let projection = project_record(record, spec(record.collection), &state.mappings).unwrap();
    content_hash(&projection.hashable())
}
