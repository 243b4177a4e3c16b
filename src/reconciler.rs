//! Collection reconciler.
//!
//! Brings one destination collection in line with its source collection:
//!
//! 1. Fetch source records (optionally limited or narrowed to one id).
//! 2. Full mode: list destination items and rebuild mappings if the
//!    collection has none. Single-item mode lists nothing.
//! 3. Resolve each record's target: a live mapping, a slug adoption, or new.
//!    A mapping whose destination item is gone is purged and the record is
//!    treated as new.
//! 4. Delete orphans (full, unlimited runs only), before anything is created.
//! 5. Create new records, update changed ones, skip records whose content
//!    hash matches the ledger.
//! 6. Publish everything written.
//!
//! Per-record failures land in [`CollectionReport::failures`]; only failures
//! to read either side of the collection are returned as errors.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collections::{CollectionSpec, QueryScope};
use crate::destination::Destination;
use crate::error::{SyncError, SyncResult};
use crate::ledger::content_hash;
use crate::mapping::{rebuild_from_destination, RebuildCandidate};
use crate::models::{CollectionKey, DestinationRecord, FieldMap, Locale, SourceRecord};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::projector::{project_record, record_name, record_slug, Projection};
use crate::source::SourceStore;
use crate::state::ReconciliationState;

/// Shared flag requesting a cooperative stop between records.
pub type CancelFlag = Arc<AtomicBool>;

/// Per-run knobs for [`Reconciler`].
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub scope: QueryScope,
    /// Write every record regardless of the hash ledger.
    pub force: bool,
    pub publish: bool,
    pub publish_batch_size: usize,
    /// Pause between the primary and secondary locale writes of one item.
    pub secondary_delay: Duration,
    /// Wait before the single retry of a rate-limited write.
    pub rate_limit_cooldown: Duration,
    pub cancel: CancelFlag,
}

impl ReconcileOptions {
    pub fn single_item(&self) -> bool {
        self.scope.source_id.is_some()
    }

    /// Orphan deletion needs the complete source set.
    pub fn deletes_orphans(&self) -> bool {
        !self.single_item() && self.scope.limit.is_none()
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            scope: QueryScope::default(),
            force: false,
            publish: true,
            publish_batch_size: 100,
            secondary_delay: Duration::from_millis(500),
            rate_limit_cooldown: Duration::from_secs(60),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// One record or item that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    pub kind: String,
    pub message: String,
}

impl ItemFailure {
    fn new(source_id: Option<&str>, destination_id: Option<&str>, err: &SyncError) -> Self {
        Self {
            source_id: source_id.map(str::to_string),
            destination_id: destination_id.map(str::to_string),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of reconciling one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionReport {
    pub collection: CollectionKey,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Mappings established by slug matching rather than creation.
    pub adopted: usize,
    pub published: usize,
    pub failures: Vec<ItemFailure>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl CollectionReport {
    pub fn new(collection: CollectionKey) -> Self {
        Self {
            collection,
            created: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            adopted: 0,
            published: 0,
            failures: Vec::new(),
            cancelled: false,
        }
    }

    /// Records written to the destination.
    pub fn synced(&self) -> usize {
        self.created + self.updated
    }
}

/// Where a record's content goes.
enum Target {
    Existing(String),
    New,
}

struct Planned<'r> {
    record: &'r SourceRecord,
    projection: Projection,
    target: Target,
}

pub struct Reconciler {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn Destination>,
    progress: Arc<dyn SyncProgressReporter>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn Destination>,
        progress: Arc<dyn SyncProgressReporter>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            source,
            destination,
            progress,
            options,
        }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub async fn reconcile(
        &self,
        spec: &CollectionSpec,
        state: &mut ReconciliationState,
    ) -> SyncResult<CollectionReport> {
        let key = spec.key;
        let mut report = CollectionReport::new(key);

        let records = self.source.fetch_records(spec, &self.options.scope).await?;

        let listing = if self.options.single_item() {
            None
        } else {
            Some(self.destination.list_items(key).await?)
        };

        if let Some(ref listing) = listing {
            if state.mappings.count(key) == 0 && !records.is_empty() && !listing.is_empty() {
                report.adopted += rebuild_mappings(spec, &records, listing, state);
            }
        }

        let listed_ids: HashSet<&str> = listing
            .iter()
            .flatten()
            .map(|item| item.id.as_str())
            .collect();
        let current_ids: HashSet<&str> = records.iter().map(|r| r.source_id.as_str()).collect();

        // Items still mapped to records that left the source. Only a
        // complete source set can tell; they are free for slug adoption.
        let vanished_items: HashSet<String> = if self.options.deletes_orphans() {
            state
                .mappings
                .entries(key)
                .into_iter()
                .filter(|(source_id, _)| !current_ids.contains(source_id))
                .map(|(_, destination_id)| destination_id.to_string())
                .collect()
        } else {
            HashSet::new()
        };

        let mut unmapped_by_slug: HashMap<String, String> = listing
            .iter()
            .flatten()
            .filter(|item| {
                state.mappings.source_for(key, &item.id).is_none()
                    || vanished_items.contains(&item.id)
            })
            .filter_map(|item| Some((item.slug()?.to_string(), item.id.clone())))
            .collect();

        // Slugs of every current record, derivable or not yet projected.
        let current_slugs: HashSet<String> = records
            .iter()
            .filter_map(|r| record_slug(r, spec).ok())
            .collect();

        let mut claimed: HashSet<String> = HashSet::new();
        let mut planned: Vec<Planned<'_>> = Vec::with_capacity(records.len());

        for record in &records {
            if self.options.cancelled() {
                report.cancelled = true;
                break;
            }

            let mut target = Target::New;
            if let Some(mapped) = state.mappings.get(key, &record.source_id).map(str::to_string) {
                let alive = match listing {
                    Some(_) => listed_ids.contains(mapped.as_str()),
                    None => match self.destination.get_item(key, &mapped).await {
                        Ok(item) => item.is_some(),
                        Err(e) => {
                            claimed.insert(mapped.clone());
                            report.failures.push(ItemFailure::new(
                                Some(&record.source_id),
                                Some(&mapped),
                                &e,
                            ));
                            continue;
                        }
                    },
                };

                if alive {
                    claimed.insert(mapped.clone());
                    target = Target::Existing(mapped);
                } else {
                    warn!(
                        collection = %key,
                        source_id = %record.source_id,
                        destination_id = %mapped,
                        "mapping inconsistency: destination item is gone, recreating"
                    );
                    state.purge(key, &record.source_id);
                }
            }

            let projection = match project_record(record, spec, &state.mappings) {
                Ok(p) => p,
                Err(e) => {
                    warn!(collection = %key, source_id = %record.source_id, error = %e, "skipping record");
                    report
                        .failures
                        .push(ItemFailure::new(Some(&record.source_id), None, &e));
                    continue;
                }
            };

            if matches!(target, Target::New) {
                if let Some(existing) = unmapped_by_slug.remove(&projection.slug) {
                    debug!(
                        collection = %key,
                        source_id = %record.source_id,
                        destination_id = %existing,
                        "adopting destination item by slug"
                    );
                    if let Some(previous) =
                        state.mappings.source_for(key, &existing).map(str::to_string)
                    {
                        state.purge(key, &previous);
                    }
                    state.mappings.set(key, &record.source_id, &existing);
                    claimed.insert(existing.clone());
                    report.adopted += 1;
                    target = Target::Existing(existing);
                }
            }

            planned.push(Planned {
                record,
                projection,
                target,
            });
        }

        if let Some(ref listing) = listing {
            if self.options.deletes_orphans() && !report.cancelled {
                for orphan in select_orphans(listing, &claimed, &current_slugs, &vanished_items) {
                    self.delete_orphan(key, orphan, state, &mut report).await;
                }
                forget_vanished(key, &current_ids, state);
            }
        }

        let total = planned.len() as u64;
        let mut written: Vec<String> = Vec::new();
        for (n, plan) in planned.into_iter().enumerate() {
            if self.options.cancelled() {
                report.cancelled = true;
                break;
            }
            if let Some(id) = self.write(key, plan, state, &mut report).await {
                written.push(id);
            }
            self.progress.report(SyncProgressEvent::Records {
                collection: key,
                n: n as u64 + 1,
                total,
            });
        }

        self.publish(key, &written, &mut report).await;

        info!(
            collection = %key,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            adopted = report.adopted,
            failures = report.failures.len(),
            "collection reconciled"
        );
        Ok(report)
    }

    /// Write back-reference fields of `spec` (e.g. the works of a creator)
    /// from the current destination contents of the referencing collections.
    /// Returns the number of items updated.
    pub async fn link_back_references(
        &self,
        spec: &CollectionSpec,
        state: &ReconciliationState,
        report: &mut CollectionReport,
    ) -> SyncResult<usize> {
        if spec.back_references.is_empty() {
            return Ok(0);
        }

        let own = self.destination.list_items(spec.key).await?;
        let mut wanted: BTreeMap<String, FieldMap> = BTreeMap::new();
        for back in spec.back_references {
            let referencing = self.destination.list_items(back.from).await?;
            let index = back_reference_index(&referencing, back.via);
            for item in &own {
                let ids = index.get(item.id.as_str()).cloned().unwrap_or_default();
                wanted
                    .entry(item.id.clone())
                    .or_default()
                    .insert(back.field.to_string(), Value::from(ids));
            }
        }

        let mut updated = Vec::new();
        for item in &own {
            if self.options.cancelled() {
                report.cancelled = true;
                break;
            }
            // Only items this engine owns.
            if state.mappings.source_for(spec.key, &item.id).is_none() {
                continue;
            }
            let Some(fields) = wanted.get(&item.id) else {
                continue;
            };
            let current_matches = fields
                .iter()
                .all(|(name, value)| same_id_set(item.field_data.get(name), value));
            if current_matches {
                continue;
            }

            let result = self
                .with_cooldown(|| {
                    self.destination
                        .update_item(spec.key, &item.id, Locale::Primary, fields)
                })
                .await;
            match result {
                Ok(()) => updated.push(item.id.clone()),
                Err(e) => report
                    .failures
                    .push(ItemFailure::new(None, Some(&item.id), &e)),
            }
        }

        self.publish(spec.key, &updated, report).await;
        info!(collection = %spec.key, updated = updated.len(), "back references linked");
        Ok(updated.len())
    }

    async fn write(
        &self,
        key: CollectionKey,
        plan: Planned<'_>,
        state: &mut ReconciliationState,
        report: &mut CollectionReport,
    ) -> Option<String> {
        let source_id = plan.record.source_id.as_str();
        let hash = content_hash(&plan.projection.hashable());

        match plan.target {
            Target::Existing(id) => {
                if !self.options.force && state.hashes.matches(key, source_id, &hash) {
                    report.unchanged += 1;
                    return None;
                }

                let primary = self
                    .with_cooldown(|| {
                        self.destination
                            .update_item(key, &id, Locale::Primary, &plan.projection.primary)
                    })
                    .await;
                if let Err(e) = primary {
                    if e.is_not_found() {
                        state.purge(key, source_id);
                    }
                    report
                        .failures
                        .push(ItemFailure::new(Some(source_id), Some(&id), &e));
                    return None;
                }

                if let Err(e) = self.write_secondary(key, &id, &plan.projection).await {
                    report
                        .failures
                        .push(ItemFailure::new(Some(source_id), Some(&id), &e));
                    return Some(id);
                }

                state.hashes.set(key, source_id, hash);
                report.updated += 1;
                Some(id)
            }
            Target::New => {
                let created = self
                    .with_cooldown(|| self.destination.create_item(key, &plan.projection.primary))
                    .await;
                let id = match created {
                    Ok(id) => id,
                    Err(e) => {
                        report
                            .failures
                            .push(ItemFailure::new(Some(source_id), None, &e));
                        return None;
                    }
                };
                state.mappings.set(key, source_id, &id);
                debug!(collection = %key, source_id = source_id, destination_id = %id, "created");

                // Hash recorded only once both locales hold the content, so a
                // failed secondary write is retried next run.
                if let Err(e) = self.write_secondary(key, &id, &plan.projection).await {
                    report
                        .failures
                        .push(ItemFailure::new(Some(source_id), Some(&id), &e));
                    report.created += 1;
                    return Some(id);
                }

                state.hashes.set(key, source_id, hash);
                report.created += 1;
                Some(id)
            }
        }
    }

    async fn write_secondary(
        &self,
        key: CollectionKey,
        id: &str,
        projection: &Projection,
    ) -> SyncResult<()> {
        if !self.destination.has_secondary() || projection.secondary.is_empty() {
            return Ok(());
        }
        if !self.options.secondary_delay.is_zero() {
            tokio::time::sleep(self.options.secondary_delay).await;
        }
        self.with_cooldown(|| {
            self.destination
                .update_item(key, id, Locale::Secondary, &projection.secondary)
        })
        .await
    }

    async fn delete_orphan(
        &self,
        key: CollectionKey,
        orphan: &DestinationRecord,
        state: &mut ReconciliationState,
        report: &mut CollectionReport,
    ) {
        let source_id = state.mappings.source_for(key, &orphan.id).map(str::to_string);
        match self.destination.delete_item(key, &orphan.id).await {
            Ok(()) => {
                debug!(collection = %key, destination_id = %orphan.id, "deleted orphan");
                report.deleted += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                report.failures.push(ItemFailure::new(
                    source_id.as_deref(),
                    Some(&orphan.id),
                    &e,
                ));
                return;
            }
        }
        if let Some(source_id) = source_id {
            state.purge(key, &source_id);
        }
    }

    async fn publish(&self, key: CollectionKey, ids: &[String], report: &mut CollectionReport) {
        if !self.options.publish || ids.is_empty() {
            return;
        }
        for batch in ids.chunks(self.options.publish_batch_size.max(1)) {
            match self
                .with_cooldown(|| self.destination.publish_items(key, batch))
                .await
            {
                Ok(()) => report.published += batch.len(),
                Err(e) => {
                    warn!(collection = %key, items = batch.len(), error = %e, "publish failed");
                    report.failures.push(ItemFailure::new(None, None, &e));
                }
            }
        }
    }

    /// Run `op`; if it exhausted the rate-limit budget, wait the cooldown
    /// and run it exactly once more.
    async fn with_cooldown<T, F, Fut>(&self, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        match op().await {
            Err(e) if e.is_rate_limited() => {
                warn!(
                    cooldown_ms = self.options.rate_limit_cooldown.as_millis() as u64,
                    "rate limit exhausted, cooling down before one more attempt"
                );
                tokio::time::sleep(self.options.rate_limit_cooldown).await;
                op().await
            }
            other => other,
        }
    }
}

fn rebuild_mappings(
    spec: &CollectionSpec,
    records: &[SourceRecord],
    listing: &[DestinationRecord],
    state: &mut ReconciliationState,
) -> usize {
    let candidates: Vec<RebuildCandidate<'_>> = records
        .iter()
        .map(|r| RebuildCandidate {
            source_id: &r.source_id,
            slug: r.slug.as_deref(),
            name: record_name(r, spec),
        })
        .collect();
    let rebuilt = rebuild_from_destination(&mut state.mappings, spec.key, &candidates, listing);
    if rebuilt > 0 {
        info!(collection = %spec.key, rebuilt = rebuilt, "rebuilt identity mappings from destination");
    }
    rebuilt
}

/// Listed items claimed by no current record, by mapping or by slug.
///
/// An item of a vanished record that no current record adopted is an
/// orphan even when its slug matches a current record: that record is
/// already bound to another item.
pub fn select_orphans<'a>(
    listing: &'a [DestinationRecord],
    claimed: &HashSet<String>,
    current_slugs: &HashSet<String>,
    vanished_items: &HashSet<String>,
) -> Vec<&'a DestinationRecord> {
    listing
        .iter()
        .filter(|item| !claimed.contains(&item.id))
        .filter(|item| {
            vanished_items.contains(&item.id)
                || item.slug().map_or(true, |s| !current_slugs.contains(s))
        })
        .collect()
}

/// Drop state for source records that no longer exist.
fn forget_vanished(key: CollectionKey, current: &HashSet<&str>, state: &mut ReconciliationState) {
    let vanished: Vec<String> = state
        .mappings
        .entries(key)
        .into_iter()
        .filter(|(source_id, _)| !current.contains(source_id))
        .map(|(source_id, _)| source_id.to_string())
        .collect();
    for source_id in vanished {
        state.purge(key, &source_id);
    }
}

/// Map from referenced item id to the ids of the items referencing it
/// through field `via`, sorted.
pub fn back_reference_index<'a>(
    referencing: &'a [DestinationRecord],
    via: &str,
) -> HashMap<&'a str, Vec<String>> {
    let mut index: HashMap<&str, Vec<String>> = HashMap::new();
    for item in referencing {
        let targets: Vec<&str> = match item.field_data.get(via) {
            Some(Value::String(id)) => vec![id.as_str()],
            Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        for target in targets {
            index.entry(target).or_default().push(item.id.clone());
        }
    }
    for ids in index.values_mut() {
        ids.sort();
        ids.dedup();
    }
    index
}

fn same_id_set(current: Option<&Value>, wanted: &Value) -> bool {
    let ids = |v: &Value| -> Vec<String> {
        let mut ids: Vec<String> = v
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    };
    match current {
        Some(current) => ids(current) == ids(wanted),
        None => ids(wanted).is_empty(),
    }
}
