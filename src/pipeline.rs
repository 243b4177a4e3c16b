//! Pipeline scheduler.
//!
//! Runs the collection reconciler over every collection in dependency phase
//! order, then fills back-reference fields once all forward relations exist.
//!
//! ```text
//! load state ─▶ phase 1 ─▶ phase 2 ─▶ phase 3 ─▶ back references ─▶ save state
//!                  │           │          │
//!                  └── state saved after every collection ──┘
//! ```
//!
//! A collection that cannot be read is reported and skipped; the run goes
//! on. Only configuration errors and an unreachable destination (raised by
//! [`Pipeline::connect`]) end a run early.

use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::collections::{self, CollectionSpec, QueryScope};
use crate::config::Config;
use crate::destination::{Destination, RestDestination};
use crate::error::{SyncError, SyncResult};
use crate::models::CollectionKey;
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::reconciler::{CancelFlag, CollectionReport, ReconcileOptions, Reconciler};
use crate::remote::RemoteClient;
use crate::source::{HttpSource, SourceStore};
use crate::state::{open_backend, ReconciliationState, StateBackend};

/// What one run covers.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Restrict the run to one collection.
    pub only: Option<CollectionKey>,
    /// Reconcile a single source record; requires `only`.
    pub item_id: Option<String>,
    /// Reconcile at most this many records per collection.
    pub limit: Option<usize>,
    /// Ignore the hash ledger and write every record.
    pub force: bool,
    /// Overrides `destination.publish` for this run.
    pub publish: Option<bool>,
    pub cancel: CancelFlag,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            only: None,
            item_id: None,
            limit: None,
            force: false,
            publish: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> SyncResult<()> {
        if self.item_id.is_some() && self.only.is_none() {
            return Err(SyncError::Config(
                "single-item sync needs a collection".to_string(),
            ));
        }
        if self.item_id.as_deref() == Some("") {
            return Err(SyncError::Config("item id must not be empty".to_string()));
        }
        if self.limit == Some(0) {
            return Err(SyncError::Config("limit must be at least 1".to_string()));
        }
        Ok(())
    }

    fn single_item(&self) -> bool {
        self.item_id.is_some()
    }
}

/// A collection that could not be reconciled at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionError {
    pub collection: CollectionKey,
    pub kind: String,
    pub message: String,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub total_synced: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub adopted: usize,
    pub published: usize,
    /// Failed records plus failed collections.
    pub failures: usize,
    pub duration_ms: u64,
    pub collections: Vec<CollectionReport>,
    pub errors: Vec<CollectionError>,
    pub cancelled: bool,
}

impl RunReport {
    fn absorb(&mut self, report: CollectionReport) {
        self.created += report.created;
        self.updated += report.updated;
        self.unchanged += report.unchanged;
        self.deleted += report.deleted;
        self.adopted += report.adopted;
        self.published += report.published;
        self.failures += report.failures.len();
        self.total_synced = self.created + self.updated;
        self.cancelled |= report.cancelled;
        self.collections.push(report);
    }

    fn record_error(&mut self, collection: CollectionKey, err: &SyncError) {
        self.failures += 1;
        self.errors.push(CollectionError {
            collection,
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Run-independent settings taken from `[destination]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub publish: bool,
    pub publish_batch_size: usize,
    pub secondary_delay: Duration,
    pub rate_limit_cooldown: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            publish: config.destination.publish,
            publish_batch_size: config.destination.publish_batch_size,
            secondary_delay: config.destination.secondary_delay(),
            rate_limit_cooldown: config.destination.rate_limit_cooldown(),
        }
    }
}

pub struct Pipeline {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn Destination>,
    state: Arc<dyn StateBackend>,
    settings: PipelineSettings,
    progress: Arc<dyn SyncProgressReporter>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn Destination>,
        state: Arc<dyn StateBackend>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            destination,
            state,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Wire the pipeline to the configured stores.
    ///
    /// Fails when credentials are missing or the destination site cannot be
    /// resolved.
    pub async fn connect(config: &Config) -> SyncResult<Self> {
        let client = Arc::new(RemoteClient::from_config(&config.destination)?);
        let destination =
            RestDestination::connect(&config.destination, &config.locales, client).await?;
        let source = HttpSource::from_config(config)?;
        let state = open_backend(config).await?;

        Ok(Self::new(
            Arc::new(source),
            Arc::new(destination),
            state,
            PipelineSettings::from_config(config),
        ))
    }

    pub async fn run(&self, options: RunOptions) -> SyncResult<RunReport> {
        self.run_with_progress(options, self.progress.clone()).await
    }

    /// Like [`Pipeline::run`], reporting to `progress` instead of the
    /// pipeline's own reporter.
    pub async fn run_with_progress(
        &self,
        options: RunOptions,
        progress: Arc<dyn SyncProgressReporter>,
    ) -> SyncResult<RunReport> {
        options.validate()?;
        let started = Instant::now();

        let mut state = ReconciliationState::load(self.state.as_ref()).await;
        let reconciler = Reconciler::new(
            self.source.clone(),
            self.destination.clone(),
            progress.clone(),
            ReconcileOptions {
                scope: QueryScope {
                    limit: options.limit,
                    source_id: options.item_id.clone(),
                },
                force: options.force,
                publish: options.publish.unwrap_or(self.settings.publish),
                publish_batch_size: self.settings.publish_batch_size,
                secondary_delay: self.settings.secondary_delay,
                rate_limit_cooldown: self.settings.rate_limit_cooldown,
                cancel: options.cancel.clone(),
            },
        );

        let mut report = RunReport::default();
        let outcome = self
            .run_phases(&reconciler, &options, progress.as_ref(), &mut state, &mut report)
            .await;

        // Flush even when a fatal error ends the run early.
        if let Err(e) = state.save(self.state.as_ref()).await {
            warn!(error = %e, "failed to save reconciliation state");
            outcome?;
            return Err(e);
        }
        outcome?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            synced = report.total_synced,
            unchanged = report.unchanged,
            deleted = report.deleted,
            failures = report.failures,
            duration_ms = report.duration_ms,
            cancelled = report.cancelled,
            "run finished"
        );
        progress.report(SyncProgressEvent::Finished {
            report: report.clone(),
        });
        Ok(report)
    }

    async fn run_phases(
        &self,
        reconciler: &Reconciler,
        options: &RunOptions,
        progress: &dyn SyncProgressReporter,
        state: &mut ReconciliationState,
        report: &mut RunReport,
    ) -> SyncResult<()> {
        for (phase, specs) in collections::phases() {
            let specs: Vec<&CollectionSpec> = specs
                .into_iter()
                .filter(|s| options.only.map_or(true, |only| only == s.key))
                .collect();
            if specs.is_empty() {
                continue;
            }

            progress.report(SyncProgressEvent::Phase {
                phase,
                collections: specs.iter().map(|s| s.key).collect(),
            });

            for spec in specs {
                if reconciler.options().cancelled() {
                    report.cancelled = true;
                    return Ok(());
                }
                progress.report(SyncProgressEvent::CollectionStarted { collection: spec.key });

                match reconciler.reconcile(spec, state).await {
                    Ok(collection_report) => {
                        progress.report(SyncProgressEvent::CollectionFinished {
                            report: collection_report.clone(),
                        });
                        report.absorb(collection_report);
                    }
                    Err(e @ SyncError::Config(_)) => return Err(e),
                    Err(e) => {
                        warn!(collection = %spec.key, error = %e, "collection failed");
                        progress.report(SyncProgressEvent::CollectionFailed {
                            collection: spec.key,
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        });
                        report.record_error(spec.key, &e);
                    }
                }

                if let Err(e) = state.save(self.state.as_ref()).await {
                    warn!(collection = %spec.key, error = %e, "failed to save state");
                    report.record_error(spec.key, &e);
                }
            }
        }

        // Back references need every referencing record; partial runs skip them.
        if options.single_item() || options.limit.is_some() || report.cancelled {
            return Ok(());
        }
        for spec in collections::all() {
            if spec.back_references.is_empty() || !links_in_scope(spec, options.only) {
                continue;
            }
            let mut linkage = CollectionReport::new(spec.key);
            match reconciler
                .link_back_references(spec, state, &mut linkage)
                .await
            {
                Ok(updated) => {
                    progress.report(SyncProgressEvent::Linked {
                        collection: spec.key,
                        updated,
                    });
                    report.published += linkage.published;
                    report.failures += linkage.failures.len();
                    report.cancelled |= linkage.cancelled;
                }
                Err(e) => {
                    warn!(collection = %spec.key, error = %e, "back reference linkage failed");
                    report.record_error(spec.key, &e);
                }
            }
        }

        Ok(())
    }
}

/// Whether a run restricted to `only` touches `spec`'s back references.
fn links_in_scope(spec: &CollectionSpec, only: Option<CollectionKey>) -> bool {
    match only {
        None => true,
        Some(key) => key == spec.key || spec.back_references.iter().any(|b| b.from == key),
    }
}
