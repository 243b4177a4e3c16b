//! Reconciliation state and its persistence.
//!
//! [`ReconciliationState`] is owned by the pipeline for the duration of a
//! run and handed to the reconciler by `&mut`. It is stored as named JSON
//! records through a [`StateBackend`]:
//!
//! | Key | Content |
//! |-----|---------|
//! | `identity-mappings` | `{ "collection:sourceId": "destinationId" }` |
//! | `content-hashes` | `{ "collection:sourceId": "hex digest" }` |
//! | `asset-mappings` | `{ "sourceUrl": "destinationUrl" }`, kept for the asset uploader |
//!
//! Unreadable records load as empty. A lost mapping heals through slug
//! adoption and a lost hash costs one redundant update, so neither aborts a
//! run.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::Config;
use crate::error::SyncResult;
use crate::ledger::HashLedger;
use crate::mapping::IdentityMap;
use crate::models::CollectionKey;

pub const MAPPINGS_KEY: &str = "identity-mappings";
pub const HASHES_KEY: &str = "content-hashes";
pub const ASSETS_KEY: &str = "asset-mappings";

/// Key/value storage for the persisted state records.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn read(&self, key: &str) -> SyncResult<Option<String>>;
    async fn write(&self, key: &str, value: &str) -> SyncResult<()>;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconciliationState {
    pub mappings: IdentityMap,
    pub hashes: HashLedger,
    pub assets: BTreeMap<String, String>,
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all records. A record that cannot be read starts empty.
    pub async fn load(backend: &dyn StateBackend) -> Self {
        let mappings = read_or_warn(backend, MAPPINGS_KEY).await;
        let hashes = read_or_warn(backend, HASHES_KEY).await;
        let assets = read_or_warn(backend, ASSETS_KEY).await;

        let assets = match assets.map(|raw| serde_json::from_str(&raw)) {
            None => BTreeMap::new(),
            Some(Ok(map)) => map,
            Some(Err(e)) => {
                warn!(error = %e, "asset mappings unreadable, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            mappings: IdentityMap::from_json(mappings.as_deref()),
            hashes: HashLedger::from_json(hashes.as_deref()),
            assets,
        }
    }

    pub async fn save(&self, backend: &dyn StateBackend) -> SyncResult<()> {
        backend.write(MAPPINGS_KEY, &self.mappings.to_json()).await?;
        backend.write(HASHES_KEY, &self.hashes.to_json()).await?;
        let assets = serde_json::to_string(&self.assets).unwrap_or_else(|_| "{}".to_string());
        backend.write(ASSETS_KEY, &assets).await?;
        Ok(())
    }

    /// Forget a record entirely: its mapping and its hash.
    pub fn purge(&mut self, collection: CollectionKey, source_id: &str) {
        self.mappings.delete(collection, source_id);
        self.hashes.delete(collection, source_id);
    }

    /// Drop mappings and hashes of one collection.
    pub fn reset_collection(&mut self, collection: CollectionKey) {
        self.mappings.clear_collection(collection);
        self.hashes.clear_collection(collection);
    }
}

async fn read_or_warn(backend: &dyn StateBackend, key: &str) -> Option<String> {
    match backend.read(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key = key, error = %e, "state record unavailable, starting empty");
            None
        }
    }
}

/// State in the local SQLite database.
pub struct SqliteStateBackend {
    pool: SqlitePool,
}

impl SqliteStateBackend {
    pub async fn open(path: &Path) -> SyncResult<Self> {
        let pool = crate::db::connect(path).await?;
        crate::migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateBackend for SqliteStateBackend {
    async fn read(&self, key: &str) -> SyncResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local state, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStateBackend {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn read(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Open the backend selected by `[state].backend`.
pub async fn open_backend(config: &Config) -> SyncResult<Arc<dyn StateBackend>> {
    match config.state.backend.as_str() {
        "source" => Ok(Arc::new(crate::source::HttpSource::from_config(config)?)),
        _ => Ok(Arc::new(SqliteStateBackend::open(&config.state.path).await?)),
    }
}
