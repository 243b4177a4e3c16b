use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::models::CollectionKey;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub locales: LocaleConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// `sqlite` (local file) or `source` (settings documents in the source store).
    #[serde(default = "default_state_backend")]
    pub backend: String,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            path: default_state_path(),
        }
    }
}

fn default_state_backend() -> String {
    "sqlite".to_string()
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./data/mirror-state.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Overrides the hosted API URL derived from `project_id`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub project_id: String,
    pub dataset: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_source_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_version() -> String {
    "2023-05-03".to_string()
}
fn default_source_token_env() -> String {
    "SOURCE_TOKEN".to_string()
}

impl SourceConfig {
    pub fn api_base(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.api.sanity.io", self.project_id),
        }
    }

    /// Read token, if any. Public datasets can be queried without one.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    #[serde(default = "default_destination_url")]
    pub base_url: String,
    pub site_id: String,
    #[serde(default = "default_destination_token_env")]
    pub token_env: String,
    /// Minimum gap between the end of one request and the start of the next.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fixed wait before the single extra attempt of a rate-limited write.
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
    /// Gap between the primary and secondary locale writes of one update.
    #[serde(default = "default_secondary_delay_ms")]
    pub secondary_delay_ms: u64,
    #[serde(default = "default_publish")]
    pub publish: bool,
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: usize,
    /// Explicit collection ids; anything missing is resolved by slug.
    #[serde(default)]
    pub collections: BTreeMap<String, String>,
}

fn default_destination_url() -> String {
    "https://api.webflow.com/v2".to_string()
}
fn default_destination_token_env() -> String {
    "DESTINATION_TOKEN".to_string()
}
fn default_min_interval_ms() -> u64 {
    1100
}
fn default_max_retries() -> u32 {
    4
}
fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_rate_limit_cooldown_ms() -> u64 {
    60_000
}
fn default_secondary_delay_ms() -> u64 {
    500
}
fn default_publish() -> bool {
    true
}
fn default_publish_batch_size() -> usize {
    100
}

impl DestinationConfig {
    /// The bearer token. Missing is fatal before any remote call.
    pub fn token(&self) -> SyncResult<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "destination token not set (expected in ${})",
                    self.token_env
                ))
            })
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn secondary_delay(&self) -> Duration {
        Duration::from_millis(self.secondary_delay_ms)
    }

    /// Configured collection id override for `key`.
    pub fn collection_override(&self, key: CollectionKey) -> Option<&str> {
        self.collections.get(key.as_str()).map(String::as_str)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocaleConfig {
    /// Source field suffix and destination locale tag of the primary locale.
    #[serde(default = "default_primary_locale")]
    pub primary: String,
    #[serde(default = "default_secondary_locale")]
    pub secondary: Option<String>,
}

impl Default for LocaleConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_locale(),
            secondary: default_secondary_locale(),
        }
    }
}

fn default_primary_locale() -> String {
    "de".to_string()
}
fn default_secondary_locale() -> Option<String> {
    Some("en".to_string())
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7332".to_string(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    match config.state.backend.as_str() {
        "sqlite" | "source" => {}
        other => anyhow::bail!(
            "Unknown state backend: '{}'. Must be sqlite or source.",
            other
        ),
    }

    if config.source.base_url.is_none() && config.source.project_id.is_empty() {
        anyhow::bail!("source.project_id must be set when source.base_url is not");
    }

    if config.destination.site_id.is_empty() {
        anyhow::bail!("destination.site_id must not be empty");
    }

    if !(3..=5).contains(&config.destination.max_retries) {
        anyhow::bail!("destination.max_retries must be between 3 and 5");
    }

    if config.destination.publish_batch_size == 0 || config.destination.publish_batch_size > 100 {
        anyhow::bail!("destination.publish_batch_size must be in [1, 100]");
    }

    for key in config.destination.collections.keys() {
        key.parse::<CollectionKey>()
            .map_err(|e| anyhow::anyhow!("destination.collections: {}", e))?;
    }

    if config.locales.secondary.as_deref() == Some(config.locales.primary.as_str()) {
        anyhow::bail!("locales.secondary must differ from locales.primary");
    }

    Ok(config)
}
