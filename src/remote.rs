//! Rate-limited client for the destination store's REST API.
//!
//! Every request issued through one [`RemoteClient`] shares a single
//! "last request finished" instant, so the minimum inter-request interval
//! holds across all collections regardless of which one issued the call.
//!
//! # Retry Strategy
//!
//! - HTTP 429 → retry with exponential backoff, then [`SyncError::RateLimitExhausted`]
//! - HTTP 5xx, network errors and timeouts → same backoff, then [`SyncError::Transient`]
//! - Other non-2xx → [`SyncError::Remote`] immediately
//! - Backoff: `base * 2^attempt`, capped at `max_backoff`; a `Retry-After`
//!   header (seconds) replaces the computed delay

use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DestinationConfig;
use crate::error::{SyncError, SyncResult};

/// Spacing and retry settings for a [`RemoteClient`].
#[derive(Debug, Clone)]
pub struct RemotePolicy {
    pub min_interval: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl RemotePolicy {
    pub fn from_config(config: &DestinationConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = match retry_after {
            Some(d) => d,
            None => self
                .base_backoff
                .saturating_mul(2u32.saturating_pow(attempt.min(16))),
        };
        delay.min(self.max_backoff)
    }
}

/// One request against the destination API, relative to the base URL.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RemoteRequest {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// Why a single attempt did not succeed.
enum Attempt {
    RateLimited { retry_after: Option<Duration> },
    Transient(String),
    Fatal(SyncError),
}

/// HTTP client enforcing request spacing and bounded retries.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    policy: RemotePolicy,
    last_request: Mutex<Option<Instant>>,
}

impl RemoteClient {
    pub fn new(base_url: &str, token: String, policy: RemotePolicy) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            policy,
            last_request: Mutex::new(None),
        })
    }

    /// Build a client from the `[destination]` section, reading the token
    /// from the environment.
    pub fn from_config(config: &DestinationConfig) -> SyncResult<Self> {
        let token = config.token()?;
        Self::new(&config.base_url, token, RemotePolicy::from_config(config))
    }

    pub fn policy(&self) -> &RemotePolicy {
        &self.policy
    }

    /// Issue `request`, retrying rate-limit and transient failures.
    ///
    /// Returns the parsed JSON body, or `Value::Null` for DELETE requests
    /// and empty bodies.
    pub async fn execute(&self, request: &RemoteRequest) -> SyncResult<Value> {
        let mut attempt: u32 = 0;
        loop {
            let failure = match self.attempt(request).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            method = %request.method,
                            path = %request.path,
                            attempts = attempt + 1,
                            "request succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let (retry_after, reason) = match failure {
                Attempt::Fatal(err) => return Err(err),
                Attempt::RateLimited { retry_after } => (retry_after, None),
                Attempt::Transient(message) => (None, Some(message)),
            };

            if attempt >= self.policy.max_retries {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    attempts = attempt + 1,
                    "retry ceiling reached"
                );
                return Err(match reason {
                    None => SyncError::RateLimitExhausted {
                        attempts: attempt + 1,
                    },
                    Some(message) => SyncError::Transient {
                        attempts: attempt + 1,
                        message,
                    },
                });
            }

            let delay = self.policy.backoff(attempt, retry_after);
            debug!(
                method = %request.method,
                path = %request.path,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                reason = reason.as_deref().unwrap_or("rate limited"),
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One spaced attempt. Holds the timestamp lock for the whole call so
    /// concurrent callers queue behind each other.
    async fn attempt(&self, request: &RemoteRequest) -> Result<Value, Attempt> {
        let mut last = self.last_request.lock().await;
        if let Some(finished) = *last {
            let elapsed = finished.elapsed();
            if elapsed < self.policy.min_interval {
                tokio::time::sleep(self.policy.min_interval - elapsed).await;
            }
        }

        let result = self.send(request).await;
        *last = Some(Instant::now());
        result
    }

    async fn send(&self, request: &RemoteRequest) -> Result<Value, Attempt> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Attempt::Transient(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Attempt::RateLimited { retry_after });
        }

        let body = response
            .text()
            .await
            .map_err(|e| Attempt::Transient(e.to_string()))?;

        if status.is_server_error() {
            return Err(Attempt::Transient(format!("{}: {}", status, body)));
        }

        if !status.is_success() {
            return Err(Attempt::Fatal(SyncError::Remote {
                status: status.as_u16(),
                body,
            }));
        }

        if request.method == Method::DELETE
            || status == StatusCode::NO_CONTENT
            || body.trim().is_empty()
        {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| {
            Attempt::Fatal(SyncError::Remote {
                status: status.as_u16(),
                body: format!("invalid JSON body ({}): {}", e, body),
            })
        })
    }
}
