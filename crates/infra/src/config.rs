//! Configuration: pipeline tunables and backend selection.
//!
//! Everything has a default. `from_env()` overlays `DOCPIPE_*` variables;
//! `from_lookup()` does the same with any key → value function, which is what
//! tests use.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `DOCPIPE_VISIBILITY_TIMEOUT_MS` | lease length | 300000 |
//! | `DOCPIPE_HANDLER_TIMEOUT_MS` | handler deadline | 240000 |
//! | `DOCPIPE_POLL_INTERVAL_MS` | longest dequeue wait | 1000 |
//! | `DOCPIPE_MAX_DELIVERY_COUNT` | deliveries before dead-lettering | 10 |
//! | `DOCPIPE_WORKERS_PER_STEP` | pollers per step queue | 2 |
//! | `DOCPIPE_STEP_WORKERS` | per-step override, `extract=1,embed=4` | |
//! | `DOCPIPE_MAX_RETRIES` | transient retries per step | 3 |
//! | `DOCPIPE_STEP_RETRIES` | per-step override, `embed=6` | |
//! | `DOCPIPE_RETRY_BASE_DELAY_MS` / `DOCPIPE_RETRY_MAX_DELAY_MS` | backoff | 500 / 60000 |
//! | `DOCPIPE_MAX_CONFLICT_RETRIES` | revision conflicts tolerated per delivery | 8 |
//! | `DOCPIPE_QUEUE_PREFIX` | queue name prefix | `docpipe` |
//! | `DOCPIPE_STORE` | `memory`, `file`, `postgres` | `memory` |
//! | `DOCPIPE_QUEUE` | `memory`, `file`, `redis` | `memory` |
//! | `DOCPIPE_DATA_DIR` | root for file backends | `./data` |
//! | `DATABASE_URL` / `REDIS_URL` | connection strings | |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use docpipe_core::StepName;

use crate::orchestrator::RetryPolicy;
use crate::queue::{FileQueueBackend, InMemoryQueueBackend, QueueBackend, QueueError, QueueOptions};
use crate::store::{FileJobStore, InMemoryJobStore, JobStateStore, StoreError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("backend '{0}' requires the `{1}` feature")]
    FeatureDisabled(String, &'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Serde helper storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Pipeline engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// How long a dequeued message stays invisible to other workers.
    #[serde(with = "duration_ms")]
    pub visibility_timeout: Duration,
    /// A handler running longer than this counts as a transient failure.
    #[serde(with = "duration_ms")]
    pub handler_timeout: Duration,
    pub queue: QueueOptions,
    pub workers_per_step: usize,
    pub step_workers: BTreeMap<StepName, usize>,
    pub retry: RetryPolicy,
    /// Revision conflicts tolerated while applying one delivery.
    pub max_conflict_retries: u32,
    /// Starting delay after a failed poll; doubles up to `poll_error_backoff_max`.
    #[serde(with = "duration_ms")]
    pub poll_error_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub poll_error_backoff_max: Duration,
    pub queue_prefix: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(240),
            queue: QueueOptions::default(),
            workers_per_step: 2,
            step_workers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            max_conflict_retries: 8,
            poll_error_backoff: Duration::from_millis(200),
            poll_error_backoff_max: Duration::from_secs(30),
            queue_prefix: "docpipe".to_string(),
        }
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, raw).map(Duration::from_millis)
}

/// Parse `step=value,step=value`.
fn parse_step_map<T>(key: &str, raw: &str) -> Result<BTreeMap<StepName, T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let mut map = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (step, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected step=value, got '{pair}'"),
        })?;
        let step = StepName::parse(step.trim()).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        map.insert(step, parse(key, value)?);
    }
    Ok(map)
}

impl PipelineSettings {
    /// Defaults overlaid with `DOCPIPE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Self::default();
        let get = |key: &'static str| lookup(key).map(|v| (key, v));

        if let Some((k, v)) = get("DOCPIPE_VISIBILITY_TIMEOUT_MS") {
            s.visibility_timeout = parse_millis(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_HANDLER_TIMEOUT_MS") {
            s.handler_timeout = parse_millis(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_POLL_INTERVAL_MS") {
            s.queue.poll_interval = parse_millis(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_MAX_DELIVERY_COUNT") {
            s.queue.max_delivery_count = parse(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_WORKERS_PER_STEP") {
            s.workers_per_step = parse(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_STEP_WORKERS") {
            s.step_workers = parse_step_map(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_MAX_RETRIES") {
            s.retry.max_retries = parse(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_STEP_RETRIES") {
            s.retry.step_overrides = parse_step_map(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_RETRY_BASE_DELAY_MS") {
            s.retry.base_delay = parse_millis(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_RETRY_MAX_DELAY_MS") {
            s.retry.max_delay = parse_millis(k, &v)?;
        }
        if let Some((k, v)) = get("DOCPIPE_MAX_CONFLICT_RETRIES") {
            s.max_conflict_retries = parse(k, &v)?;
        }
        if let Some((_, v)) = get("DOCPIPE_QUEUE_PREFIX") {
            s.queue_prefix = v.trim().to_string();
        }

        s.validate()?;
        Ok(s)
    }

    /// Number of pollers for `step`.
    pub fn workers_for(&self, step: &StepName) -> usize {
        self.step_workers
            .get(step)
            .copied()
            .unwrap_or(self.workers_per_step)
    }

    /// Reject combinations that would break delivery guarantees.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handler_timeout >= self.visibility_timeout {
            return Err(ConfigError::Invalid(format!(
                "handler_timeout ({:?}) must be shorter than visibility_timeout ({:?}), \
                 otherwise a lease can expire while its handler still runs",
                self.handler_timeout, self.visibility_timeout
            )));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        // Every retry is one more delivery of the same message.
        let needed = self.retry.highest_limit().saturating_add(1);
        if self.queue.max_delivery_count <= needed {
            return Err(ConfigError::Invalid(format!(
                "max_delivery_count ({}) must exceed the highest retry limit + 1 ({needed})",
                self.queue.max_delivery_count
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry base_delay must not exceed max_delay".into(),
            ));
        }
        if self.queue_prefix.is_empty() {
            return Err(ConfigError::Invalid("queue_prefix must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    File { root: PathBuf },
    Postgres { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueConfig {
    Memory,
    File { root: PathBuf },
    Redis { url: String },
}

/// Which store and queue implementations to run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            queue: QueueConfig::Memory,
        }
    }
}

/// Connected backends, ready to hand to the orchestrator.
pub struct Backends {
    pub store: Arc<dyn JobStateStore>,
    pub queues: Arc<dyn QueueBackend>,
}

impl BackendConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(lookup("DOCPIPE_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let kind = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or_else(|| "memory".to_string())
        };

        let store = match kind("DOCPIPE_STORE").as_str() {
            "memory" => StoreConfig::Memory,
            "file" => StoreConfig::File {
                root: data_dir.join("pipelines"),
            },
            "postgres" => StoreConfig::Postgres {
                url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "DOCPIPE_STORE".into(),
                    message: format!("unknown store backend '{other}'"),
                });
            }
        };

        let queue = match kind("DOCPIPE_QUEUE").as_str() {
            "memory" => QueueConfig::Memory,
            "file" => QueueConfig::File {
                root: data_dir.join("queues"),
            },
            "redis" => QueueConfig::Redis {
                url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "DOCPIPE_QUEUE".into(),
                    message: format!("unknown queue backend '{other}'"),
                });
            }
        };

        Ok(Self { store, queue })
    }

    /// Build the configured store and queue backends.
    pub async fn connect(&self, settings: &PipelineSettings) -> Result<Backends, ConfigError> {
        let store: Arc<dyn JobStateStore> = match &self.store {
            StoreConfig::Memory => Arc::new(InMemoryJobStore::new()),
            StoreConfig::File { root } => Arc::new(FileJobStore::new(root.clone())),
            #[cfg(feature = "postgres")]
            StoreConfig::Postgres { url } => {
                let store = crate::store::PostgresJobStore::connect(url).await?;
                store.migrate().await?;
                Arc::new(store)
            }
            #[cfg(not(feature = "postgres"))]
            StoreConfig::Postgres { .. } => {
                return Err(ConfigError::FeatureDisabled("postgres".into(), "postgres"));
            }
        };

        let prefix = settings.queue_prefix.clone();
        let queues: Arc<dyn QueueBackend> = match &self.queue {
            QueueConfig::Memory => Arc::new(InMemoryQueueBackend::new(prefix, settings.queue)),
            QueueConfig::File { root } => {
                Arc::new(FileQueueBackend::new(root.clone(), prefix, settings.queue))
            }
            #[cfg(feature = "redis")]
            QueueConfig::Redis { url } => Arc::new(
                crate::queue::RedisQueueBackend::connect(url, prefix, settings.queue).await?,
            ),
            #[cfg(not(feature = "redis"))]
            QueueConfig::Redis { .. } => {
                return Err(ConfigError::FeatureDisabled("redis".into(), "redis"));
            }
        };

        info!(store = ?self.store, queue = ?self.queue, "pipeline backends ready");
        Ok(Backends { store, queues })
    }
}
