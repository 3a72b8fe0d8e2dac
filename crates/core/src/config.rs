//! Configuration surface, loaded from a TOML file at process start.
//!
//! Everything has a working default so an embedded deployment starts with
//! no config file at all; validation failures at load time are fatal
//! (process exits non-zero).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ConveyorError, Result};
use crate::models::{parse_duration, ScheduleEntry, ScheduleSpec};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub beat: BeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub default_queue: String,
    pub lease_duration_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            lease_duration_seconds: 60,
            poll_interval_ms: 100,
        }
    }
}

impl BrokerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `"memory"` for the in-process store, or a sqlite url such as
    /// `"sqlite:conveyor.db"`.
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "memory".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stable worker identity; defaults to `<hostname>-<short uuid>`.
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub drain_timeout_seconds: u64,
    /// Local retries for event-store writes before giving the envelope
    /// back for redelivery.
    pub store_retry_attempts: u32,
    pub store_retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: 4,
            queues: vec!["default".to_string()],
            drain_timeout_seconds: 30,
            store_retry_attempts: 5,
            store_retry_delay_ms: 200,
        }
    }
}

impl WorkerConfig {
    pub fn effective_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}", &suffix[..8])
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn store_retry_delay(&self) -> Duration {
        Duration::from_millis(self.store_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_interval_seconds: u64,
    pub multiplier: f64,
    pub max_interval_seconds: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 2,
            multiplier: 2.0,
            max_interval_seconds: 300,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_interval: Duration::from_secs(self.base_interval_seconds),
            multiplier: self.multiplier,
            max_interval: Duration::from_secs(self.max_interval_seconds),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    pub tick_interval_ms: u64,
    pub leader_ttl_seconds: u64,
    pub lock_name: String,
    /// Backfill boundaries missed while the scheduler was down. Off by
    /// default to avoid bursty backlogs after downtime.
    pub catch_up: bool,
    pub schedule: Vec<ScheduleEntryConfig>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            leader_ttl_seconds: 10,
            lock_name: "conveyor-beat".to_string(),
            catch_up: false,
            schedule: Vec::new(),
        }
    }
}

impl BeatConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_seconds)
    }

    pub fn entries(&self) -> Result<Vec<ScheduleEntry>> {
        self.schedule.iter().map(|c| c.to_entry()).collect()
    }
}

/// One `[[beat.schedule]]` block: exactly one of `every` / `cron`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntryConfig {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub every: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleEntryConfig {
    pub fn to_entry(&self) -> Result<ScheduleEntry> {
        let spec = match (&self.every, &self.cron) {
            (Some(every), None) => ScheduleSpec::interval(parse_duration(every)?)?,
            (None, Some(expr)) => ScheduleSpec::cron(expr)?,
            _ => {
                return Err(ConveyorError::InvalidSchedule(format!(
                    "schedule entry {} must set exactly one of `every` / `cron`",
                    self.name
                )))
            }
        };
        let mut entry = ScheduleEntry::new(&self.name, &self.task, spec);
        entry.args = self.args.clone();
        entry.kwargs = self.kwargs.clone();
        entry.queue = self.queue.clone();
        entry.enabled = self.enabled;
        Ok(entry)
    }
}

impl AppConfig {
    /// Load from a TOML file, or start from defaults when no path is given.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(Path::new(path)).map_err(|e| {
                    ConveyorError::Configuration(format!("cannot read {path}: {e}"))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ConveyorError::Configuration(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(ConveyorError::Configuration(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.worker.queues.is_empty() {
            return Err(ConveyorError::Configuration(
                "worker.queues must not be empty".to_string(),
            ));
        }
        if self.broker.lease_duration_seconds == 0 {
            return Err(ConveyorError::Configuration(
                "broker.lease_duration_seconds must be at least 1".to_string(),
            ));
        }
        if self.beat.tick_interval_ms == 0 {
            return Err(ConveyorError::Configuration(
                "beat.tick_interval_ms must be at least 1".to_string(),
            ));
        }
        // Surface schedule mistakes at startup rather than on first tick.
        self.beat.entries().map(|_| ())
    }
}
