//! Runtime configuration.
//!
//! Loaded from an optional TOML file (`--config` or `RECALL_CONFIG`), then
//! overridden field by field from `RECALL_*` environment variables. Every
//! field has a default, so an empty file is a valid configuration.
//! Backing-store credentials are not part of this file; they come from the
//! `SURREALDB_*` variables read by [`recall_state::CloudConfig`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordination::CoordinationConfig;
use crate::memory::{ConsolidationPolicy, DecayPolicy, MemoryStoreConfig, RelationshipConfig};
use crate::retry::RetryPolicy;
use crate::worker::WorkerSchedule;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "RECALL_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecallConfig {
    pub cache: CacheSection,
    pub sync: SyncSection,
    pub consolidation: ConsolidationSection,
    pub relationships: RelationshipConfig,
    pub remote: RemoteSection,
    pub coordination: CoordinationSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub capacity: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub interval_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolidationSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub older_than_days: u64,
    pub min_importance: f64,
    pub decay: DecayPolicy,
}

impl Default for ConsolidationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            older_than_days: 30,
            min_importance: 0.3,
            decay: DecayPolicy::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSection {
    /// Explicit SurrealDB URL. When unset, `SURREALDB_*` cloud settings are
    /// tried and then the local directory.
    pub endpoint: Option<String>,
    pub local_path: PathBuf,
    /// Bound on single foreground calls.
    pub timeout_ms: u64,
    /// Bound on establishing the connection at startup.
    pub connect_timeout_ms: u64,
    /// Spacing of reconnection attempts while degraded.
    pub probe_interval_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            local_path: PathBuf::from(".recall/db"),
            timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            probe_interval_secs: 15,
        }
    }
}

impl RemoteSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationSection {
    /// Applied only when the system state is first created.
    pub emergency_stop: bool,
    pub system_version: String,
    pub reconcile_interval_secs: u64,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            emergency_stop: false,
            system_version: env!("CARGO_PKG_VERSION").to_string(),
            reconcile_interval_secs: 60,
        }
    }
}

impl RecallConfig {
    /// Load from `path`, or from `RECALL_CONFIG`, or defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Override fields from `RECALL_*` variables, read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvOverrides { lookup };
        env.parse("RECALL_CACHE_CAPACITY", &mut self.cache.capacity)?;
        env.parse("RECALL_SYNC_INTERVAL_SECS", &mut self.sync.interval_secs)?;
        env.parse("RECALL_SYNC_MAX_ATTEMPTS", &mut self.sync.retry.max_attempts)?;
        env.parse("RECALL_CONSOLIDATION_ENABLED", &mut self.consolidation.enabled)?;
        env.parse(
            "RECALL_CONSOLIDATION_INTERVAL_SECS",
            &mut self.consolidation.interval_secs,
        )?;
        env.parse(
            "RECALL_CONSOLIDATION_OLDER_THAN_DAYS",
            &mut self.consolidation.older_than_days,
        )?;
        env.parse(
            "RECALL_CONSOLIDATION_MIN_IMPORTANCE",
            &mut self.consolidation.min_importance,
        )?;
        if let Some(endpoint) = env.text("RECALL_REMOTE_ENDPOINT") {
            self.remote.endpoint = Some(endpoint);
        }
        if let Some(path) = env.text("RECALL_REMOTE_LOCAL_PATH") {
            self.remote.local_path = PathBuf::from(path);
        }
        env.parse("RECALL_REMOTE_TIMEOUT_MS", &mut self.remote.timeout_ms)?;
        env.parse("RECALL_EMERGENCY_STOP", &mut self.coordination.emergency_stop)?;
        if let Some(version) = env.text("RECALL_SYSTEM_VERSION") {
            self.coordination.system_version = version;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            })
        }

        if self.cache.capacity == 0 {
            return invalid("cache.capacity", "must be > 0");
        }
        if self.sync.interval_secs == 0 {
            return invalid("sync.interval_secs", "must be > 0");
        }
        if self.sync.retry.max_attempts == 0 {
            return invalid("sync.retry.max_attempts", "must be >= 1");
        }
        if self.sync.retry.attempt_timeout_ms == 0 {
            return invalid("sync.retry.attempt_timeout_ms", "must be > 0");
        }
        if self.consolidation.interval_secs == 0 {
            return invalid("consolidation.interval_secs", "must be > 0");
        }
        if !(0.0..=1.0).contains(&self.consolidation.min_importance) {
            return invalid("consolidation.min_importance", "must be within [0, 1]");
        }
        match self.consolidation.decay {
            DecayPolicy::None => {}
            DecayPolicy::Linear { per_day, floor } => {
                if per_day.is_nan() || per_day < 0.0 {
                    return invalid("consolidation.decay.per_day", "must be >= 0");
                }
                if !(0.0..=1.0).contains(&floor) {
                    return invalid("consolidation.decay.floor", "must be within [0, 1]");
                }
            }
            DecayPolicy::HalfLife { days, floor } => {
                if days.is_nan() || days <= 0.0 {
                    return invalid("consolidation.decay.days", "must be > 0");
                }
                if !(0.0..=1.0).contains(&floor) {
                    return invalid("consolidation.decay.floor", "must be within [0, 1]");
                }
            }
        }
        if !(0.0..=1.0).contains(&self.relationships.similarity_threshold) {
            return invalid("relationships.similarity_threshold", "must be within [0, 1]");
        }
        if self.remote.timeout_ms == 0 {
            return invalid("remote.timeout_ms", "must be > 0");
        }
        if self.remote.connect_timeout_ms == 0 {
            return invalid("remote.connect_timeout_ms", "must be > 0");
        }
        if self.remote.local_path.as_os_str().is_empty() {
            return invalid("remote.local_path", "must not be empty");
        }
        if self
            .remote
            .endpoint
            .as_deref()
            .is_some_and(|e| e.trim().is_empty())
        {
            return invalid("remote.endpoint", "must not be empty when set");
        }
        if self.coordination.system_version.trim().is_empty() {
            return invalid("coordination.system_version", "must not be empty");
        }
        if self.coordination.reconcile_interval_secs == 0 {
            return invalid("coordination.reconcile_interval_secs", "must be > 0");
        }
        Ok(())
    }

    pub fn memory_store_config(&self) -> MemoryStoreConfig {
        MemoryStoreConfig {
            cache_capacity: self.cache.capacity,
            remote_timeout: self.remote.timeout(),
            probe_interval: self.remote.probe_interval(),
            retry: self.sync.retry.clone(),
            relationships: self.relationships.clone(),
        }
    }

    pub fn coordination_config(&self) -> CoordinationConfig {
        CoordinationConfig {
            system_version: self.coordination.system_version.clone(),
            emergency_stop: self.coordination.emergency_stop,
            remote_timeout: self.remote.timeout(),
            probe_interval: self.remote.probe_interval(),
            retry: self.sync.retry.clone(),
        }
    }

    pub fn consolidation_policy(&self) -> ConsolidationPolicy {
        ConsolidationPolicy::new(
            Duration::from_secs(self.consolidation.older_than_days.saturating_mul(86_400)),
            self.consolidation.min_importance,
        )
        .with_decay(self.consolidation.decay)
    }

    pub fn worker_schedule(&self) -> WorkerSchedule {
        WorkerSchedule {
            sync_interval: Duration::from_secs(self.sync.interval_secs),
            consolidation_interval: self
                .consolidation
                .enabled
                .then(|| Duration::from_secs(self.consolidation.interval_secs)),
            consolidation_policy: self.consolidation_policy(),
            reconcile_interval: Duration::from_secs(self.coordination.reconcile_interval_secs),
        }
    }
}

struct EnvOverrides<F> {
    lookup: F,
}

impl<F> EnvOverrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn text(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &'static str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.text(name) {
            *target = raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                field: name,
                reason: format!("{raw:?}: {e}"),
            })?;
        }
        Ok(())
    }
}
