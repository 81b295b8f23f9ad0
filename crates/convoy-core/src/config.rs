//! Configuration loading
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: ~/.config/convoy/config.toml
//! 3. Project config: .convoy/config.toml
//! 4. Environment variables: CONVOY_*
//! 5. CLI flags (applied by the binary)
//!
//! # Example Config
//!
//! ```toml
//! database_path = ".convoy/coordination.db"
//! lock_ttl_secs = 300
//! detection_interval_secs = 30
//! degraded_after_secs = 120
//! dead_after_secs = 600
//! ```

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tunables shared by every coordination component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Path of the shared `SQLite` store.
    pub database_path: PathBuf,
    /// Repository the loops work on.
    pub repository_path: PathBuf,
    /// Default lock time-to-live.
    pub lock_ttl_secs: u64,
    /// Denied requests older than this no longer count as waiting.
    pub pending_request_ttl_secs: u64,
    /// Deadlock detection period.
    pub detection_interval_secs: u64,
    /// Health evaluation period.
    pub health_check_interval_secs: u64,
    /// Silence after which a component is degraded.
    pub degraded_after_secs: u64,
    /// Silence after which a component is dead.
    pub dead_after_secs: u64,
    /// How long deactivated checkpoints are retained.
    pub checkpoint_retention_secs: u64,
    /// Orphan sweep period.
    pub sweep_interval_secs: u64,
    /// Coordinator event poll period.
    pub coordinator_poll_interval_secs: u64,
    /// Default decision timeout.
    pub decision_timeout_secs: u64,
    /// Stuck reports tolerated before a decision is raised.
    pub stuck_retry_budget: u32,
    /// Times a loop may be chosen as deadlock victim before a decision is raised.
    pub victim_retry_budget: u32,
    /// Publish `rollback_triggered` automatically for clear-cut regressions.
    pub auto_rollback_on_regression: bool,
    /// Maximum events returned by one poll.
    pub poll_batch_size: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".convoy/coordination.db"),
            repository_path: PathBuf::from("."),
            lock_ttl_secs: 300,
            pending_request_ttl_secs: 120,
            detection_interval_secs: 30,
            health_check_interval_secs: 15,
            degraded_after_secs: 120,
            dead_after_secs: 600,
            checkpoint_retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
            coordinator_poll_interval_secs: 5,
            decision_timeout_secs: 900,
            stuck_retry_budget: 3,
            victim_retry_budget: 3,
            auto_rollback_on_regression: true,
            poll_batch_size: 500,
        }
    }
}

/// Partial config as read from a TOML layer; only present keys override.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigLayer {
    database_path: Option<PathBuf>,
    repository_path: Option<PathBuf>,
    lock_ttl_secs: Option<u64>,
    pending_request_ttl_secs: Option<u64>,
    detection_interval_secs: Option<u64>,
    health_check_interval_secs: Option<u64>,
    degraded_after_secs: Option<u64>,
    dead_after_secs: Option<u64>,
    checkpoint_retention_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    coordinator_poll_interval_secs: Option<u64>,
    decision_timeout_secs: Option<u64>,
    stuck_retry_budget: Option<u32>,
    victim_retry_budget: Option<u32>,
    auto_rollback_on_regression: Option<bool>,
    poll_batch_size: Option<u32>,
}

macro_rules! merge_fields {
    ($target:expr, $layer:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $layer.$field {
                $target.$field = value;
            }
        )+
    };
}

impl CoordinationConfig {
    fn merge(&mut self, layer: ConfigLayer) {
        merge_fields!(
            self,
            layer,
            database_path,
            repository_path,
            lock_ttl_secs,
            pending_request_ttl_secs,
            detection_interval_secs,
            health_check_interval_secs,
            degraded_after_secs,
            dead_after_secs,
            checkpoint_retention_secs,
            sweep_interval_secs,
            coordinator_poll_interval_secs,
            decision_timeout_secs,
            stuck_retry_budget,
            victim_retry_budget,
            auto_rollback_on_regression,
            poll_batch_size,
        );
    }

    /// Apply `CONVOY_*` overrides from an environment lookup.
    fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CONVOY_DB") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("CONVOY_REPOSITORY") {
            self.repository_path = PathBuf::from(value);
        }

        let layer = ConfigLayer {
            lock_ttl_secs: env_value(&lookup, "CONVOY_LOCK_TTL_SECS")?,
            pending_request_ttl_secs: env_value(&lookup, "CONVOY_PENDING_REQUEST_TTL_SECS")?,
            detection_interval_secs: env_value(&lookup, "CONVOY_DETECTION_INTERVAL_SECS")?,
            health_check_interval_secs: env_value(&lookup, "CONVOY_HEALTH_CHECK_INTERVAL_SECS")?,
            degraded_after_secs: env_value(&lookup, "CONVOY_DEGRADED_AFTER_SECS")?,
            dead_after_secs: env_value(&lookup, "CONVOY_DEAD_AFTER_SECS")?,
            checkpoint_retention_secs: env_value(&lookup, "CONVOY_CHECKPOINT_RETENTION_SECS")?,
            sweep_interval_secs: env_value(&lookup, "CONVOY_SWEEP_INTERVAL_SECS")?,
            coordinator_poll_interval_secs: env_value(
                &lookup,
                "CONVOY_COORDINATOR_POLL_INTERVAL_SECS",
            )?,
            decision_timeout_secs: env_value(&lookup, "CONVOY_DECISION_TIMEOUT_SECS")?,
            stuck_retry_budget: env_value(&lookup, "CONVOY_STUCK_RETRY_BUDGET")?,
            victim_retry_budget: env_value(&lookup, "CONVOY_VICTIM_RETRY_BUDGET")?,
            auto_rollback_on_regression: env_value(&lookup, "CONVOY_AUTO_ROLLBACK")?,
            poll_batch_size: env_value(&lookup, "CONVOY_POLL_BATCH_SIZE")?,
            ..ConfigLayer::default()
        };
        self.merge(layer);
        Ok(())
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("database_path cannot be empty".into()));
        }
        let intervals = [
            ("lock_ttl_secs", self.lock_ttl_secs),
            ("pending_request_ttl_secs", self.pending_request_ttl_secs),
            ("detection_interval_secs", self.detection_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("degraded_after_secs", self.degraded_after_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("coordinator_poll_interval_secs", self.coordinator_poll_interval_secs),
            ("decision_timeout_secs", self.decision_timeout_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be greater than 0")));
        }
        if self.dead_after_secs <= self.degraded_after_secs {
            return Err(Error::InvalidConfig(format!(
                "dead_after_secs ({}) must exceed degraded_after_secs ({})",
                self.dead_after_secs, self.degraded_after_secs
            )));
        }
        if self.poll_batch_size == 0 {
            return Err(Error::InvalidConfig("poll_batch_size must be greater than 0".into()));
        }
        Ok(())
    }

    /// Lock time-to-live as a duration.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        secs(self.lock_ttl_secs)
    }

    /// Pending request lifetime as a duration.
    #[must_use]
    pub fn pending_request_ttl(&self) -> Duration {
        secs(self.pending_request_ttl_secs)
    }

    /// Health thresholds derived from this config.
    #[must_use]
    pub fn health_thresholds(&self) -> crate::health::HealthThresholds {
        crate::health::HealthThresholds {
            degraded_after: secs(self.degraded_after_secs),
            dead_after: secs(self.dead_after_secs),
        }
    }

    /// Checkpoint retention window.
    #[must_use]
    pub fn checkpoint_retention(&self) -> Duration {
        secs(self.checkpoint_retention_secs)
    }

    /// Default decision timeout.
    #[must_use]
    pub fn decision_timeout(&self) -> Duration {
        secs(self.decision_timeout_secs)
    }
}

fn env_value<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("Invalid {key} value: {e}")))
        })
        .transpose()
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

/// Load configuration from all layers.
///
/// # Errors
///
/// Returns error if a config file is unreadable or malformed, an environment
/// override does not parse, or the merged config fails validation.
pub async fn load_config() -> Result<CoordinationConfig> {
    let mut config = CoordinationConfig::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config.merge(load_toml_file(&global_path).await?);
        }
    }

    let project_path = project_config_path()?;
    if project_path.exists() {
        config.merge(load_toml_file(&project_path).await?);
    }

    config.apply_env_with(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load a single config file over the defaults, without env overrides.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed, or fails validation.
pub async fn load_config_file(path: &Path) -> Result<CoordinationConfig> {
    let mut config = CoordinationConfig::default();
    config.merge(load_toml_file(path).await?);
    config.validate()?;
    Ok(config)
}

fn project_config_path() -> Result<PathBuf> {
    std::env::current_dir()
        .map(|dir| dir.join(".convoy/config.toml"))
        .map_err(|e| Error::Io(format!("Failed to get current directory: {e}")))
}

fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "convoy")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

async fn load_toml_file(path: &Path) -> Result<ConfigLayer> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::Io(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config {}: {e}", path.display()))
    })
}
