//! Configuration file support for gpulane.
//!
//! Load settings from `.gpulane.toml` or `~/.config/gpulane/config.toml`.
//!
//! ## Config Resolution Order
//!
//! 1. CLI flags (highest priority, applied by the caller)
//! 2. Environment variables (`REDIS_URL`, `GPULANE_*`)
//! 3. An explicit `--config` file, or the project-level `.gpulane.toml`
//! 4. User-level `~/.config/gpulane/config.toml`
//! 5. Built-in defaults (lowest priority)

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::Backoff;

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Optional prefix for every key, so several lanes can share one Redis.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Admission settings.
    #[serde(default)]
    pub admission: AdmissionSection,
    /// Exclusive lock settings.
    #[serde(default)]
    pub lock: LockSection,
    /// Executor settings.
    #[serde(default)]
    pub worker: WorkerSection,
    /// Task record settings.
    #[serde(default)]
    pub tasks: TasksSection,
    /// Input staging settings.
    #[serde(default)]
    pub staging: StagingSection,
}

/// `[admission]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSection {
    /// Reject submissions once this many tasks are queued or running.
    /// Unset means unlimited.
    pub max_queue_depth: Option<u64>,
    /// Bound on submissions staging inputs at once in one process.
    pub max_concurrent_staging: Option<usize>,
}

/// `[lock]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    /// Server-side expiry of the lock key, in seconds.
    pub ttl_secs: u64,
    /// First retry delay after a failed acquire, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on the retry delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor applied to the retry delay.
    pub backoff_multiplier: f64,
    /// Wake waiters early on release notifications.
    pub notify: bool,
    /// Give up acquiring after this many seconds. Unset waits forever.
    pub max_wait_secs: Option<u64>,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            backoff_multiplier: 1.5,
            notify: true,
            max_wait_secs: None,
        }
    }
}

impl LockSection {
    /// Lock key expiry.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Retry schedule for contended acquires.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(
            self.initial_backoff_ms,
            self.max_backoff_ms,
            self.backoff_multiplier,
        )
    }

    /// Maximum time to wait for the lock, if bounded.
    #[must_use]
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs.map(Duration::from_secs)
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Executor loops per worker process.
    pub executors: usize,
    /// How long one dequeue blocks before re-checking for shutdown, in seconds.
    pub dequeue_timeout_secs: u64,
    /// Fail an operation that runs longer than this many seconds.
    pub operation_timeout_secs: Option<u64>,
    /// External program run for each job (program followed by arguments).
    pub command: Option<Vec<String>>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            executors: 1,
            dequeue_timeout_secs: 5,
            operation_timeout_secs: None,
            command: None,
        }
    }
}

impl WorkerSection {
    /// Dequeue timeout as a duration.
    #[must_use]
    pub const fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    /// Operation timeout as a duration.
    #[must_use]
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}

/// `[tasks]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    /// Hours a task record lives before the store expires it.
    pub retention_hours: u64,
    /// Terminal records kept by `trim` when no count is given.
    pub keep_on_trim: usize,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            retention_hours: 48,
            keep_on_trim: 100,
        }
    }
}

impl TasksSection {
    /// Record retention as a duration.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

/// `[staging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingSection {
    /// Directory where submitted inputs are persisted until executed.
    /// Must be shared storage when executors run on other hosts.
    pub dir: PathBuf,
}

impl Default for StagingSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("pending_uploads"),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            namespace: None,
            admission: AdmissionSection::default(),
            lock: LockSection::default(),
            worker: WorkerSection::default(),
            tasks: TasksSection::default(),
            staging: StagingSection::default(),
        }
    }
}

impl LaneConfig {
    /// Checks that the settings are usable together.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.redis_url.trim().is_empty() {
            return invalid("redis_url must not be empty");
        }
        if self.admission.max_queue_depth == Some(0) {
            return invalid("admission.max_queue_depth must be at least 1 (omit it for unlimited)");
        }
        if self.admission.max_concurrent_staging == Some(0) {
            return invalid("admission.max_concurrent_staging must be at least 1");
        }
        if self.lock.ttl_secs == 0 {
            return invalid("lock.ttl_secs must be positive");
        }
        if self.lock.initial_backoff_ms == 0 || self.lock.max_backoff_ms == 0 {
            return invalid("lock backoff intervals must be positive");
        }
        if self.lock.initial_backoff_ms > self.lock.max_backoff_ms {
            return invalid("lock.initial_backoff_ms must not exceed lock.max_backoff_ms");
        }
        if self.lock.backoff_multiplier.is_nan() || self.lock.backoff_multiplier < 1.0 {
            return invalid("lock.backoff_multiplier must be at least 1.0");
        }
        if self.worker.executors == 0 {
            return invalid("worker.executors must be at least 1");
        }
        if self.worker.dequeue_timeout_secs == 0 {
            return invalid("worker.dequeue_timeout_secs must be positive");
        }
        if let Some(timeout) = self.worker.operation_timeout_secs {
            if timeout == 0 {
                return invalid("worker.operation_timeout_secs must be positive");
            }
            if timeout >= self.lock.ttl_secs {
                return Err(ConfigError::Invalid(format!(
                    "worker.operation_timeout_secs ({timeout}) must be smaller than \
                     lock.ttl_secs ({}) or the lock can expire mid-operation",
                    self.lock.ttl_secs
                )));
            }
        }
        if self
            .worker
            .command
            .as_ref()
            .is_some_and(|cmd| cmd.first().map_or(true, |p| p.trim().is_empty()))
        {
            return invalid("worker.command must name a program");
        }
        if self.tasks.retention_hours == 0 {
            return invalid("tasks.retention_hours must be positive");
        }
        Ok(())
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    /// Failed to read configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Settings that cannot work together.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get the user-level config path (~/.config/gpulane/config.toml).
#[must_use]
pub fn get_user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("gpulane").join("config.toml"))
}

/// Get the project-level config path (.gpulane.toml in current directory).
#[must_use]
pub fn get_project_config_path() -> PathBuf {
    PathBuf::from(".gpulane.toml")
}

/// Parses one TOML document into a table for layering.
fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content.parse::<toml::Table>()?)
}

/// Overlays `top` onto `base`, merging nested tables key by key.
fn merge_tables(base: &mut toml::Table, top: toml::Table) {
    for (key, value) in top {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(overlay)) => {
                merge_tables(existing, overlay);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Load configuration from a TOML string, with no file or environment layering.
///
/// # Errors
/// Returns `ConfigError::TomlParse` if the TOML is invalid.
pub fn load_from_str(toml_content: &str) -> Result<LaneConfig, ConfigError> {
    Ok(toml::from_str(toml_content)?)
}

/// Load configuration with an optional custom config path.
///
/// # Errors
/// Returns an error if a config file exists but cannot be read or parsed,
/// or if the resolved configuration is invalid.
pub fn load_config(custom_config: Option<&Path>) -> Result<LaneConfig, ConfigError> {
    let mut merged = toml::Table::new();

    if let Some(user_path) = get_user_config_path() {
        if user_path.exists() {
            merge_tables(&mut merged, load_table(&user_path)?);
        }
    }

    match custom_config {
        Some(custom_path) => merge_tables(&mut merged, load_table(custom_path)?),
        None => {
            let project_path = get_project_config_path();
            if project_path.exists() {
                merge_tables(&mut merged, load_table(&project_path)?);
            }
        }
    }

    let mut config: LaneConfig = toml::Value::Table(merged).try_into()?;
    apply_env_overrides(&mut config, |name| env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Apply environment variable overrides (highest priority after CLI flags).
///
/// Unparseable numeric values are ignored with a warning.
pub fn apply_env_overrides(config: &mut LaneConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        name: &str,
    ) -> Option<T> {
        let raw = lookup(name)?;
        let value = raw.trim().parse().ok();
        if value.is_none() {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable environment override");
        }
        value
    }

    if let Some(url) = lookup("REDIS_URL") {
        config.redis_url = url;
    }
    if let Some(ns) = lookup("GPULANE_NAMESPACE") {
        config.namespace = Some(ns).filter(|ns| !ns.is_empty());
    }
    if let Some(max) = parsed(&lookup, "GPULANE_MAX_QUEUE_DEPTH") {
        config.admission.max_queue_depth = Some(max);
    }
    if let Some(ttl) = parsed(&lookup, "GPULANE_LOCK_TTL_SECS") {
        config.lock.ttl_secs = ttl;
    }
    if let Some(executors) = parsed(&lookup, "GPULANE_EXECUTORS") {
        config.worker.executors = executors;
    }
    if let Some(timeout) = parsed(&lookup, "GPULANE_OPERATION_TIMEOUT_SECS") {
        config.worker.operation_timeout_secs = Some(timeout);
    }
    if let Some(dir) = lookup("GPULANE_STAGING_DIR") {
        config.staging.dir = PathBuf::from(dir);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_default_values() {
        let config = LaneConfig::default();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379/0");
        assert_eq!(config.lock.ttl_secs, 1800);
        assert_eq!(config.lock.initial_backoff_ms, 10);
        assert_eq!(config.lock.max_backoff_ms, 1000);
        assert!((config.lock.backoff_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.worker.executors, 1);
        assert_eq!(config.worker.dequeue_timeout_secs, 5);
        assert_eq!(config.tasks.retention(), Duration::from_secs(48 * 3600));
        assert_eq!(config.staging.dir, PathBuf::from("pending_uploads"));
        assert!(config.admission.max_queue_depth.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_config_deserialize_minimal() {
        let config = load_from_str("redis_url = \"redis://cache:6379/2\"\n").unwrap();
        assert_eq!(config.redis_url, "redis://cache:6379/2");
        assert_eq!(config.lock, LockSection::default());
    }

    #[test]
    fn test_config_deserialize_full() {
        let config = load_from_str(
            r#"
redis_url = "redis://gpu-box:6379/0"
namespace = "faceswap"

[admission]
max_queue_depth = 20
max_concurrent_staging = 4

[lock]
ttl_secs = 600
max_wait_secs = 120
notify = false

[worker]
executors = 2
operation_timeout_secs = 300
command = ["python", "swap.py"]

[tasks]
retention_hours = 24

[staging]
dir = "/mnt/shared/pending"
"#,
        )
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("faceswap"));
        assert_eq!(config.admission.max_queue_depth, Some(20));
        assert_eq!(config.lock.ttl(), Duration::from_secs(600));
        assert_eq!(config.lock.max_wait(), Some(Duration::from_secs(120)));
        assert!(!config.lock.notify);
        // Unspecified keys in a present section keep their defaults.
        assert_eq!(config.lock.initial_backoff_ms, 10);
        assert_eq!(config.worker.executors, 2);
        assert_eq!(
            config.worker.command,
            Some(vec!["python".to_string(), "swap.py".to_string()])
        );
        assert_eq!(config.staging.dir, PathBuf::from("/mnt/shared/pending"));
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            load_from_str("[lock\nttl_secs = 1"),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_operation_timeout_must_be_below_lock_ttl() {
        let mut config = LaneConfig::default();
        config.lock.ttl_secs = 60;
        config.worker.operation_timeout_secs = Some(60);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock.ttl_secs"));

        config.worker.operation_timeout_secs = Some(59);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = LaneConfig::default();
        config.admission.max_queue_depth = Some(0);
        assert!(config.validate().is_err());

        let mut config = LaneConfig::default();
        config.worker.executors = 0;
        assert!(config.validate().is_err());

        let mut config = LaneConfig::default();
        config.lock.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = LaneConfig::default();
        config.worker.command = Some(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LaneConfig::default();
        apply_env_overrides(
            &mut config,
            env_of(&[
                ("REDIS_URL", "redis://other:6380/1"),
                ("GPULANE_NAMESPACE", "lane-b"),
                ("GPULANE_MAX_QUEUE_DEPTH", "3"),
                ("GPULANE_LOCK_TTL_SECS", "900"),
                ("GPULANE_EXECUTORS", "4"),
                ("GPULANE_OPERATION_TIMEOUT_SECS", "120"),
                ("GPULANE_STAGING_DIR", "/tmp/staging"),
            ]),
        );
        assert_eq!(config.redis_url, "redis://other:6380/1");
        assert_eq!(config.namespace.as_deref(), Some("lane-b"));
        assert_eq!(config.admission.max_queue_depth, Some(3));
        assert_eq!(config.lock.ttl_secs, 900);
        assert_eq!(config.worker.executors, 4);
        assert_eq!(config.worker.operation_timeout_secs, Some(120));
        assert_eq!(config.staging.dir, PathBuf::from("/tmp/staging"));
    }

    #[test]
    fn test_unparseable_env_override_is_ignored() {
        let mut config = LaneConfig::default();
        apply_env_overrides(&mut config, env_of(&[("GPULANE_EXECUTORS", "many")]));
        assert_eq!(config.worker.executors, 1);
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table = "[lock]\nttl_secs = 100\nnotify = false\n".parse().unwrap();
        let top: toml::Table = "[lock]\nttl_secs = 200\n".parse().unwrap();
        merge_tables(&mut base, top);
        let config: LaneConfig = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.lock.ttl_secs, 200);
        assert!(!config.lock.notify);
    }

    #[test]
    fn test_load_config_from_custom_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lane.toml");
        std::fs::write(&path, "[worker]\nexecutors = 3\n").unwrap();
        let table = load_table(&path).unwrap();
        let config: LaneConfig = toml::Value::Table(table).try_into().unwrap();
        assert_eq!(config.worker.executors, 3);
    }
}
