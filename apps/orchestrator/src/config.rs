use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::heartbeat::HeartbeatConfig;
use crate::queue::task::{QUEUE_CRITICAL, QUEUE_DEFAULT, QUEUE_LOW};
use crate::queue::{BrokerConfig, GroupPolicy, RetryPolicy, ServerConfig};
use crate::registry::DatacenterTarget;
use crate::retention::RetentionPolicy;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub database: Database,
    pub agent: Agent,
    pub executor: Executor,
    pub queue: Queue,
    pub aggregation: Aggregation,
    pub heartbeat: Heartbeat,
    pub periodic: Periodic,
    pub registry: Registry,
    pub notifications: Notifications,
    pub retention: Retention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Default level; `RUST_LOG` overrides it
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Agent {
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Executor {
    pub body_budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Queue {
    pub concurrency: usize,
    pub critical_weight: u32,
    pub default_weight: u32,
    pub low_weight: u32,
    pub poll_interval_ms: u64,
    pub retry_base_ms: u64,
    pub retry_cap_secs: u64,
    pub retry_jitter: f64,
    pub shutdown_timeout_secs: u64,
    pub completed_retention_secs: u64,
    pub archived_retention_secs: u64,
    pub maintenance_interval_ms: u64,
    pub stats_sample_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Aggregation {
    pub grace_period_ms: u64,
    pub max_delay_ms: u64,
    pub max_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub reconcile_interval_secs: u64,
    pub trigger_interval_secs: u64,
    pub completion_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Periodic {
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    pub cache_ttl_secs: u64,
    /// Static targets; when empty the registry is read from the database
    pub datacenters: Vec<DatacenterTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Notifications {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Retention {
    pub body_snapshot_days: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for Logging {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self { path: "uppe-orchestrator.db".into(), pool_size: 16 }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self { request_timeout_secs: 60 }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self { body_budget_bytes: crate::probe::DEFAULT_BODY_BUDGET_BYTES }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            concurrency: 100,
            critical_weight: 6,
            default_weight: 3,
            low_weight: 1,
            poll_interval_ms: 1000,
            retry_base_ms: 1000,
            retry_cap_secs: 600,
            retry_jitter: 0.2,
            shutdown_timeout_secs: 8,
            completed_retention_secs: 300,
            archived_retention_secs: 24 * 3600,
            maintenance_interval_ms: 500,
            stats_sample_interval_secs: 15,
        }
    }
}

impl Default for Aggregation {
    fn default() -> Self {
        Self { grace_period_ms: 2000, max_delay_ms: 10_000, max_size: 10_000 }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 10,
            trigger_interval_secs: 15,
            completion_timeout_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for Periodic {
    fn default() -> Self {
        Self { sync_interval_secs: 30 }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self { cache_ttl_secs: 300, datacenters: Vec::new() }
    }
}

impl Default for Notifications {
    fn default() -> Self {
        Self { webhook_url: None, timeout_secs: 10 }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self { body_snapshot_days: 7, cleanup_interval_secs: 3600 }
    }
}

impl Queue {
    pub fn broker_config(&self, aggregation: &Aggregation) -> BrokerConfig {
        BrokerConfig {
            queues: vec![
                (QUEUE_CRITICAL.to_string(), self.critical_weight),
                (QUEUE_DEFAULT.to_string(), self.default_weight),
                (QUEUE_LOW.to_string(), self.low_weight),
            ],
            group_policy: aggregation.group_policy(),
            completed_retention: Duration::from_secs(self.completed_retention_secs),
            archived_retention: Duration::from_secs(self.archived_retention_secs),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            concurrency: self.concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retry: RetryPolicy {
                base: Duration::from_millis(self.retry_base_ms),
                cap: Duration::from_secs(self.retry_cap_secs),
                jitter: self.retry_jitter,
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

impl Aggregation {
    pub fn group_policy(&self) -> GroupPolicy {
        GroupPolicy {
            grace_period: Duration::from_millis(self.grace_period_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_size: self.max_size.max(1),
        }
    }
}

impl Heartbeat {
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            trigger_interval: Duration::from_secs(self.trigger_interval_secs),
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

impl Retention {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            body_snapshot_days: self.body_snapshot_days,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/uppe/orchestrator.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("uppe/orchestrator.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Orchestrator Configuration:")?;
        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;

        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_1(f, "Pool Size", &self.database.pool_size)?;

        write_title_1(f, "Agent")?;
        write_1(f, "Request Timeout (s)", &self.agent.request_timeout_secs)?;

        write_title_1(f, "Executor")?;
        write_1(f, "Body Budget (bytes)", &self.executor.body_budget_bytes)?;

        write_title_1(f, "Queue")?;
        write_1(f, "Concurrency", &self.queue.concurrency)?;
        write_1(
            f,
            "Weights (critical/default/low)",
            &format!(
                "{}/{}/{}",
                self.queue.critical_weight, self.queue.default_weight, self.queue.low_weight
            ),
        )?;
        write_1(
            f,
            "Retry Backoff",
            &format!("{}ms base, {}s cap", self.queue.retry_base_ms, self.queue.retry_cap_secs),
        )?;

        write_title_1(f, "Aggregation")?;
        write_1(f, "Grace Period (ms)", &self.aggregation.grace_period_ms)?;
        write_1(f, "Max Delay (ms)", &self.aggregation.max_delay_ms)?;
        write_1(f, "Max Size", &self.aggregation.max_size)?;

        write_title_1(f, "Heartbeat")?;
        write_1(f, "Reconcile Interval (s)", &self.heartbeat.reconcile_interval_secs)?;
        write_1(f, "Trigger Interval (s)", &self.heartbeat.trigger_interval_secs)?;
        write_1(f, "Completion Timeout (s)", &self.heartbeat.completion_timeout_secs)?;

        write_title_1(f, "Periodic")?;
        write_1(f, "Sync Interval (s)", &self.periodic.sync_interval_secs)?;

        write_title_1(f, "Registry")?;
        write_1(f, "Cache TTL (s)", &self.registry.cache_ttl_secs)?;
        let source = if self.registry.datacenters.is_empty() {
            "database".to_string()
        } else {
            format!("{} static targets", self.registry.datacenters.len())
        };
        write_1(f, "Source", &source)?;

        write_title_1(f, "Notifications")?;
        write_1(f, "Webhook", &self.notifications.webhook_url.as_deref().unwrap_or("disabled"))?;

        write_title_1(f, "Retention")?;
        write_1(f, "Body Snapshots (days)", &self.retention.body_snapshot_days)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/uppe/orchestrator.toml
    ///  or the specified path if one does not exist
    ///
    /// ```rust,no_run
    /// let cfg = uppe_orchestrator::config::Config::from_config(None::<&std::path::Path>)?;
    /// println!("{}", cfg);
    /// # Ok::<(), uppe_orchestrator::error::ConfigError>(())
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path).map_err(|source| {
                ConfigError::ReadFailed { path: config_path.display().to_string(), source }
            })?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;
        let write_failed =
            |source| ConfigError::WriteFailed { path: path.display().to_string(), source };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }

        fs::write(path, config_str).map_err(write_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_with_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/orchestrator");

        let config = Config::from_config(Some(&path))?;
        assert_eq!(config.queue.concurrency, 100);
        assert!(dir.path().join("nested/orchestrator.toml").exists());

        let reread = Config::from_config(Some(&path))?;
        assert_eq!(reread.heartbeat.trigger_interval_secs, 15);
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_the_rest() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("orchestrator.toml");
        fs::write(
            &path,
            r#"
[queue]
concurrency = 8

[[registry.datacenters]]
id = 1
base_url = "http://dc1.agents.local:7000"
title = "Amsterdam"
"#,
        )?;

        let config = Config::from_config(Some(&path))?;
        assert_eq!(config.queue.concurrency, 8);
        assert_eq!(config.queue.critical_weight, 6);
        assert_eq!(config.registry.datacenters[0].title, "Amsterdam");
        assert_eq!(config.aggregation.group_policy(), GroupPolicy::default());
        assert_eq!(config.heartbeat.heartbeat_config().completion_timeout, Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("orchestrator.toml");
        fs::write(&path, "[queue\nconcurrency = ")?;

        assert!(matches!(Config::from_config(Some(&path)), Err(ConfigError::ParseFailed(_))));
        Ok(())
    }

    #[test]
    fn test_display_lists_every_section() {
        let rendered = Config::default().to_string();
        for title in ["Database", "Queue", "Aggregation", "Heartbeat", "Retention"] {
            assert!(rendered.contains(title), "missing {title}");
        }
        assert!(rendered.contains("Webhook: disabled"));
    }
}
