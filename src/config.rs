//! Daemon configuration: layered TOML files plus a closed set of
//! environment variable overrides, resolved once at startup into an
//! immutable [`Config`] and never mutated afterward — every component
//! receives the pieces it needs at construction time rather than reaching
//! for ambient global state (Design Notes §9).
//!
//! Structured as a permissive `RawConfig` deserialized with per-field
//! defaults, then resolved into a strict `Config` and validated once —
//! logical inconsistencies surface as an `anyhow::Error` at startup rather
//! than from whatever operation first touches the broken setting. The
//! layered-file search order follows
//! `original_source/erddaputil/common.py`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::dataset::DatasetManagerSettings;
use crate::core::metrics::MetricSenderConfig;

/// Packaged defaults, compiled into the binary, used as the first
/// (lowest-priority) configuration layer.
const PACKAGED_DEFAULTS: &str = include_str!("../.erddaputil.defaults.toml");

/// Env var overrides are a closed set, not a generic `envy`-style walk —
/// matching the "closed set ... enumerated by the configuration facade"
/// language of spec.md §6.
const ENV_SECRET_KEY: &str = "ERDDAPUTIL_SECRET_KEY";
const ENV_SERVICE_HOST: &str = "ERDDAPUTIL_SERVICE_HOST";
const ENV_SERVICE_PORT: &str = "ERDDAPUTIL_SERVICE_PORT";
const ENV_LOG_LEVEL: &str = "ERDDAPUTIL_LOG_LEVEL";
const ENV_CONFIG_PATH: &str = "ERDDAPUTIL_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct RawConfig {
    #[serde(default)]
    secret_key: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    local: RawLocalConfig,
    #[serde(default)]
    broker: RawBrokerConfig,
    #[serde(default)]
    metrics: RawMetricsConfig,
    #[serde(default)]
    dataset_manager: RawDatasetManagerConfig,
    #[serde(default)]
    management_api: RawManagementApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct RawLocalConfig {
    host: Option<String>,
    port: Option<u16>,
    #[serde(default, with = "humantime_serde::option")]
    read_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    tick_interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct RawBrokerConfig {
    enabled: Option<bool>,
    prefix: Option<String>,
    cluster_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct RawMetricsConfig {
    enabled: Option<bool>,
    push_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    batch_size: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    batch_wait: Option<Duration>,
    max_retries: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    retry_delay: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct RawDatasetManagerConfig {
    big_parent_directory: Option<PathBuf>,
    datasets_template: Option<PathBuf>,
    datasets_d: Option<PathBuf>,
    datasets_xml: Option<PathBuf>,
    backups_dir: Option<PathBuf>,
    erddap_base_url: Option<String>,
    max_pending: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    max_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    max_recompile_delay: Option<Duration>,
    skip_misconfigured_datasets: Option<bool>,
    backup_retention_days: Option<u32>,
    ip_block_list_path: Option<PathBuf>,
    email_block_list_path: Option<PathBuf>,
    unlimited_allow_list_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct RawManagementApiConfig {
    enabled: Option<bool>,
}

/// The resolved local command-socket settings (spec.md §6 "Local command
/// socket").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalReceiverConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    /// How often the supervisor's ticker worker calls
    /// [`crate::core::dataset::DatasetManager::flush`] and the receiver
    /// runs its tidy hooks.
    pub tick_interval: Duration,
}

impl LocalReceiverConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("resolving local receiver address {}:{}", self.host, self.port))?
            .next()
            .ok_or_else(|| anyhow!("no addresses resolved for {}:{}", self.host, self.port))
    }
}

/// Cluster exchange settings (spec.md §6 "Cluster exchange"). This crate
/// only ships the [`crate::core::broker::BrokerAdapter`] interface and the
/// always-invalid [`crate::core::broker::NullBrokerAdapter`] — concrete
/// AMQP/Azure Service Bus bindings are out of scope — but the topic/queue
/// naming these settings drive is still part of the daemon's contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub prefix: String,
    pub cluster_name: String,
}

impl BrokerConfig {
    pub fn cluster_topic(&self) -> String {
        format!("{}.cluster.{}", self.prefix, self.cluster_name)
    }

    pub fn global_topic(&self) -> String {
        format!("{}.global", self.prefix)
    }

    pub fn queue_name(&self, hostname: &str) -> String {
        format!("{}_{}_{}", self.prefix, self.cluster_name, hostname)
    }
}

/// Metric push sink settings (spec.md §6 "Metric push sink" and §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub push_url: Option<Url>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl MetricsConfig {
    /// Builds the sender's runtime config, or `None` if metrics are
    /// disabled or no push URL was configured — either case is a
    /// `ConfigError` at the call site, not a panic here.
    pub fn sender_config(&self) -> Option<MetricSenderConfig> {
        if !self.enabled {
            return None;
        }
        self.push_url.clone().map(|push_url| MetricSenderConfig {
            push_url,
            username: self.username.clone(),
            password: self.password.clone(),
            batch_size: self.batch_size,
            batch_wait: self.batch_wait,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        })
    }
}

/// The HTTP management API toggle (spec.md §6). The route handlers
/// themselves are an external collaborator (spec.md §1's "OUT OF SCOPE");
/// this flag only gates whether the daemon advertises the capability
/// (e.g. to a health/status handler built on top of this crate).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ManagementApiConfig {
    pub enabled: bool,
}

/// Resolved dataset-manager settings plus the three ACL file paths,
/// mirroring spec.md §6's filesystem layout section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManagerConfig {
    pub big_parent_directory: PathBuf,
    pub datasets_template: Option<PathBuf>,
    pub datasets_d: Option<PathBuf>,
    pub datasets_xml: PathBuf,
    pub backups_dir: PathBuf,
    pub erddap_base_url: Option<Url>,
    pub max_pending: usize,
    pub max_delay: Duration,
    pub max_recompile_delay: Duration,
    pub skip_misconfigured_datasets: bool,
    pub backup_retention_days: u32,
    pub ip_block_list_path: PathBuf,
    pub email_block_list_path: PathBuf,
    pub unlimited_allow_list_path: PathBuf,
}

impl DatasetManagerConfig {
    pub fn manager_settings(&self) -> DatasetManagerSettings {
        DatasetManagerSettings {
            big_parent_directory: self.big_parent_directory.clone(),
            datasets_template: self.datasets_template.clone(),
            datasets_d: self.datasets_d.clone(),
            datasets_xml: self.datasets_xml.clone(),
            backups_dir: self.backups_dir.clone(),
            erddap_base_url: self.erddap_base_url.clone(),
            max_pending: self.max_pending,
            max_delay: self.max_delay,
            max_recompile_delay: self.max_recompile_delay,
            skip_misconfigured_datasets: self.skip_misconfigured_datasets,
            backup_retention_days: self.backup_retention_days,
        }
    }
}

/// The fully resolved, validated daemon configuration. Constructed once at
/// startup by [`Config::load`] and shared (behind an `Arc`) by every
/// long-lived component; nothing in this crate re-reads it afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub secret_key: String,
    pub log_level: String,
    pub local: LocalReceiverConfig,
    pub broker: BrokerConfig,
    pub metrics: MetricsConfig,
    pub dataset_manager: DatasetManagerConfig,
    pub management_api: ManagementApiConfig,
}

impl Config {
    /// Loads and resolves the configuration from the layered file search
    /// order (spec.md §6 / SPEC_FULL.md §10.1), most-specific-wins:
    ///
    /// 1. packaged defaults (compiled in)
    /// 2. `$HOME/.erddaputil.toml`
    /// 3. `./.erddaputil.toml`
    /// 4. every `;`-separated path in `ERDDAPUTIL_CONFIG_PATH`, each
    ///    searched for `.erddaputil.toml`
    ///
    /// followed by the closed set of environment variable overrides.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut merged: toml::Value = toml::from_str(PACKAGED_DEFAULTS).context("parsing packaged default config")?;

        if let Some(path) = explicit_path {
            merge_layer(&mut merged, path)?;
        } else {
            if let Some(home) = std::env::var_os("HOME") {
                merge_layer(&mut merged, &PathBuf::from(home).join(".erddaputil.toml"))?;
            }
            merge_layer(&mut merged, Path::new(".erddaputil.toml"))?;
            if let Ok(extra) = std::env::var(ENV_CONFIG_PATH) {
                for dir in extra.split(';').filter(|s| !s.is_empty()) {
                    merge_layer(&mut merged, &PathBuf::from(dir).join(".erddaputil.toml"))?;
                }
            }
        }

        let raw = RawConfig::deserialize(merged).context("assembling merged configuration")?;
        let config = Self::resolve(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve(raw: RawConfig) -> Result<Self> {
        let secret_key = std::env::var(ENV_SECRET_KEY)
            .ok()
            .or(raw.secret_key)
            .unwrap_or_else(|| "change-me".to_string());
        let log_level = std::env::var(ENV_LOG_LEVEL).ok().or(raw.log_level).unwrap_or_else(|| "info".to_string());

        let host = std::env::var(ENV_SERVICE_HOST).ok().or(raw.local.host).unwrap_or_else(|| "127.0.0.1".to_string());
        let port = match std::env::var(ENV_SERVICE_PORT).ok().and_then(|v| v.parse().ok()) {
            Some(p) => p,
            None => raw.local.port.unwrap_or(9172),
        };

        let local = LocalReceiverConfig {
            host,
            port,
            read_timeout: raw.local.read_timeout.unwrap_or(Duration::from_secs(5)),
            tick_interval: raw.local.tick_interval.unwrap_or(Duration::from_secs(1)),
        };

        let broker = BrokerConfig {
            enabled: raw.broker.enabled.unwrap_or(false),
            prefix: raw.broker.prefix.unwrap_or_else(|| "erddaputil".to_string()),
            cluster_name: raw.broker.cluster_name.unwrap_or_else(|| "default".to_string()),
        };

        let push_url = raw
            .metrics
            .push_url
            .map(|u| Url::parse(&u))
            .transpose()
            .context("parsing metrics.push_url")?;
        let metrics = MetricsConfig {
            enabled: raw.metrics.enabled.unwrap_or(false),
            push_url,
            username: raw.metrics.username,
            password: raw.metrics.password,
            batch_size: raw.metrics.batch_size.unwrap_or(20),
            batch_wait: raw.metrics.batch_wait.unwrap_or(Duration::from_secs(2)),
            max_retries: raw.metrics.max_retries.unwrap_or(3),
            retry_delay: raw.metrics.retry_delay.unwrap_or(Duration::from_secs(1)),
        };

        let big_parent_directory = raw.dataset_manager.big_parent_directory.unwrap_or_else(|| PathBuf::from("/erddapData"));
        let erddap_base_url = raw
            .dataset_manager
            .erddap_base_url
            .map(|u| Url::parse(&u))
            .transpose()
            .context("parsing dataset_manager.erddap_base_url")?;
        let dataset_manager = DatasetManagerConfig {
            datasets_xml: raw.dataset_manager.datasets_xml.unwrap_or_else(|| big_parent_directory.join("datasets.xml")),
            backups_dir: raw.dataset_manager.backups_dir.unwrap_or_else(|| big_parent_directory.join("backups")),
            ip_block_list_path: raw
                .dataset_manager
                .ip_block_list_path
                .unwrap_or_else(|| big_parent_directory.join(".ip_block_list.txt")),
            email_block_list_path: raw
                .dataset_manager
                .email_block_list_path
                .unwrap_or_else(|| big_parent_directory.join(".email_block_list.txt")),
            unlimited_allow_list_path: raw
                .dataset_manager
                .unlimited_allow_list_path
                .unwrap_or_else(|| big_parent_directory.join(".unlimited_allow_list.txt")),
            datasets_template: raw.dataset_manager.datasets_template,
            datasets_d: raw.dataset_manager.datasets_d,
            erddap_base_url,
            max_pending: raw.dataset_manager.max_pending.unwrap_or(100),
            max_delay: raw.dataset_manager.max_delay.unwrap_or(Duration::from_secs(30)),
            max_recompile_delay: raw.dataset_manager.max_recompile_delay.unwrap_or(Duration::from_secs(30)),
            skip_misconfigured_datasets: raw.dataset_manager.skip_misconfigured_datasets.unwrap_or(true),
            backup_retention_days: raw.dataset_manager.backup_retention_days.unwrap_or(31),
            big_parent_directory,
        };

        let management_api = ManagementApiConfig {
            enabled: raw.management_api.enabled.unwrap_or(false),
        };

        Ok(Self {
            secret_key,
            log_level,
            local,
            broker,
            metrics,
            dataset_manager,
            management_api,
        })
    }

    /// Checks logical consistency beyond what the type system already
    /// enforces — a `ConfigError` at startup is far cheaper to diagnose
    /// than one surfacing from the first command that touches the broken
    /// setting.
    fn validate(&self) -> Result<()> {
        if self.local.port == 0 {
            return Err(anyhow!("local.port cannot be 0"));
        }
        if self.local.host.trim().is_empty() {
            return Err(anyhow!("local.host cannot be empty"));
        }
        if self.secret_key.trim().is_empty() {
            return Err(anyhow!("secret_key cannot be empty"));
        }
        if self.secret_key == "change-me" {
            tracing::warn!("secret_key is left at its packaged default; set ERDDAPUTIL_SECRET_KEY in production");
        }
        if self.broker.enabled && self.broker.cluster_name.trim().is_empty() {
            return Err(anyhow!("broker.cluster_name cannot be empty when broker.enabled is set"));
        }
        if self.metrics.enabled && self.metrics.push_url.is_none() {
            return Err(anyhow!("metrics.push_url is required when metrics.enabled is set"));
        }
        if self.metrics.batch_size == 0 {
            return Err(anyhow!("metrics.batch_size cannot be 0"));
        }
        if self.dataset_manager.backup_retention_days == 0 {
            return Err(anyhow!("dataset_manager.backup_retention_days cannot be 0"));
        }
        Ok(())
    }

    /// The hostname this daemon stamps into `ignore_on_hosts` and uses to
    /// build its broker queue name. Not part of the file/env layering —
    /// it always reflects the machine the process is running on.
    pub fn hostname() -> String {
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Reads `path` (a no-op if it doesn't exist — every layer above the
/// packaged defaults is optional) and deep-merges its table into `base`,
/// later values overriding earlier ones for scalars/arrays and recursing
/// for nested tables.
fn merge_layer(base: &mut toml::Value, path: &Path) -> Result<()> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Ok(());
    };
    let layer: toml::Value = toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    merge_toml(base, layer);
    Ok(())
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packaged_defaults_parse_and_validate() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.local.port, 9172);
        assert!(!config.broker.enabled);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn explicit_file_layers_over_packaged_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
            secret_key = "s3cr3t"

            [local]
            port = 19172

            [dataset_manager]
            big_parent_directory = "/tmp/bpd"
            "#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.secret_key, "s3cr3t");
        assert_eq!(config.local.port, 19172);
        assert_eq!(config.local.host, "127.0.0.1", "unset fields keep the packaged default");
        assert_eq!(config.dataset_manager.big_parent_directory, PathBuf::from("/tmp/bpd"));
        assert_eq!(
            config.dataset_manager.datasets_xml,
            PathBuf::from("/tmp/bpd/datasets.xml"),
            "unset datasets_xml derives from the overridden big_parent_directory"
        );
    }

    #[test]
    fn rejects_broker_enabled_without_cluster_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
            [broker]
            enabled = true
            cluster_name = ""
            "#,
        )
        .unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn rejects_metrics_enabled_without_push_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
            [metrics]
            enabled = true
            "#,
        )
        .unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn env_var_overrides_win_over_every_file_layer() {
        // SAFETY: tests run single-threaded per-process here; this test
        // scopes the var to itself and restores it.
        unsafe { std::env::set_var(ENV_SERVICE_PORT, "4242") };
        let config = Config::load(None);
        unsafe { std::env::remove_var(ENV_SERVICE_PORT) };
        assert_eq!(config.unwrap().local.port, 4242);
    }
}
