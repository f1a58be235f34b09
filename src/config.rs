// src/config.rs

//! Manages daemon configuration: loading, command-line overrides, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// How a local queue name is derived for a discovered printer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NamingPolicy {
    /// Use the advertised service name.
    #[default]
    ServiceName,
    /// Use the make-and-model string.
    MakeModel,
    /// Use the last segment of the remote resource path.
    ResourceTail,
}

/// Which side of the connection queues jobs when all cluster members are busy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingPolicy {
    /// Hold the job locally until a member becomes idle.
    #[default]
    QueueOnClient,
    /// Hand the job to the least-loaded member even if busy.
    QueueOnServers,
}

/// Order in which allow/deny rules are evaluated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BrowseOrder {
    #[default]
    AllowDeny,
    DenyAllow,
}

/// When the auto-shutdown timer is armed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AutoShutdownOn {
    /// No registry entries remain.
    #[default]
    NoQueues,
    /// No jobs are active on any daemon-controlled queue.
    NoJobs,
}

/// Connection and retry settings for the local spooler.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpoolerConfig {
    #[serde(default = "default_spooler_host")]
    pub host: String,
    #[serde(default = "default_spooler_port")]
    pub port: u16,
    /// Per-RPC deadline for local spooler calls.
    #[serde(with = "humantime_serde", default = "default_spooler_timeout")]
    pub timeout: Duration,
    /// Consecutive-timeout ceiling after which queue creation is abandoned.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    /// Delay before a timed-out entry is retried.
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        Self {
            host: default_spooler_host(),
            port: default_spooler_port(),
            timeout: default_spooler_timeout(),
            retry_max: default_retry_max(),
            retry_delay: default_retry_delay(),
        }
    }
}

fn default_spooler_host() -> String {
    "localhost".to_string()
}
fn default_spooler_port() -> u16 {
    631
}
fn default_spooler_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_retry_max() -> u32 {
    5
}
fn default_retry_delay() -> Duration {
    Duration::from_secs(10)
}

/// Discovery-source settings: mDNS browsing and periodic polling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub mdns: bool,
    /// DNS-SD service types browsed for. Secure types must list the plain
    /// variant too if both are wanted.
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// Remote spoolers polled for their printer lists, as `host` or `host:port`.
    #[serde(default)]
    pub poll_servers: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// How long a poll-discovered printer stays confirmed without being re-seen.
    #[serde(with = "humantime_serde", default = "default_browse_timeout")]
    pub browse_timeout: Duration,
    /// Grace period for a queue learned from a previous session to be re-seen.
    #[serde(with = "humantime_serde", default = "default_confirm_window")]
    pub confirm_window: Duration,
    /// Per-RPC deadline for remote endpoint calls (capability and state fetches).
    #[serde(with = "humantime_serde", default = "default_endpoint_timeout")]
    pub endpoint_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mdns: true,
            service_types: default_service_types(),
            poll_servers: vec![],
            poll_interval: default_poll_interval(),
            browse_timeout: default_browse_timeout(),
            confirm_window: default_confirm_window(),
            endpoint_timeout: default_endpoint_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_service_types() -> Vec<String> {
    vec!["_ipp._tcp".to_string(), "_ipps._tcp".to_string()]
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_browse_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_confirm_window() -> Duration {
    Duration::from_secs(60)
}
fn default_endpoint_timeout() -> Duration {
    Duration::from_secs(10)
}

/// A manually declared cluster: any printer matching one of the member
/// patterns is mapped onto the declared local queue name.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManualCluster {
    pub name: String,
    /// Wildcard patterns matched against service name, make/model, and
    /// resource tail.
    pub members: Vec<String>,
}

/// Naming and clustering settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NamingConfig {
    /// Policy for printers reached through a remote spooler.
    #[serde(default)]
    pub remote_spooler: NamingPolicy,
    /// Policy for directly-attached network printers.
    #[serde(default)]
    pub network_printer: NamingPolicy,
    /// Whether printers resolving to the same local name are clustered
    /// automatically.
    #[serde(default = "default_true")]
    pub auto_clustering: bool,
    #[serde(default)]
    pub cluster: Vec<ManualCluster>,
}

/// Local queue management settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueuesConfig {
    /// Keep generated queues when their printer disappears or the daemon
    /// exits, instead of deleting them.
    #[serde(default)]
    pub keep_generated: bool,
    /// Whether created queues are shared by default.
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub load_balancing: LoadBalancingPolicy,
    /// Maximum queue creations handed to workers in one reconciler tick.
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
    /// How far other entries are pushed back when a tick saturates.
    #[serde(with = "humantime_serde", default = "default_pause_between_ticks")]
    pub pause_between_ticks: Duration,
    /// Lease requested for the spooler notification subscription.
    #[serde(with = "humantime_serde", default = "default_notify_lease")]
    pub notify_lease: Duration,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            keep_generated: false,
            shared: false,
            load_balancing: LoadBalancingPolicy::default(),
            max_per_tick: default_max_per_tick(),
            pause_between_ticks: default_pause_between_ticks(),
            notify_lease: default_notify_lease(),
        }
    }
}

fn default_max_per_tick() -> usize {
    5
}
fn default_pause_between_ticks() -> Duration {
    Duration::from_secs(2)
}
fn default_notify_lease() -> Duration {
    Duration::from_secs(86400)
}

/// One browse filter as written in the configuration file; compiled into a
/// matcher at startup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrowseFilterConfig {
    #[serde(default = "default_filter_sense")]
    pub sense: String,
    pub field: String,
    /// Regular expression against the field's string form. Absent means the
    /// field must carry the boolean TXT value `T`.
    #[serde(default)]
    pub pattern: Option<String>,
}

fn default_filter_sense() -> String {
    "match".to_string()
}

/// Access-control, browse-filter, and auto-shutdown settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub browse_order: BrowseOrder,
    /// Allowed source addresses, as `ip`, `net/prefix`, or `@LOCAL`.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub browse_filter: Vec<BrowseFilterConfig>,
    #[serde(default)]
    pub auto_shutdown: bool,
    #[serde(with = "humantime_serde", default = "default_auto_shutdown_timeout")]
    pub auto_shutdown_timeout: Duration,
    #[serde(default)]
    pub auto_shutdown_on: AutoShutdownOn,
}

fn default_auto_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8842
}

/// A raw representation of the config file before validation.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default = "default_cache_dir")]
    cache_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    spooler: SpoolerConfig,
    #[serde(default)]
    discovery: DiscoveryConfig,
    #[serde(default)]
    naming: NamingConfig,
    #[serde(default)]
    queues: QueuesConfig,
    #[serde(default)]
    policy: PolicyConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_cache_dir() -> String {
    "/var/cache/spoolbridge".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cache_dir: String,
    pub log_level: String,
    pub spooler: SpoolerConfig,
    pub discovery: DiscoveryConfig,
    pub naming: NamingConfig,
    pub queues: QueuesConfig,
    pub policy: PolicyConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            log_level: default_log_level(),
            spooler: SpoolerConfig::default(),
            discovery: DiscoveryConfig::default(),
            naming: NamingConfig::default(),
            queues: QueuesConfig::default(),
            policy: PolicyConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` by reading a TOML file and applying `-o key=value`
    /// command-line overrides on top of it.
    pub fn load(path: &str, overrides: &[(String, String)]) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            // A missing config file is not an error; the daemon runs with
            // defaults and overrides.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read config file '{path}'")),
        };

        let mut table: toml::Table = contents
            .parse()
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        for (key, value) in overrides {
            apply_override(&mut table, key, value)
                .with_context(|| format!("Invalid override '-o {key}={value}'"))?;
        }

        let raw: RawConfig = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid configuration in '{path}'"))?;

        let config = Config {
            cache_dir: raw.cache_dir,
            log_level: raw.log_level,
            spooler: raw.spooler,
            discovery: raw.discovery,
            naming: raw.naming,
            queues: raw.queues,
            policy: raw.policy,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.trim().is_empty() {
            return Err(anyhow!("cache_dir cannot be empty"));
        }
        if self.spooler.port == 0 {
            return Err(anyhow!("spooler.port cannot be 0"));
        }
        if self.spooler.host.trim().is_empty() {
            return Err(anyhow!("spooler.host cannot be empty"));
        }
        if self.spooler.timeout.is_zero() {
            return Err(anyhow!("spooler.timeout cannot be 0"));
        }
        if self.queues.max_per_tick == 0 {
            return Err(anyhow!("queues.max_per_tick cannot be 0"));
        }

        // A poll-discovered printer is only re-confirmed once per poll; a
        // browse timeout below the poll interval would expire every entry
        // between polls.
        if !self.discovery.poll_servers.is_empty()
            && self.discovery.browse_timeout < self.discovery.poll_interval
        {
            return Err(anyhow!(
                "discovery.browse_timeout ({:?}) must be >= discovery.poll_interval ({:?})",
                self.discovery.browse_timeout,
                self.discovery.poll_interval
            ));
        }

        for server in &self.discovery.poll_servers {
            if server.trim().is_empty() {
                return Err(anyhow!("discovery.poll_servers entries cannot be empty"));
            }
        }

        for cluster in &self.naming.cluster {
            if cluster.name.trim().is_empty() {
                return Err(anyhow!("naming.cluster entries need a non-empty name"));
            }
            if cluster.members.is_empty() {
                return Err(anyhow!(
                    "naming.cluster '{}' needs at least one member pattern",
                    cluster.name
                ));
            }
        }

        for filter in &self.policy.browse_filter {
            match filter.sense.as_str() {
                "match" | "not-match" => {}
                other => {
                    return Err(anyhow!(
                        "policy.browse_filter sense must be 'match' or 'not-match', got '{other}'"
                    ));
                }
            }
            if filter.field.trim().is_empty() {
                return Err(anyhow!("policy.browse_filter entries need a field"));
            }
            if let Some(pattern) = &filter.pattern {
                regex::Regex::new(pattern)
                    .with_context(|| format!("Invalid browse_filter pattern '{pattern}'"))?;
            }
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }

        Ok(())
    }
}

/// Sets a dotted-path key inside the parsed TOML tree, creating intermediate
/// tables as needed. Values are parsed as TOML scalars, falling back to a
/// plain string.
fn apply_override(table: &mut toml::Table, key: &str, value: &str) -> Result<()> {
    let mut segments: Vec<&str> = key.split('.').collect();
    let leaf = segments
        .pop()
        .ok_or_else(|| anyhow!("override key cannot be empty"))?;
    if leaf.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(anyhow!("override key has an empty segment"));
    }

    let mut current = table;
    for segment in segments {
        current = current
            .entry(segment.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow!("'{segment}' is not a table"))?;
    }

    let parsed = value
        .parse::<toml::Value>()
        .unwrap_or_else(|_| toml::Value::String(value.to_string()));
    current.insert(leaf.to_string(), parsed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_sets_nested_key() {
        let mut table = toml::Table::new();
        apply_override(&mut table, "spooler.port", "1631").unwrap();
        let raw: RawConfig = toml::Value::Table(table).try_into().unwrap();
        assert_eq!(raw.spooler.port, 1631);
    }

    #[test]
    fn browse_timeout_below_poll_interval_is_rejected() {
        let mut config = Config::default();
        config.discovery.poll_servers = vec!["print.example.org".into()];
        config.discovery.poll_interval = Duration::from_secs(120);
        config.discovery.browse_timeout = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
