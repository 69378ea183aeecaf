//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Secrets can be supplied through the environment instead of the file:
//! `STORE_API_KEY` and `SENSOR_PASSWORD`.

use crate::domain::timestamp::parse_utc_offset;
use crate::domain::types::{Granularity, OrgId, SensorId, StoreId, MAX_LINES};
use crate::infra::error::ConfigError;
use anyhow::Context;
use chrono::FixedOffset;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Upper bound for `poller.lookback_periods` (a leap year of hours)
pub const MAX_LOOKBACK_PERIODS: u32 = 24 * 366;

/// Upper bound for tolerance and threshold settings given in seconds (one week)
pub const MAX_TOLERANCE_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier used as a metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "counter-sync".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Project URL of the hosted table store (without /rest/v1)
    #[serde(default = "default_store_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            api_key: String::new(),
            table: default_table(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_store_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_table() -> String {
    "people_counting".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Full periods fetched before the current one
    #[serde(default = "default_lookback")]
    pub lookback_periods: u32,
    /// Records stamped further than this past now are dropped
    #[serde(default = "default_future_tolerance_secs")]
    pub future_tolerance_secs: u64,
    #[serde(default = "default_max_concurrent_sensors")]
    pub max_concurrent_sensors: usize,
    #[serde(default)]
    pub granularity: Granularity,
    /// Timeout for sensor requests
    #[serde(default = "default_request_timeout_ms")]
    pub sensor_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            lookback_periods: default_lookback(),
            future_tolerance_secs: default_future_tolerance_secs(),
            max_concurrent_sensors: default_max_concurrent_sensors(),
            granularity: Granularity::default(),
            sensor_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    900
}

fn default_lookback() -> u32 {
    3
}

fn default_future_tolerance_secs() -> u64 {
    300
}

fn default_max_concurrent_sensors() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    /// Rows inserted within this long after their period ended count as scheduled
    #[serde(default = "default_scheduled_threshold_secs")]
    pub scheduled_threshold_secs: u64,
    /// Ingestion older than this is reported stale (and fails /health)
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            scheduled_threshold_secs: default_scheduled_threshold_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_scheduled_threshold_secs() -> u64 {
    600
}

fn default_stale_after_secs() -> u64 {
    7_200
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Health/metrics HTTP port (0 to disable)
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { port: default_health_port() }
    }
}

fn default_health_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

/// Sensor entry as written in the TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct SensorToml {
    pub id: String,
    pub store_id: String,
    pub org_id: String,
    pub base_url: String,
    #[serde(default = "default_sensor_path")]
    pub path: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Offset the device clock runs in, e.g. "+02:00"
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    /// Lines to keep; empty means all
    #[serde(default)]
    pub lines: Vec<u8>,
    #[serde(default = "default_sensor_enabled")]
    pub enabled: bool,
}

fn default_sensor_path() -> String {
    "/cgi-bin/report.cgi".to_string()
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_sensor_enabled() -> bool {
    true
}

/// Validated sensor configuration
#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub id: SensorId,
    pub store_id: StoreId,
    pub org_id: OrgId,
    pub base_url: String,
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub utc_offset: FixedOffset,
    /// Sorted, unique, all within 1..=4
    pub lines: Vec<u8>,
    pub enabled: bool,
}

impl SensorConfig {
    fn from_toml(raw: SensorToml) -> Result<Self, ConfigError> {
        let utc_offset = parse_utc_offset(&raw.utc_offset)
            .map_err(|source| ConfigError::InvalidOffset { sensor: raw.id.clone(), source })?;

        let mut lines = if raw.lines.is_empty() { (1..=MAX_LINES).collect() } else { raw.lines };
        if let Some(&line) = lines.iter().find(|l| **l == 0 || **l > MAX_LINES) {
            return Err(ConfigError::InvalidLine { sensor: raw.id, line });
        }
        lines.sort_unstable();
        lines.dedup();

        Ok(Self {
            id: SensorId(raw.id),
            store_id: StoreId(raw.store_id),
            org_id: OrgId(raw.org_id),
            base_url: raw.base_url,
            path: raw.path,
            username: raw.username,
            password: raw.password,
            utc_offset,
            lines,
            enabled: raw.enabled,
        })
    }

    /// Full report URL (base + path)
    pub fn report_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }

    pub fn reports_all_lines(&self) -> bool {
        self.lines.len() == usize::from(MAX_LINES)
    }
}

fn check_max(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}

/// Seconds from the config as a chrono duration, saturating at the tolerance cap
pub fn secs_to_chrono(secs: u64) -> chrono::Duration {
    let capped = secs.min(MAX_TOLERANCE_SECS) as i64;
    chrono::Duration::try_seconds(capped).unwrap_or_else(chrono::Duration::zero)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub sensors: Vec<SensorToml>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    store: StoreConfig,
    poller: PollerConfig,
    retry: RetryConfig,
    diagnostics: DiagnosticsConfig,
    health_port: u16,
    metrics_interval_secs: u64,
    sensors: Vec<SensorConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            store: StoreConfig::default(),
            poller: PollerConfig::default(),
            retry: RetryConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            health_port: default_health_port(),
            metrics_interval_secs: default_metrics_interval_secs(),
            sensors: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file, applying env secret overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        config.apply_env_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Ok(Self::from_toml(toml_config)?)
    }

    fn from_toml(toml_config: TomlConfig) -> Result<Self, ConfigError> {
        if toml_config.poller.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroValue("poller.poll_interval_secs"));
        }
        if toml_config.poller.max_concurrent_sensors == 0 {
            return Err(ConfigError::ZeroValue("poller.max_concurrent_sensors"));
        }
        if toml_config.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroValue("retry.max_attempts"));
        }
        check_max(
            "poller.lookback_periods",
            u64::from(toml_config.poller.lookback_periods),
            u64::from(MAX_LOOKBACK_PERIODS),
        )?;
        check_max(
            "poller.future_tolerance_secs",
            toml_config.poller.future_tolerance_secs,
            MAX_TOLERANCE_SECS,
        )?;
        check_max(
            "diagnostics.scheduled_threshold_secs",
            toml_config.diagnostics.scheduled_threshold_secs,
            MAX_TOLERANCE_SECS,
        )?;

        let mut seen = HashSet::new();
        let mut sensors = Vec::with_capacity(toml_config.sensors.len());
        for raw in toml_config.sensors {
            if !seen.insert(raw.id.clone()) {
                return Err(ConfigError::DuplicateSensor(raw.id));
            }
            sensors.push(SensorConfig::from_toml(raw)?);
        }

        Ok(Self {
            site_id: toml_config.site.id,
            store: toml_config.store,
            poller: toml_config.poller,
            retry: toml_config.retry,
            diagnostics: toml_config.diagnostics,
            health_port: toml_config.health.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            sensors,
            config_file: "inline".to_string(),
        })
    }

    /// Fill secrets from the environment (env wins over the file)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("STORE_API_KEY").filter(|k| !k.is_empty()) {
            self.store.api_key = key;
        }
        if let Some(password) = lookup("SENSOR_PASSWORD").filter(|p| !p.is_empty()) {
            for sensor in self.sensors.iter_mut().filter(|s| s.username.is_some()) {
                sensor.password = Some(password.clone());
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn store_request_timeout(&self) -> Duration {
        Duration::from_millis(self.store.request_timeout_ms)
    }

    pub fn poller(&self) -> &PollerConfig {
        &self.poller
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.poll_interval_secs)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.poller.sensor_timeout_ms)
    }

    pub fn granularity(&self) -> Granularity {
        self.poller.granularity
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn scheduled_threshold(&self) -> chrono::Duration {
        secs_to_chrono(self.diagnostics.scheduled_threshold_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.diagnostics.stale_after_secs)
    }

    pub fn health_port(&self) -> u16 {
        self.health_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn sensors(&self) -> &[SensorConfig] {
        &self.sensors
    }

    pub fn enabled_sensors(&self) -> impl Iterator<Item = &SensorConfig> {
        self.sensors.iter().filter(|s| s.enabled)
    }

    pub fn sensor(&self, id: &str) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.id.as_str() == id)
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
