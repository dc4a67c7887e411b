//! Layered settings: built-in defaults < JSON file < environment / command line.
//!
//! `Settings` is both a `clap::Args` (every flag has an env var) and a serde
//! struct (camelCase keys), so the same shape is read from all three layers and
//! merged field by field. The merged value is then resolved into the typed
//! configs the core takes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::core::collapsible::CollapsibleDefaults;
use crate::core::latency::{ProbeSettings, DEFAULT_TEST_URL};
use crate::core::roster::StoreSettings;
use crate::pipeline::filter_sort::{FilterState, SortBy};
use crate::retrieve::{ApiConfig, QueryRetry};
use crate::streaming::reveal::StreamingConfig;

/// Settings file read when `--config-path` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "roster.conf";

#[derive(Args, Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[clap(long, env = "ROSTER_CONFIG_PATH", help = "Path to the JSON settings file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ROSTER_BASE_URL", help = "Control API base URL, e.g. http://127.0.0.1:9090.")]
    pub base_url: Option<String>,

    #[clap(long, env = "ROSTER_SECRET", hide_env_values = true, help = "Bearer secret for the control API.")]
    pub secret: Option<String>,

    #[clap(long, env = "ROSTER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ROSTER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ROSTER_TEST_URL", help = "URL probed through each proxy.")]
    pub test_url: Option<String>,

    #[clap(long, env = "ROSTER_PROBE_TIMEOUT_MS", help = "Per-probe timeout in milliseconds.")]
    pub probe_timeout_ms: Option<u64>,

    #[clap(long, env = "ROSTER_MAX_CONCURRENT_PROBES", help = "Upper bound on probe requests in flight.")]
    pub max_concurrent_probes: Option<usize>,

    #[clap(long, env = "ROSTER_RETRY_MAX_ATTEMPTS", help = "Attempts per roster query.")]
    pub retry_max_attempts: Option<u32>,

    #[clap(long, env = "ROSTER_RETRY_BASE_DELAY_MS", help = "Base backoff delay for roster queries in milliseconds.")]
    pub retry_base_delay_ms: Option<u64>,

    #[clap(long, env = "ROSTER_RETRY_MAX_DELAY_MS", help = "Backoff ceiling for roster queries in milliseconds.")]
    pub retry_max_delay_ms: Option<u64>,

    #[clap(long, env = "ROSTER_BATCH_SIZE", help = "Rows revealed per streaming batch.")]
    pub batch_size: Option<usize>,

    #[clap(long, env = "ROSTER_INTER_BATCH_DELAY_MS", help = "Delay between streaming batches in milliseconds.")]
    pub inter_batch_delay_ms: Option<u64>,

    #[clap(long, env = "ROSTER_INITIAL_DELAY_MS", help = "Delay before the first streaming batch in milliseconds.")]
    pub initial_delay_ms: Option<u64>,

    #[clap(long, env = "ROSTER_GROUPS_OPEN", help = "Whether groups start expanded.")]
    pub groups_open: Option<bool>,

    #[clap(long, env = "ROSTER_PROVIDERS_OPEN", help = "Whether providers start expanded.")]
    pub providers_open: Option<bool>,

    #[clap(long, env = "ROSTER_AUTO_CLOSE_OLD_CONNS", help = "Close connections of the previous member after a switch.")]
    pub auto_close_old_conns: Option<bool>,

    #[clap(long, env = "ROSTER_CONFIRM_CLOSE_PREV_CONNS", help = "Ask before closing those connections.")]
    pub confirm_close_prev_conns: Option<bool>,

    #[clap(long, env = "ROSTER_SORT_BY", help = "Member order: Natural, LatencyAsc or NameAsc.")]
    pub sort_by: Option<SortBy>,

    #[clap(long, env = "ROSTER_HIDE_UNAVAILABLE", help = "Hide members whose last probe failed.")]
    pub hide_unavailable: Option<bool>,
}

impl Settings {
    /// Built-in defaults, the bottom layer.
    pub fn defaults() -> Self {
        let probe = ProbeSettings::default();
        let retry = QueryRetry::default();
        let streaming = StreamingConfig::default();
        let collapsible = CollapsibleDefaults::default();
        Self {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            test_url: Some(DEFAULT_TEST_URL.to_string()),
            probe_timeout_ms: Some(probe.timeout.as_millis() as u64),
            max_concurrent_probes: Some(probe.max_concurrent),
            retry_max_attempts: Some(retry.max_attempts),
            retry_base_delay_ms: Some(retry.base_delay.as_millis() as u64),
            retry_max_delay_ms: Some(retry.max_delay.as_millis() as u64),
            batch_size: Some(streaming.batch_size),
            inter_batch_delay_ms: Some(streaming.inter_batch_delay.as_millis() as u64),
            initial_delay_ms: Some(streaming.initial_delay.as_millis() as u64),
            groups_open: Some(collapsible.proxy_group),
            providers_open: Some(collapsible.proxy_provider),
            auto_close_old_conns: Some(false),
            confirm_close_prev_conns: Some(false),
            sort_by: Some(SortBy::Natural),
            hide_unavailable: Some(false),
            ..Default::default()
        }
    }

    /// `other` wins wherever it has a value.
    pub fn merge(self, other: Settings) -> Settings {
        Settings {
            config_path: other.config_path.or(self.config_path),
            base_url: other.base_url.or(self.base_url),
            secret: other.secret.or(self.secret),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            test_url: other.test_url.or(self.test_url),
            probe_timeout_ms: other.probe_timeout_ms.or(self.probe_timeout_ms),
            max_concurrent_probes: other.max_concurrent_probes.or(self.max_concurrent_probes),
            retry_max_attempts: other.retry_max_attempts.or(self.retry_max_attempts),
            retry_base_delay_ms: other.retry_base_delay_ms.or(self.retry_base_delay_ms),
            retry_max_delay_ms: other.retry_max_delay_ms.or(self.retry_max_delay_ms),
            batch_size: other.batch_size.or(self.batch_size),
            inter_batch_delay_ms: other.inter_batch_delay_ms.or(self.inter_batch_delay_ms),
            initial_delay_ms: other.initial_delay_ms.or(self.initial_delay_ms),
            groups_open: other.groups_open.or(self.groups_open),
            providers_open: other.providers_open.or(self.providers_open),
            auto_close_old_conns: other.auto_close_old_conns.or(self.auto_close_old_conns),
            confirm_close_prev_conns: other.confirm_close_prev_conns.or(self.confirm_close_prev_conns),
            sort_by: other.sort_by.or(self.sort_by),
            hide_unavailable: other.hide_unavailable.or(self.hide_unavailable),
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.base_url.clone().filter(|u| !u.trim().is_empty()),
            secret: self.secret.clone().filter(|s| !s.is_empty()),
        }
    }

    pub fn query_retry(&self) -> QueryRetry {
        let d = QueryRetry::default();
        QueryRetry {
            max_attempts: self.retry_max_attempts.unwrap_or(d.max_attempts).max(1),
            base_delay: self.retry_base_delay_ms.map(Duration::from_millis).unwrap_or(d.base_delay),
            max_delay: self.retry_max_delay_ms.map(Duration::from_millis).unwrap_or(d.max_delay),
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        let d = ProbeSettings::default();
        ProbeSettings {
            timeout: self.probe_timeout_ms.map(Duration::from_millis).unwrap_or(d.timeout),
            max_concurrent: self.max_concurrent_probes.unwrap_or(d.max_concurrent).max(1),
        }
    }

    pub fn collapsible_defaults(&self) -> CollapsibleDefaults {
        let d = CollapsibleDefaults::default();
        CollapsibleDefaults {
            proxy_group: self.groups_open.unwrap_or(d.proxy_group),
            proxy_provider: self.providers_open.unwrap_or(d.proxy_provider),
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            retry: self.query_retry(),
            probe: self.probe_settings(),
            test_url: self.test_url.clone().unwrap_or_else(|| DEFAULT_TEST_URL.to_string()),
            collapsible: self.collapsible_defaults(),
            confirm_close_prev_conns: self.confirm_close_prev_conns.unwrap_or(false),
        }
    }

    pub fn streaming_config(&self) -> StreamingConfig {
        let d = StreamingConfig::default();
        StreamingConfig {
            batch_size: self.batch_size.unwrap_or(d.batch_size).max(1),
            inter_batch_delay: self.inter_batch_delay_ms.map(Duration::from_millis).unwrap_or(d.inter_batch_delay),
            initial_delay: self.initial_delay_ms.map(Duration::from_millis).unwrap_or(d.initial_delay),
        }
    }

    pub fn filter_state(&self) -> FilterState {
        FilterState {
            text: String::new(),
            sort_by: self.sort_by.unwrap_or_default(),
            hide_unavailable: self.hide_unavailable.unwrap_or(false),
        }
    }

    pub fn auto_close_old_conns(&self) -> bool {
        self.auto_close_old_conns.unwrap_or(false)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Reads a settings file. A missing file is `Ok(None)`.
pub fn read_settings_file(path: &Path) -> std::io::Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map(Some).map_err(std::io::Error::other)
}

/// Layers defaults, the settings file and `cli` (which already carries env vars).
///
/// An unreadable or malformed file is logged and skipped.
pub fn load_settings(cli: Settings) -> Settings {
    let path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut current = Settings::defaults();

    match read_settings_file(&path) {
        Ok(Some(file)) => current = current.merge(file),
        Ok(None) => log::info!("Settings file not found at {}. Using defaults and environment/CLI values.", path.display()),
        Err(e) => log::warn!("Failed to load settings file {}: {}. Falling back to other sources.", path.display(), e),
    }

    current.merge(cli)
}
