//! Runtime configuration: TOML file merged with `EVID_*` environment
//! overrides. Invalid values never abort startup; they fall back to
//! the documented default with a warning.

use chrono::Duration;
use evid_refresh::{RefreshConfig, WorkerConfig};
use evid_store::ValidationBand;
use evid_types::StalenessThresholds;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvidConfig {
    pub db_path: PathBuf,
    pub bind_addr: String,
    /// Age in seconds beyond which an active claim set is stale.
    pub ttl_seconds: i64,
    pub running_stale_seconds: i64,
    pub queued_stale_seconds: i64,
    pub worker_id: Option<String>,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub validation_min_ratio: f64,
    pub validation_max_ratio: f64,
}

impl Default for EvidConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".evid/evid.db"),
            bind_addr: "127.0.0.1:8080".to_string(),
            ttl_seconds: 604_800,
            running_stale_seconds: 300,
            queued_stale_seconds: 60,
            worker_id: None,
            poll_interval_ms: 500,
            heartbeat_interval_ms: 30_000,
            validation_min_ratio: 0.2,
            validation_max_ratio: 5.0,
        }
    }
}

impl EvidConfig {
    /// Loads the file (when given), applies `EVID_*` env overrides,
    /// then clamps out-of-range values back to defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = match path {
            None => Self::default(),
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => match toml::from_str::<Self>(&text) {
                    Ok(config) => config,
                    Err(error) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %error,
                            "config file did not parse, using defaults"
                        );
                        Self::default()
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "config file unreadable, using defaults"
                    );
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(|var| std::env::var(var).ok());
        config.sanitize();
        config
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("EVID_DB_PATH") {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("EVID_BIND_ADDR") {
            self.bind_addr = value;
        }
        if let Some(value) = lookup("EVID_WORKER_ID") {
            self.worker_id = Some(value);
        }
        override_parsed(&mut self.ttl_seconds, "EVID_TTL_SECONDS", &lookup);
        override_parsed(
            &mut self.running_stale_seconds,
            "EVID_RUNNING_STALE_SECONDS",
            &lookup,
        );
        override_parsed(
            &mut self.queued_stale_seconds,
            "EVID_QUEUED_STALE_SECONDS",
            &lookup,
        );
        override_parsed(&mut self.poll_interval_ms, "EVID_POLL_INTERVAL_MS", &lookup);
        override_parsed(
            &mut self.heartbeat_interval_ms,
            "EVID_HEARTBEAT_INTERVAL_MS",
            &lookup,
        );
    }

    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.ttl_seconds <= 0 {
            tracing::warn!(value = self.ttl_seconds, "invalid ttl_seconds, using default");
            self.ttl_seconds = defaults.ttl_seconds;
        }
        if self.running_stale_seconds <= 0 {
            tracing::warn!(
                value = self.running_stale_seconds,
                "invalid running_stale_seconds, using default"
            );
            self.running_stale_seconds = defaults.running_stale_seconds;
        }
        if self.queued_stale_seconds <= 0 {
            tracing::warn!(
                value = self.queued_stale_seconds,
                "invalid queued_stale_seconds, using default"
            );
            self.queued_stale_seconds = defaults.queued_stale_seconds;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = defaults.poll_interval_ms;
        }
        if self.heartbeat_interval_ms == 0 {
            self.heartbeat_interval_ms = defaults.heartbeat_interval_ms;
        }
        if !(self.validation_min_ratio > 0.0 && self.validation_min_ratio < 1.0) {
            tracing::warn!(
                value = self.validation_min_ratio,
                "invalid validation_min_ratio, using default"
            );
            self.validation_min_ratio = defaults.validation_min_ratio;
        }
        if !(self.validation_max_ratio >= 1.0) {
            tracing::warn!(
                value = self.validation_max_ratio,
                "invalid validation_max_ratio, using default"
            );
            self.validation_max_ratio = defaults.validation_max_ratio;
        }
    }

    pub fn thresholds(&self) -> StalenessThresholds {
        StalenessThresholds {
            running_stale: Duration::seconds(self.running_stale_seconds),
            queued_stale: Duration::seconds(self.queued_stale_seconds),
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            ttl: Duration::seconds(self.ttl_seconds),
            thresholds: self.thresholds(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut worker = WorkerConfig::default();
        if let Some(worker_id) = &self.worker_id {
            worker.worker_id = worker_id.clone();
        }
        worker.poll_interval = std::time::Duration::from_millis(self.poll_interval_ms);
        worker.heartbeat_interval = std::time::Duration::from_millis(self.heartbeat_interval_ms);
        worker
    }

    pub fn validation_band(&self) -> ValidationBand {
        ValidationBand {
            min_ratio: self.validation_min_ratio,
            max_ratio: self.validation_max_ratio,
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        std::net::SocketAddr::from_str(&self.bind_addr)
            .map_err(|error| anyhow::anyhow!("invalid bind_addr '{}': {error}", self.bind_addr))
    }
}

fn override_parsed<T: FromStr>(
    field: &mut T,
    var: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    let Some(raw) = lookup(var) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *field = value,
        Err(_) => {
            tracing::warn!(var, raw, "env override did not parse, keeping current value");
        }
    }
}
