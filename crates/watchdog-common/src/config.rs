//! Configuration for the watchdog service

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// The `watchdog` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub health_check_interval_secs: u64,
    pub metric_interval_secs: u64,
    pub diagnostic_interval_secs: u64,
    pub diagnostic_time_to_keep_secs: u64,
    pub diagnostic_target_count: u64,
    pub diagnostic_endpoint: String,
    pub diagnostic_sas_token: String,
    pub report_interval_secs: u64,
    pub telemetry_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 5 * 60,
            metric_interval_secs: 5 * 60,
            diagnostic_interval_secs: 2 * 60,
            diagnostic_time_to_keep_secs: 10 * 24 * 3600,
            diagnostic_target_count: 8_000,
            diagnostic_endpoint: String::new(),
            diagnostic_sas_token: String::new(),
            report_interval_secs: 60,
            telemetry_key: String::new(),
        }
    }
}

impl Settings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn metric_interval(&self) -> Duration {
        Duration::from_secs(self.metric_interval_secs)
    }

    pub fn diagnostic_interval(&self) -> Duration {
        Duration::from_secs(self.diagnostic_interval_secs)
    }

    pub fn diagnostic_time_to_keep(&self) -> Duration {
        Duration::from_secs(self.diagnostic_time_to_keep_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Load the `watchdog` section from an optional config file plus
    /// `WATCHDOG__`-prefixed environment overrides, falling back to defaults
    /// for anything missing.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("WATCHDOG")
                .separator("__")
                .prefix_separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        match cfg.get::<Settings>("watchdog") {
            Ok(settings) => Ok(settings),
            Err(config::ConfigError::NotFound(_)) => Ok(Settings::default()),
            Err(e) => Err(Error::Configuration(e.to_string())),
        }
    }
}

/// Atomically replaceable settings snapshot shared across the engines
pub struct SettingsHandle {
    inner: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(Arc::new(settings)),
        }
    }

    /// Current snapshot; callers hold it for at most one tick
    pub fn get(&self) -> Arc<Settings> {
        self.inner.read().clone()
    }

    pub fn replace(&self, settings: Settings) {
        *self.inner.write() = Arc::new(settings);
    }
}
