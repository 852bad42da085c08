//! Durable domain records: health checks, schedule items, metric subscriptions

use crate::error::{Error, Result};
use crate::ticks::{Ticks, TICKS_PER_SECOND};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// URI scheme of cluster service names
pub const SERVICE_SCHEME: &str = "fabric:";

/// Duration reported for a probe that failed before producing a response
pub const PROBE_DURATION_UNAVAILABLE: i64 = -1;

fn default_method() -> String {
    "GET".to_string()
}

fn default_frequency_secs() -> u64 {
    60
}

fn default_expected_ms() -> u64 {
    200
}

fn default_maximum_ms() -> u64 {
    5_000
}

/// A registered HTTP health probe, including the result of its last execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe name, reported as the health property
    pub name: String,
    /// Absolute service URI, e.g. `fabric:/App/Service`
    pub service_name: String,
    #[serde(default)]
    pub partition: Option<Uuid>,
    /// Named listener to probe; first listener when absent
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Path appended to the resolved endpoint address
    pub suffix_path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default = "default_frequency_secs")]
    pub frequency_secs: u64,
    /// Advisory expected round-trip time
    #[serde(default = "default_expected_ms")]
    pub expected_duration_ms: u64,
    /// Hard request cutoff
    #[serde(default = "default_maximum_ms")]
    pub maximum_duration_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub warning_status_codes: BTreeSet<u16>,
    #[serde(default)]
    pub error_status_codes: BTreeSet<u16>,

    // Result fields, owned by the engine.
    #[serde(default)]
    pub last_attempt: Option<Ticks>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub result_code: u16,
    #[serde(default)]
    pub duration_ms: i64,
}

impl HealthCheck {
    /// A probe with default timing, no body, and empty result fields
    pub fn new(
        name: &str,
        service_name: &str,
        partition: Option<Uuid>,
        suffix_path: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            service_name: service_name.to_string(),
            partition,
            endpoint: None,
            suffix_path: suffix_path.to_string(),
            method: default_method(),
            content: None,
            media_type: None,
            frequency_secs: default_frequency_secs(),
            expected_duration_ms: default_expected_ms(),
            maximum_duration_ms: default_maximum_ms(),
            headers: BTreeMap::new(),
            warning_status_codes: BTreeSet::new(),
            error_status_codes: BTreeSet::new(),
            last_attempt: None,
            failure_count: 0,
            result_code: 0,
            duration_ms: 0,
        }
    }

    /// Validate registration invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("health check name is empty".into()));
        }
        if !self.service_name.starts_with(SERVICE_SCHEME) {
            return Err(Error::InvalidArgument(format!(
                "service name '{}' is not an absolute {} URI",
                self.service_name, SERVICE_SCHEME
            )));
        }
        if self.suffix_path.is_empty() {
            return Err(Error::InvalidArgument("suffix path is empty".into()));
        }
        if self.content.is_some() && self.media_type.is_none() {
            return Err(Error::InvalidArgument(
                "media type is required when content is set".into(),
            ));
        }
        if self.frequency_secs == 0 {
            return Err(Error::InvalidArgument("frequency must be positive".into()));
        }
        if self.method.is_empty() || !self.method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(Error::InvalidArgument(format!(
                "'{}' is not an HTTP method",
                self.method
            )));
        }
        Ok(())
    }

    /// Durable key: service absolute path joined with the partition id
    pub fn key(&self) -> String {
        health_check_key(&self.service_name, self.partition)
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency_secs)
    }

    pub fn frequency_ticks(&self) -> i64 {
        self.frequency_secs as i64 * TICKS_PER_SECOND
    }

    pub fn maximum_duration(&self) -> Duration {
        Duration::from_millis(self.maximum_duration_ms)
    }
}

/// Durable key for a health check on `service_name` / `partition`
pub fn health_check_key(service_name: &str, partition: Option<Uuid>) -> String {
    let path = service_path(service_name);
    match partition {
        Some(p) => format!("{}/{}", path, p),
        None => format!("{}/", path),
    }
}

/// Absolute path of a service URI: `fabric:/App/Svc` → `/App/Svc`
pub fn service_path(service_name: &str) -> &str {
    service_name
        .strip_prefix(SERVICE_SCHEME)
        .unwrap_or(service_name)
}

/// Key prefix over the health-check map for the optional list filters.
///
/// The filters assemble a `fabric:/{app}/{svc}/{part}` URI; matching runs on
/// its absolute-path form because that is the stored key space.
pub fn health_check_prefix(
    app: Option<&str>,
    service: Option<&str>,
    partition: Option<&str>,
) -> String {
    match (app, service, partition) {
        (Some(a), Some(s), Some(p)) => format!("/{}/{}/{}", a, s, p),
        (Some(a), Some(s), None) => format!("/{}/{}", a, s),
        (Some(a), None, _) => format!("/{}", a),
        _ => String::new(),
    }
}

/// Key prefix over the metric-subscription map for the optional list filters
pub fn metric_check_prefix(
    app: Option<&str>,
    service: Option<&str>,
    partition: Option<&str>,
) -> String {
    match (app, service, partition) {
        (Some(a), Some(s), Some(p)) => format!("{}/{}/{}", a, s, p),
        (Some(a), Some(s), None) => format!("{}/{}", a, s),
        (Some(a), None, _) => a.to_string(),
        _ => String::new(),
    }
}

/// A pending execution token in the durable schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub execution_ticks: Ticks,
    pub key: String,
}

/// A load-metric subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCheck {
    pub metric_names: BTreeSet<String>,
    pub application: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub partition: Option<Uuid>,
}

impl MetricCheck {
    pub fn validate(&self) -> Result<()> {
        if self.application.is_empty() {
            return Err(Error::InvalidArgument("application name is empty".into()));
        }
        if self.metric_names.is_empty() || self.metric_names.iter().any(|n| n.is_empty()) {
            return Err(Error::InvalidArgument(
                "metric names must be non-empty".into(),
            ));
        }
        if self.partition.is_some() && self.service.is_none() {
            return Err(Error::InvalidArgument(
                "a partition subscription requires a service name".into(),
            ));
        }
        Ok(())
    }

    /// Durable key: `app`, `app/svc`, or `app/svc/partition`
    pub fn key(&self) -> String {
        match (&self.service, self.partition) {
            (Some(s), Some(p)) => format!("{}/{}/{}", self.application, s, p),
            (Some(s), None) => format!("{}/{}", self.application, s),
            _ => self.application.clone(),
        }
    }

    /// Full URI of the subscribed service, when one is named
    pub fn service_uri(&self) -> Option<String> {
        self.service
            .as_ref()
            .map(|s| format!("{}/{}/{}", SERVICE_SCHEME, self.application, s))
    }
}
