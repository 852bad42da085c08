//! Structured-log telemetry sink

use crate::TelemetrySink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::info;
use watchdog_common::HealthState;

/// Sink that writes every event as a structured tracing record.
///
/// Used when no external telemetry backend is configured, and doubles as the
/// local diagnostics stream alongside one.
pub struct LogSink {
    key: RwLock<String>,
}

impl LogSink {
    pub fn new(key: &str) -> Self {
        Self {
            key: RwLock::new(key.to_string()),
        }
    }
}

#[async_trait]
impl TelemetrySink for LogSink {
    async fn report_metric(&self, role: &str, instance: &str, name: &str, value: f64) {
        info!(
            target: "watchdog::telemetry",
            kind = "metric",
            role,
            instance,
            metric = name,
            value,
            "metric observed"
        );
    }

    async fn report_availability(
        &self,
        service: &str,
        instance: &str,
        test_name: &str,
        captured_at: DateTime<Utc>,
        duration: Duration,
        location: &str,
        success: bool,
    ) {
        info!(
            target: "watchdog::telemetry",
            kind = "availability",
            service,
            instance,
            test = test_name,
            captured_at = %captured_at.to_rfc3339(),
            duration_ms = duration.as_millis() as u64,
            location,
            success,
            "availability probe"
        );
    }

    async fn report_health(
        &self,
        application: &str,
        service: &str,
        instance: &str,
        source: &str,
        property: &str,
        state: HealthState,
    ) {
        info!(
            target: "watchdog::telemetry",
            kind = "health",
            application,
            service,
            instance,
            source,
            property,
            state = %state,
            "health observed"
        );
    }

    fn set_key(&self, key: &str) {
        *self.key.write() = key.to_string();
    }

    fn key(&self) -> String {
        self.key.read().clone()
    }
}
