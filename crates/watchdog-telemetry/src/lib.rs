//! Telemetry sink abstraction for the cluster watchdog

mod log_sink;
mod recording;

pub use log_sink::LogSink;
pub use recording::{RecordingSink, TelemetryEvent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use watchdog_common::HealthState;

/// Destination for watchdog telemetry.
///
/// Implementations are best-effort: emission never fails the caller, a sink
/// that cannot deliver drops the event. The instrumentation key is mutable so
/// a configuration reload can repoint the sink without rebuilding it.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// A harvested load-metric observation
    async fn report_metric(&self, role: &str, instance: &str, name: &str, value: f64);

    /// Outcome of one availability probe
    #[allow(clippy::too_many_arguments)]
    async fn report_availability(
        &self,
        service: &str,
        instance: &str,
        test_name: &str,
        captured_at: DateTime<Utc>,
        duration: Duration,
        location: &str,
        success: bool,
    );

    /// A health-state observation for a cluster entity
    async fn report_health(
        &self,
        application: &str,
        service: &str,
        instance: &str,
        source: &str,
        property: &str,
        state: HealthState,
    );

    fn set_key(&self, key: &str);

    fn key(&self) -> String;
}

/// Create the default sink for the configured instrumentation key
pub fn create_sink(key: &str) -> Arc<dyn TelemetrySink> {
    Arc::new(LogSink::new(key))
}
