//! Recording sink for tests

use crate::TelemetrySink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::time::Duration;
use watchdog_common::HealthState;

/// A captured telemetry event
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Metric {
        role: String,
        instance: String,
        name: String,
        value: f64,
    },
    Availability {
        service: String,
        instance: String,
        test_name: String,
        captured_at: DateTime<Utc>,
        duration: Duration,
        location: String,
        success: bool,
    },
    Health {
        application: String,
        service: String,
        instance: String,
        source: String,
        property: String,
        state: HealthState,
    },
}

/// Sink that keeps every event in memory so tests can assert on the stream
#[derive(Default)]
pub struct RecordingSink {
    key: RwLock<String>,
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn metrics(&self) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, TelemetryEvent::Metric { .. }))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn report_metric(&self, role: &str, instance: &str, name: &str, value: f64) {
        self.events.lock().push(TelemetryEvent::Metric {
            role: role.to_string(),
            instance: instance.to_string(),
            name: name.to_string(),
            value,
        });
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
        self.events.lock().push(TelemetryEvent::Availability {
            service: service.to_string(),
            instance: instance.to_string(),
            test_name: test_name.to_string(),
            captured_at,
            duration,
            location: location.to_string(),
            success,
        });
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
        self.events.lock().push(TelemetryEvent::Health {
            application: application.to_string(),
            service: service.to_string(),
            instance: instance.to_string(),
            source: source.to_string(),
            property: property.to_string(),
            state,
        });
    }

    fn set_key(&self, key: &str) {
        *self.key.write() = key.to_string();
    }

    fn key(&self) -> String {
        self.key.read().clone()
    }
}
