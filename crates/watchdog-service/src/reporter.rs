//! Self-health aggregation and cluster roll-up

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use watchdog_cleanup::CleanupEngine;
use watchdog_common::HealthState;
use watchdog_health::{HealthCheckEngine, REPORT_SOURCE};
use watchdog_metrics::MetricsEngine;
use watchdog_platform::PlatformHandle;
use watchdog_telemetry::TelemetrySink;

pub const PROP_SERVICE_HEALTH: &str = "WatchdogServiceHealth";
pub const PROP_HEALTH_CHECK_OPERATIONS: &str = "HealthCheckOperations";
pub const PROP_METRIC_OPERATIONS: &str = "MetricOperations";
pub const PROP_CLEANUP_OPERATIONS: &str = "CleanupOperations";

const CLUSTER_HEALTH_TIMEOUT: Duration = Duration::from_secs(4);

/// Reports the watchdog's own health, load, and a cluster health roll-up
pub struct SelfReporter {
    platform: Arc<PlatformHandle>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    health_engine: Option<Arc<HealthCheckEngine>>,
    metrics_engine: Option<Arc<MetricsEngine>>,
    cleanup_engine: Option<Arc<CleanupEngine>>,
    listener_count: Arc<AtomicUsize>,
    application: String,
    service_name: String,
    partition: Uuid,
}

impl SelfReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<PlatformHandle>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
        health_engine: Option<Arc<HealthCheckEngine>>,
        metrics_engine: Option<Arc<MetricsEngine>>,
        cleanup_engine: Option<Arc<CleanupEngine>>,
        listener_count: Arc<AtomicUsize>,
        application: &str,
        service_name: &str,
        partition: Uuid,
    ) -> Self {
        Self {
            platform,
            telemetry,
            health_engine,
            metrics_engine,
            cleanup_engine,
            listener_count,
            application: application.to_string(),
            service_name: service_name.to_string(),
            partition,
        }
    }

    /// Aggregate this service's own health.
    ///
    /// Starts at Ok and only worsens; each missing or unhealthy dependency
    /// appends a line to the description.
    pub fn self_health(&self) -> (HealthState, String) {
        let mut state = HealthState::Ok;
        let mut description = String::new();
        let mut degrade = |text: &str| {
            description.push_str(text);
            description.push('\n');
        };

        if self.telemetry.is_none() {
            state = state.worsen(HealthState::Error);
            degrade("the telemetry logger is not present");
        }
        match &self.health_engine {
            None => {
                state = state.worsen(HealthState::Error);
                degrade("the health-check engine is not present");
            }
            Some(engine) if engine.health_state() == HealthState::Error => {
                state = state.worsen(HealthState::Error);
                degrade("the health-check engine reports an error");
            }
            Some(_) => {}
        }
        match &self.metrics_engine {
            None => {
                state = state.worsen(HealthState::Error);
                degrade("the metrics engine is not present");
            }
            Some(engine) if engine.health_state() == HealthState::Error => {
                state = state.worsen(HealthState::Error);
                degrade("the metrics engine reports an error");
            }
            Some(_) => {}
        }
        if self.listener_count.load(Ordering::Acquire) == 0 {
            state = state.worsen(HealthState::Error);
            degrade("no endpoints are listening");
        }

        (state, description)
    }

    /// One reporting pass: four partition-health events, own load, and the
    /// cluster roll-up
    pub async fn report(&self) {
        let client = self.platform.client();
        let (own_state, description) = self.self_health();

        let engine_states = [
            (PROP_SERVICE_HEALTH, own_state, description.as_str()),
            (
                PROP_HEALTH_CHECK_OPERATIONS,
                self.health_engine
                    .as_ref()
                    .map_or(HealthState::Error, |e| e.health_state()),
                "",
            ),
            (
                PROP_METRIC_OPERATIONS,
                self.metrics_engine
                    .as_ref()
                    .map_or(HealthState::Error, |e| e.health_state()),
                "",
            ),
            (
                PROP_CLEANUP_OPERATIONS,
                self.cleanup_engine
                    .as_ref()
                    .map_or(HealthState::Error, |e| e.health_state()),
                "",
            ),
        ];
        for (property, state, detail) in engine_states {
            if let Err(e) = client
                .report_partition_health(self.partition, REPORT_SOURCE, property, state, detail)
                .await
            {
                warn!("failed to report {}: {}", property, e);
            }
        }

        self.report_own_load(&client).await;
        self.report_cluster_rollup(&client).await;
    }

    async fn report_own_load(&self, client: &Arc<dyn watchdog_platform::PlatformClient>) {
        let observed = self
            .metrics_engine
            .as_ref()
            .map_or(0, |e| e.observed_count()) as i64;
        let registered = self
            .health_engine
            .as_ref()
            .map_or(0, |e| e.registered_count()) as i64;
        let load = [
            ("ObservedMetricCount".to_string(), observed),
            ("HealthCheckCount".to_string(), registered),
        ];
        if let Err(e) = client.report_load(self.partition, &load).await {
            warn!("failed to report own load: {}", e);
        }
        if let Some(sink) = &self.telemetry {
            for (name, value) in &load {
                sink.report_metric(
                    &self.service_name,
                    &self.partition.to_string(),
                    name,
                    *value as f64,
                )
                .await;
            }
        }
    }

    async fn report_cluster_rollup(&self, client: &Arc<dyn watchdog_platform::PlatformClient>) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        let cluster = match client.cluster_health(CLUSTER_HEALTH_TIMEOUT).await {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!("cluster health query failed: {}", e);
                return;
            }
        };

        sink.report_health(
            &self.application,
            &self.service_name,
            "cluster",
            REPORT_SOURCE,
            "ClusterHealth",
            cluster.aggregate,
        )
        .await;

        for app in cluster
            .applications
            .iter()
            .filter(|a| a.state != HealthState::Ok)
        {
            sink.report_health(
                &app.name,
                "",
                "",
                REPORT_SOURCE,
                "ApplicationHealth",
                app.state,
            )
            .await;
        }
        for node in cluster.nodes.iter().filter(|n| n.state != HealthState::Ok) {
            sink.report_health("", "", &node.name, REPORT_SOURCE, "NodeHealth", node.state)
                .await;
        }
    }
}
