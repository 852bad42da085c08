//! Engine ownership, lifecycle, and configuration hot-reload

use crate::reporter::SelfReporter;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use watchdog_cleanup::{CleanupEngine, TableStore};
use watchdog_common::{HealthCheck, Result, Settings, SettingsHandle};
use watchdog_health::HealthCheckEngine;
use watchdog_metrics::MetricsEngine;
use watchdog_platform::PlatformHandle;
use watchdog_store::{AccessStatus, DurableStore, ReplicaRole};
use watchdog_telemetry::TelemetrySink;

/// Name of this watchdog's own probe
const SELF_PROBE_NAME: &str = "watchdog-self";

/// Extra wall-clock slack a tick gets beyond its interval
const TICK_WINDOW_SLACK: Duration = Duration::from_secs(30);

/// Lifecycle surface the hosting runtime drives
#[async_trait]
pub trait LifecycleHost: Send + Sync {
    /// The replica is opening; passive state may be prepared
    async fn open(&self) -> Result<()>;

    /// The replica became primary; active work starts here
    async fn run_primary(&self) -> Result<()>;

    /// The platform signalled potential data loss
    async fn data_loss(&self) -> Result<()>;

    /// The replica is closing
    async fn close(&self) -> Result<()>;
}

/// Identity of the watchdog service inside the cluster
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub application: String,
    pub service_name: String,
    pub partition: Uuid,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            application: "Watchdog".to_string(),
            service_name: "fabric:/Watchdog/WatchdogService".to_string(),
            partition: Uuid::new_v4(),
        }
    }
}

struct IntervalChannels {
    health: watch::Sender<Duration>,
    metric: watch::Sender<Duration>,
    diagnostic: watch::Sender<Duration>,
    report: watch::Sender<Duration>,
}

/// Owns the engines, the shared cancellation domain, and the settings
pub struct Coordinator {
    settings: Arc<SettingsHandle>,
    store: Arc<DurableStore>,
    telemetry: Arc<dyn TelemetrySink>,
    health_engine: Arc<HealthCheckEngine>,
    metrics_engine: Arc<MetricsEngine>,
    cleanup_engine: Arc<CleanupEngine>,
    reporter: Arc<SelfReporter>,
    cancel: CancellationToken,
    listener_count: Arc<AtomicUsize>,
    intervals: IntervalChannels,
    identity: ServiceIdentity,
}

impl Coordinator {
    pub fn new(
        settings: Settings,
        store: Arc<DurableStore>,
        platform: Arc<PlatformHandle>,
        telemetry: Arc<dyn TelemetrySink>,
        table_store: Arc<dyn TableStore>,
        identity: ServiceIdentity,
    ) -> Result<Self> {
        telemetry.set_key(&settings.telemetry_key);
        let intervals = IntervalChannels {
            health: watch::channel(settings.health_check_interval()).0,
            metric: watch::channel(settings.metric_interval()).0,
            diagnostic: watch::channel(settings.diagnostic_interval()).0,
            report: watch::channel(settings.report_interval()).0,
        };
        let settings = Arc::new(SettingsHandle::new(settings));

        let health_engine = Arc::new(HealthCheckEngine::new(
            store.clone(),
            platform.clone(),
            telemetry.clone(),
        )?);
        let metrics_engine = Arc::new(MetricsEngine::new(
            store.clone(),
            platform.clone(),
            telemetry.clone(),
        )?);
        let cleanup_engine = Arc::new(CleanupEngine::new(table_store, settings.clone()));

        let listener_count = Arc::new(AtomicUsize::new(0));
        let reporter = Arc::new(SelfReporter::new(
            platform,
            Some(telemetry.clone()),
            Some(health_engine.clone()),
            Some(metrics_engine.clone()),
            Some(cleanup_engine.clone()),
            listener_count.clone(),
            &identity.application,
            &identity.service_name,
            identity.partition,
        ));

        store.on_role_change(|role| {
            info!("store role changed to {:?}", role);
        });

        Ok(Self {
            settings,
            store,
            telemetry,
            health_engine,
            metrics_engine,
            cleanup_engine,
            reporter,
            cancel: CancellationToken::new(),
            listener_count,
            intervals,
            identity,
        })
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.get()
    }

    pub fn health_engine(&self) -> &Arc<HealthCheckEngine> {
        &self.health_engine
    }

    pub fn metrics_engine(&self) -> &Arc<MetricsEngine> {
        &self.metrics_engine
    }

    pub fn cleanup_engine(&self) -> &Arc<CleanupEngine> {
        &self.cleanup_engine
    }

    pub fn reporter(&self) -> &Arc<SelfReporter> {
        &self.reporter
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Called by the server once its listener is bound
    pub fn mark_listener_open(&self) {
        self.listener_count.fetch_add(1, Ordering::Release);
    }

    pub fn mark_listener_closed(&self) {
        self.listener_count.fetch_sub(1, Ordering::Release);
    }

    /// Aggregate status for `GET /watchdog/health`
    pub fn watchdog_health(&self) -> WatchdogHealth {
        if self.store.read_status() != AccessStatus::Granted {
            return WatchdogHealth::Unavailable;
        }
        if self.health_engine.registered_count() == 0 {
            WatchdogHealth::NoChecksRegistered
        } else {
            WatchdogHealth::Ok
        }
    }

    /// Apply a new configuration snapshot without restarting the engines.
    ///
    /// Interval changes land through watch channels, so each loop retunes on
    /// its next wakeup with engine state untouched.
    pub fn apply_settings(&self, new: Settings) {
        self.telemetry.set_key(&new.telemetry_key);
        let _ = self.intervals.health.send(new.health_check_interval());
        let _ = self.intervals.metric.send(new.metric_interval());
        let _ = self.intervals.diagnostic.send(new.diagnostic_interval());
        let _ = self.intervals.report.send(new.report_interval());
        self.settings.replace(new);
        info!("configuration reloaded");
    }

    /// Spawn the four periodic loops under the shared cancellation token
    pub fn start_loops(&self) {
        let health_engine = self.health_engine.clone();
        spawn_periodic(
            "health-check",
            self.intervals.health.subscribe(),
            self.cancel.clone(),
            move |cancel| {
                let engine = health_engine.clone();
                async move { engine.run_tick(&cancel).await }
            },
        );

        let metrics_engine = self.metrics_engine.clone();
        spawn_periodic(
            "metrics",
            self.intervals.metric.subscribe(),
            self.cancel.clone(),
            move |cancel| {
                let engine = metrics_engine.clone();
                async move { engine.run_tick(&cancel).await }
            },
        );

        let cleanup_engine = self.cleanup_engine.clone();
        spawn_periodic(
            "cleanup",
            self.intervals.diagnostic.subscribe(),
            self.cancel.clone(),
            move |cancel| {
                let engine = cleanup_engine.clone();
                async move { engine.run_tick(&cancel).await }
            },
        );

        let reporter = self.reporter.clone();
        spawn_periodic(
            "self-report",
            self.intervals.report.subscribe(),
            self.cancel.clone(),
            move |_cancel| {
                let reporter = reporter.clone();
                async move { reporter.report().await }
            },
        );
    }

    /// Register the watchdog's own probe so the service monitors itself
    pub async fn register_self_probe(&self) {
        let check = HealthCheck::new(
            SELF_PROBE_NAME,
            &self.identity.service_name,
            Some(self.identity.partition),
            "watchdog/health",
        );
        if let Err(e) = self.health_engine.register(check).await {
            warn!("could not register the self probe: {}", e);
        }
    }
}

#[async_trait]
impl LifecycleHost for Coordinator {
    async fn open(&self) -> Result<()> {
        info!(
            "watchdog opening as {} ({})",
            self.identity.service_name, self.identity.partition
        );
        Ok(())
    }

    async fn run_primary(&self) -> Result<()> {
        self.store.set_role(ReplicaRole::Primary);
        self.register_self_probe().await;
        info!("watchdog promoted to primary");
        Ok(())
    }

    async fn data_loss(&self) -> Result<()> {
        warn!("potential data loss reported; registrations will repopulate the state");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.store.flush().await?;
        info!("watchdog closed");
        Ok(())
    }
}

/// Aggregate health of the watchdog itself, as exposed on the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogHealth {
    Ok,
    NoChecksRegistered,
    Unavailable,
}

/// Drive `task` once per interval.
///
/// Each run is serial with itself; a run that overran its interval is
/// followed immediately by the next one. Interval changes from the watch
/// channel retune the timer without touching the task, and the token stops
/// the loop at its next wakeup.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    mut interval_rx: watch::Receiver<Duration>,
    cancel: CancellationToken,
    task: F,
) where
    F: Fn(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut fire_immediately = false;
        loop {
            let period = *interval_rx.borrow_and_update();
            if !fire_immediately {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        debug!("{} interval retuned", name);
                        continue;
                    }
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let window = period + TICK_WINDOW_SLACK;
            if tokio::time::timeout(window, task(cancel.clone())).await.is_err() {
                warn!("{} tick exceeded its {}s window", name, window.as_secs());
            }
            fire_immediately = started.elapsed() >= period;
        }
        debug!("{} loop stopped", name);
    });
}
