//! Load-metric harvesting engine
//!
//! For every registered subscription the tick pulls load data from the
//! platform (per partition, per service with paged enumeration, or per
//! application) and fans the matching reports out to the telemetry sink.

mod paging;

pub use paging::{collect_pages, retry_transient, ENUMERATION_RETRY_BUDGET};

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;
use watchdog_common::types::metric_check_prefix;
use watchdog_common::{Error, HealthState, MetricCheck, Result};
use watchdog_platform::{PartitionStatus, PlatformClient, PlatformHandle, ReplicaStatus};
use watchdog_store::{AccessStatus, DurableMap, DurableStore};
use watchdog_telemetry::TelemetrySink;

const SUBSCRIPTION_MAP: &str = "mc";

/// Periodically pulls load metrics for every registered subscription
pub struct MetricsEngine {
    store: Arc<DurableStore>,
    subscriptions: DurableMap<String, MetricCheck>,
    platform: Arc<PlatformHandle>,
    telemetry: Arc<dyn TelemetrySink>,
    observed: AtomicU64,
    health: RwLock<HealthState>,
}

impl MetricsEngine {
    pub fn new(
        store: Arc<DurableStore>,
        platform: Arc<PlatformHandle>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let subscriptions = store.get_or_create::<String, MetricCheck>(SUBSCRIPTION_MAP)?;
        Ok(Self {
            store,
            subscriptions,
            platform,
            telemetry,
            observed: AtomicU64::new(0),
            health: RwLock::new(HealthState::Ok),
        })
    }

    /// Metrics emitted since this engine started
    pub fn observed_count(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    pub fn health_state(&self) -> HealthState {
        *self.health.read()
    }

    /// Upsert a subscription.
    ///
    /// A closed platform client is refreshed and reported as success; the
    /// caller's external retry covers the write.
    pub async fn register(&self, check: MetricCheck) -> Result<()> {
        check.validate()?;
        match self.upsert(&check).await {
            Err(Error::PlatformClosed) => {
                warn!("platform client closed during registration, refreshing");
                self.platform.refresh();
                Ok(())
            }
            other => other,
        }
    }

    async fn upsert(&self, check: &MetricCheck) -> Result<()> {
        let mut tx = self.store.begin();
        self.subscriptions
            .add_or_update(&mut tx, &check.key(), check)?;
        tx.commit()?;
        self.store.flush().await?;
        debug!("metric subscription '{}' registered", check.key());
        Ok(())
    }

    /// Ordered snapshot of subscriptions under the filter prefix
    pub fn list(
        &self,
        app: Option<&str>,
        service: Option<&str>,
        partition: Option<&str>,
    ) -> Result<Vec<MetricCheck>> {
        match self.store.read_status() {
            AccessStatus::Granted => {}
            AccessStatus::NotPrimary => return Err(Error::NotPrimary),
            status => return Err(Error::Transient(format!("read access denied: {:?}", status))),
        }
        let prefix = metric_check_prefix(app, service, partition);
        let tx = self.store.begin();
        let entries = self.subscriptions.iter_ordered(
            &tx,
            (!prefix.is_empty()).then_some(prefix.as_bytes()),
        )?;
        Ok(entries.into_iter().map(|(_, check)| check).collect())
    }

    /// One tick with health bookkeeping; never lets an error escape
    pub async fn run_tick(&self, cancel: &CancellationToken) {
        if let Err(e) = self.tick(cancel).await {
            error!("metrics tick failed: {}", e);
            *self.health.write() = HealthState::Error;
        }
    }

    /// Harvest every subscription once
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.store.access_granted() {
            debug!("store access not granted, skipping metrics tick");
            return Ok(());
        }

        let subscriptions = {
            let tx = self.store.begin();
            self.subscriptions.iter_ordered(&tx, None)?
        };

        let client = self.platform.client();
        let mut pass = HealthState::Ok;
        for (key, subscription) in subscriptions {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.harvest(&client, &subscription).await {
                Ok(()) => {}
                Err(Error::NotFound(what)) => {
                    warn!("subscription '{}' targets a missing entity: {}", key, what);
                    pass = pass.worsen(HealthState::Warning);
                }
                Err(e) if e.is_transient() => {
                    debug!("subscription '{}' gave up after transient faults: {}", key, e);
                }
                Err(e) => return Err(e),
            }
        }

        *self.health.write() = pass;
        Ok(())
    }

    async fn harvest(&self, client: &Arc<dyn PlatformClient>, sub: &MetricCheck) -> Result<()> {
        match (&sub.service, sub.partition) {
            (Some(service), Some(partition)) => {
                self.harvest_partition(client, service, partition).await
            }
            (Some(service), None) => self.harvest_service(client, sub, service).await,
            (None, _) => self.harvest_application(client, sub).await,
        }
    }

    async fn harvest_partition(
        &self,
        client: &Arc<dyn PlatformClient>,
        service: &str,
        partition: Uuid,
    ) -> Result<()> {
        let load = retry_call(client, |c| async move { c.partition_load(partition).await }).await?;
        for report in load.primary_reports {
            self.emit(service, &partition.to_string(), &report.name, report.value)
                .await;
        }
        Ok(())
    }

    async fn harvest_service(
        &self,
        client: &Arc<dyn PlatformClient>,
        sub: &MetricCheck,
        service: &str,
    ) -> Result<()> {
        let uri = sub.service_uri().unwrap_or_default();

        let partitions = {
            let uri = uri.clone();
            let client = client.clone();
            collect_pages(ENUMERATION_RETRY_BUDGET, move |token| {
                let client = client.clone();
                let uri = uri.clone();
                async move { client.partition_list(&uri, token).await }
            })
            .await?
        };

        for partition in partitions {
            if partition.status != PartitionStatus::Ready {
                continue;
            }
            let replicas = {
                let client = client.clone();
                let partition_id = partition.id;
                collect_pages(ENUMERATION_RETRY_BUDGET, move |token| {
                    let client = client.clone();
                    async move { client.replica_list(partition_id, token).await }
                })
                .await?
            };

            for replica in replicas {
                if replica.status != ReplicaStatus::Ready {
                    continue;
                }
                let partition_id = partition.id;
                let replica_id = replica.id;
                let load = retry_call(client, |c| async move {
                    c.replica_load(partition_id, replica_id).await
                })
                .await?;
                for report in load.reports {
                    if sub.metric_names.contains(&report.name) {
                        self.emit(service, &replica.id.to_string(), &report.name, report.value)
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn harvest_application(
        &self,
        client: &Arc<dyn PlatformClient>,
        sub: &MetricCheck,
    ) -> Result<()> {
        let application = sub.application.clone();
        let load = retry_call(client, |c| {
            let application = application.clone();
            async move { c.app_load(&application).await }
        })
        .await?;
        for report in load.reports {
            if sub.metric_names.contains(&report.name) {
                self.emit(&sub.application, &sub.application, &report.name, report.value)
                    .await;
            }
        }
        Ok(())
    }

    async fn emit(&self, role: &str, instance: &str, name: &str, value: f64) {
        self.telemetry
            .report_metric(role, instance, name, value)
            .await;
        self.observed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Retry a single (non-paged) platform call with the shared budget
async fn retry_call<T, F, Fut>(client: &Arc<dyn PlatformClient>, call: F) -> Result<T>
where
    F: Fn(Arc<dyn PlatformClient>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_transient(ENUMERATION_RETRY_BUDGET, || call(client.clone())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use watchdog_platform::{
        ApplicationLoadInfo, LoadMetricReport, PartitionLoadInfo, Replica, ReplicaLoadInfo,
        ReplicaRole, SimPartition, SimPlatform,
    };
    use watchdog_store::ReplicaRole as StoreRole;
    use watchdog_telemetry::{RecordingSink, TelemetryEvent};

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: MetricsEngine,
        sim: Arc<SimPlatform>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(sim: Arc<SimPlatform>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path()).unwrap());
        store.set_role(StoreRole::Primary);
        let sim_for_handle = sim.clone();
        let platform = Arc::new(PlatformHandle::fixed(sim_for_handle));
        let sink = Arc::new(RecordingSink::new());
        let engine = MetricsEngine::new(store, platform, sink.clone()).unwrap();
        Fixture {
            _dir: dir,
            engine,
            sim,
            sink,
        }
    }

    fn subscription(names: &[&str], app: &str, svc: Option<&str>, partition: Option<Uuid>) -> MetricCheck {
        MetricCheck {
            metric_names: names.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>(),
            application: app.to_string(),
            service: svc.map(str::to_string),
            partition,
        }
    }

    #[tokio::test]
    async fn register_and_list_with_prefix() {
        let f = fixture(Arc::new(SimPlatform::new()));
        f.engine
            .register(subscription(&["reads"], "AppA", None, None))
            .await
            .unwrap();
        f.engine
            .register(subscription(&["reads"], "AppA", Some("Svc"), None))
            .await
            .unwrap();
        f.engine
            .register(subscription(&["reads"], "AppB", None, None))
            .await
            .unwrap();

        let all = f.engine.list(None, None, None).unwrap();
        assert_eq!(all.len(), 3);
        let scoped = f.engine.list(Some("AppA"), None, None).unwrap();
        assert_eq!(scoped.len(), 2);
        let svc = f.engine.list(Some("AppA"), Some("Svc"), None).unwrap();
        assert_eq!(svc.len(), 1);
    }

    #[tokio::test]
    async fn partition_subscription_emits_primary_reports() {
        let sim = Arc::new(SimPlatform::new());
        let partition = Uuid::new_v4();
        sim.set_partition_load(
            partition,
            PartitionLoadInfo {
                primary_reports: vec![
                    LoadMetricReport {
                        name: "reads".into(),
                        value: 12.0,
                    },
                    LoadMetricReport {
                        name: "writes".into(),
                        value: 3.0,
                    },
                ],
                secondary_reports: vec![LoadMetricReport {
                    name: "reads".into(),
                    value: 99.0,
                }],
            },
        );

        let f = fixture(sim);
        f.engine
            .register(subscription(&["reads"], "App", Some("Svc"), Some(partition)))
            .await
            .unwrap();
        f.engine.tick(&CancellationToken::new()).await.unwrap();

        let metrics = f.sink.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(f.engine.observed_count(), 2);
        assert!(matches!(
            &metrics[0],
            TelemetryEvent::Metric { role, value, .. } if role == "Svc" && *value == 12.0
        ));
    }

    #[tokio::test]
    async fn service_subscription_filters_by_name_and_readiness() {
        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/App/Svc";
        let partition = Uuid::new_v4();
        let mut hosted = SimPartition::singleton(partition, "http://n1:8080");
        hosted.replicas = vec![
            Replica {
                id: 1,
                role: ReplicaRole::Primary,
                status: ReplicaStatus::Ready,
            },
            Replica {
                id: 2,
                role: ReplicaRole::ActiveSecondary,
                status: ReplicaStatus::Down,
            },
        ];
        sim.add_service(service, vec![hosted]);
        sim.set_replica_load(
            partition,
            1,
            ReplicaLoadInfo {
                reports: vec![
                    LoadMetricReport {
                        name: "reads".into(),
                        value: 7.0,
                    },
                    LoadMetricReport {
                        name: "ignored".into(),
                        value: 1.0,
                    },
                ],
            },
        );

        let f = fixture(sim);
        f.engine
            .register(subscription(&["reads"], "App", Some("Svc"), None))
            .await
            .unwrap();
        f.engine.tick(&CancellationToken::new()).await.unwrap();

        let metrics = f.sink.metrics();
        assert_eq!(metrics.len(), 1);
        assert!(matches!(
            &metrics[0],
            TelemetryEvent::Metric { instance, name, value, .. }
                if instance == "1" && name == "reads" && *value == 7.0
        ));
    }

    #[tokio::test]
    async fn application_subscription_uses_app_load() {
        let sim = Arc::new(SimPlatform::new());
        sim.set_app_load(
            "App",
            ApplicationLoadInfo {
                reports: vec![
                    LoadMetricReport {
                        name: "reads".into(),
                        value: 5.0,
                    },
                    LoadMetricReport {
                        name: "other".into(),
                        value: 2.0,
                    },
                ],
            },
        );

        let f = fixture(sim);
        f.engine
            .register(subscription(&["reads"], "App", None, None))
            .await
            .unwrap();
        f.engine.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.sink.metrics().len(), 1);
    }

    #[tokio::test]
    async fn enumeration_retries_through_transient_faults() {
        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/App/Svc";
        let partition = Uuid::new_v4();
        sim.add_service(service, vec![SimPartition::singleton(partition, "http://n1:1")]);
        sim.set_replica_load(
            partition,
            1,
            ReplicaLoadInfo {
                reports: vec![LoadMetricReport {
                    name: "reads".into(),
                    value: 1.0,
                }],
            },
        );
        sim.inject_list_faults(2);

        let f = fixture(sim);
        f.engine
            .register(subscription(&["reads"], "App", Some("Svc"), None))
            .await
            .unwrap();
        f.engine.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.sink.metrics().len(), 1);
    }

    #[tokio::test]
    async fn missing_target_degrades_the_pass_but_not_the_tick() {
        let f = fixture(Arc::new(SimPlatform::new()));
        f.engine
            .register(subscription(&["reads"], "MissingApp", None, None))
            .await
            .unwrap();

        f.engine.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.engine.health_state(), HealthState::Warning);
        assert!(f.sink.metrics().is_empty());
    }

    #[tokio::test]
    async fn tick_is_a_no_op_without_write_access() {
        let sim = Arc::new(SimPlatform::new());
        let partition = Uuid::new_v4();
        sim.set_partition_load(partition, PartitionLoadInfo::default());

        let f = fixture(sim);
        f.engine
            .register(subscription(&["reads"], "App", Some("Svc"), Some(partition)))
            .await
            .unwrap();

        f.engine.store.set_role(StoreRole::ActiveSecondary);
        f.engine.tick(&CancellationToken::new()).await.unwrap();
        assert!(f.sink.metrics().is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_overwrites() {
        let f = fixture(Arc::new(SimPlatform::new()));
        f.engine
            .register(subscription(&["reads"], "App", None, None))
            .await
            .unwrap();
        f.engine
            .register(subscription(&["reads", "writes"], "App", None, None))
            .await
            .unwrap();

        let listed = f.engine.list(Some("App"), None, None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metric_names.len(), 2);
    }
}
