//! HTTP health-check engine
//!
//! Keeps the durable schedule drained and the check results current: every
//! tick walks the schedule in ascending tick order, probes each due check
//! over HTTP, publishes the verdict as partition health plus availability
//! telemetry, and reschedules the check one frequency ahead.

mod probe;

pub use probe::classify_response;

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use watchdog_common::types::health_check_prefix;
use watchdog_common::{Error, HealthCheck, HealthState, Result, ScheduledItem, Ticks};
use watchdog_platform::{Partition, PlatformHandle};
use watchdog_store::{AccessStatus, DurableMap, DurableStore, LockMode, Transaction};
use watchdog_telemetry::TelemetrySink;

const CHECK_MAP: &str = "hc";
const SCHEDULE_MAP: &str = "sched";

/// Health-report source name attached to every verdict
pub const REPORT_SOURCE: &str = "Watchdog";

/// Increments tried when a schedule slot is already taken
pub const SCHEDULE_COLLISION_RETRIES: u32 = 5;

/// Executes registered HTTP probes on their durable schedule
pub struct HealthCheckEngine {
    store: Arc<DurableStore>,
    checks: DurableMap<String, HealthCheck>,
    schedule: DurableMap<i64, ScheduledItem>,
    platform: Arc<PlatformHandle>,
    telemetry: Arc<dyn TelemetrySink>,
    // One client per engine for connection reuse across probes.
    client: reqwest::Client,
    registered: AtomicU64,
    health: RwLock<HealthState>,
}

impl HealthCheckEngine {
    pub fn new(
        store: Arc<DurableStore>,
        platform: Arc<PlatformHandle>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let checks = store.get_or_create::<String, HealthCheck>(CHECK_MAP)?;
        let schedule = store.get_or_create::<i64, ScheduledItem>(SCHEDULE_MAP)?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Network(format!("failed to create probe client: {}", e)))?;
        let registered = AtomicU64::new(checks.count() as u64);
        Ok(Self {
            store,
            checks,
            schedule,
            platform,
            telemetry,
            client,
            registered,
            health: RwLock::new(HealthState::Ok),
        })
    }

    /// Health checks currently registered
    pub fn registered_count(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn health_state(&self) -> HealthState {
        *self.health.read()
    }

    /// Validate and persist a health check, seeding its schedule entry at
    /// `now`.
    ///
    /// Re-registering an existing key resets its schedule.
    pub async fn register(&self, check: HealthCheck) -> Result<()> {
        check.validate()?;
        let client = self.platform.client();
        if !client
            .service_exists(&check.service_name, check.partition)
            .await?
        {
            return Err(Error::InvalidArgument(format!(
                "service '{}' does not exist",
                check.service_name
            )));
        }

        let key = check.key();
        let mut tx = self.store.begin();
        let replacing = self
            .checks
            .try_get(&mut tx, &key, LockMode::Read)?
            .is_some();
        self.checks.add_or_update(&mut tx, &key, &check)?;
        self.remove_schedule_entries(&mut tx, &key)?;
        self.insert_schedule(&mut tx, Ticks::now(), &key)?;
        tx.commit()?;
        self.store.flush().await?;

        if !replacing {
            self.registered.fetch_add(1, Ordering::Relaxed);
        }
        info!("health check '{}' registered for {}", check.name, key);
        Ok(())
    }

    /// Ordered snapshot of checks under the filter prefix
    pub fn list(
        &self,
        app: Option<&str>,
        service: Option<&str>,
        partition: Option<&str>,
    ) -> Result<Vec<HealthCheck>> {
        match self.store.read_status() {
            AccessStatus::Granted => {}
            AccessStatus::NotPrimary => return Err(Error::NotPrimary),
            status => return Err(Error::Transient(format!("read access denied: {:?}", status))),
        }
        let prefix = health_check_prefix(app, service, partition);
        let tx = self.store.begin();
        let entries = self
            .checks
            .iter_ordered(&tx, (!prefix.is_empty()).then_some(prefix.as_bytes()))?;
        Ok(entries.into_iter().map(|(_, check)| check).collect())
    }

    /// One tick with health bookkeeping; never lets an error escape
    pub async fn run_tick(&self, cancel: &CancellationToken) {
        if let Err(e) = self.tick(cancel).await {
            error!("health-check tick failed: {}", e);
            *self.health.write() = HealthState::Error;
        }
    }

    /// Execute every schedule entry that is due
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.store.access_granted() {
            debug!("store access not granted, skipping health-check tick");
            return Ok(());
        }

        let now = Ticks::now();
        let mut tx = self.store.begin();
        let due: Vec<ScheduledItem> = self
            .schedule
            .iter_ordered(&tx, None)?
            .into_iter()
            .take_while(|(tick, _)| *tick < now.as_i64())
            .map(|(_, item)| item)
            .collect();

        for item in due {
            if cancel.is_cancelled() {
                // The transaction drops here, discarding the partial pass.
                return Ok(());
            }
            match self.execute_item(&mut tx, &item, now).await {
                Ok(()) => {}
                Err(Error::NotPrimary) => {
                    debug!("lost primacy mid-tick, abandoning without commit");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!("transient fault while executing '{}': {}", item.key, e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit()?;
        self.store.flush().await?;
        *self.health.write() = HealthState::Ok;
        Ok(())
    }

    async fn execute_item(
        &self,
        tx: &mut Transaction<'_>,
        item: &ScheduledItem,
        now: Ticks,
    ) -> Result<()> {
        let Some(current) = self.checks.try_get(tx, &item.key, LockMode::Update)? else {
            // Orphaned schedule entry; drop it so the queue drains.
            self.schedule
                .try_remove(tx, &item.execution_ticks.as_i64())?;
            return Ok(());
        };

        let client = self.platform.client();
        let partition = self.resolve_partition(&client, &current).await?;
        let Some(partition) = partition else {
            info!("target for '{}' is gone, removing health check", item.key);
            self.checks.try_remove(tx, &item.key)?;
            self.schedule
                .try_remove(tx, &item.execution_ticks.as_i64())?;
            self.registered.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        };

        let updated = self.probe(&client, &current, &partition).await?;
        self.checks.try_update(tx, &item.key, &updated, &current)?;
        self.schedule
            .try_remove(tx, &item.execution_ticks.as_i64())?;
        let next = Ticks(
            updated.last_attempt.unwrap_or(now).as_i64() + current.frequency_ticks(),
        );
        self.insert_schedule(tx, next, &item.key)?;
        Ok(())
    }

    /// Locate the check's target partition. A check without an explicit
    /// partition binds to the service's first partition (the singleton case).
    async fn resolve_partition(
        &self,
        client: &Arc<dyn watchdog_platform::PlatformClient>,
        check: &HealthCheck,
    ) -> Result<Option<Partition>> {
        match check.partition {
            Some(id) => client.find_partition(id).await,
            None => match client.partition_list(&check.service_name, None).await {
                Ok(page) => Ok(page.items.into_iter().next()),
                Err(Error::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Insert a schedule entry at `at`, stepping forward one tick per
    /// collision up to the retry bound
    fn insert_schedule(&self, tx: &mut Transaction<'_>, at: Ticks, key: &str) -> Result<()> {
        let mut tick = at;
        for _ in 0..=SCHEDULE_COLLISION_RETRIES {
            let item = ScheduledItem {
                execution_ticks: tick,
                key: key.to_string(),
            };
            if self.schedule.try_add(tx, &tick.as_i64(), &item)? {
                return Ok(());
            }
            tick = Ticks(tick.as_i64() + 1);
        }
        Err(Error::Transient(format!(
            "no free schedule slot near tick {} for '{}'",
            at, key
        )))
    }

    /// Drop any schedule entries pointing at `key`
    fn remove_schedule_entries(&self, tx: &mut Transaction<'_>, key: &str) -> Result<()> {
        let stale: Vec<i64> = self
            .schedule
            .iter_ordered(tx, None)?
            .into_iter()
            .filter(|(_, item)| item.key == key)
            .map(|(tick, _)| tick)
            .collect();
        for tick in stale {
            self.schedule.try_remove(tx, &tick)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeSet;
    use uuid::Uuid;
    use watchdog_platform::{SimPartition, SimPlatform};
    use watchdog_store::ReplicaRole as StoreRole;
    use watchdog_telemetry::{RecordingSink, TelemetryEvent};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: HealthCheckEngine,
        sim: Arc<SimPlatform>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(sim: Arc<SimPlatform>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path()).unwrap());
        store.set_role(StoreRole::Primary);
        let platform = Arc::new(PlatformHandle::fixed(sim.clone()));
        let sink = Arc::new(RecordingSink::new());
        let engine = HealthCheckEngine::new(store, platform, sink.clone()).unwrap();
        Fixture {
            _dir: dir,
            engine,
            sim,
            sink,
        }
    }

    fn check(service: &str, partition: Uuid) -> HealthCheck {
        serde_json::from_value::<HealthCheck>(serde_json::json!({
            "name": "hc1",
            "service_name": service,
            "partition": partition,
            "suffix_path": "api/values"
        }))
        .unwrap()
    }

    fn schedule_keys(engine: &HealthCheckEngine) -> Vec<String> {
        let tx = engine.store.begin();
        engine
            .schedule
            .iter_ordered(&tx, None)
            .unwrap()
            .into_iter()
            .map(|(_, item)| item.key)
            .collect()
    }

    #[tokio::test]
    async fn register_and_probe_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/values"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        sim.add_service(service, vec![SimPartition::singleton(partition, &server.uri())]);

        let f = fixture(sim);
        f.engine.register(check(service, partition)).await.unwrap();
        assert_eq!(f.engine.registered_count(), 1);

        let key = format!("/A/B/{}", partition);
        assert_eq!(schedule_keys(&f.engine), vec![key.clone()]);

        f.engine.tick(&CancellationToken::new()).await.unwrap();

        let listed = f.engine.list(Some("A"), Some("B"), None).unwrap();
        assert_eq!(listed.len(), 1);
        let result = &listed[0];
        assert_eq!(result.failure_count, 0);
        assert_eq!(result.result_code, 200);
        assert!(result.last_attempt.is_some());
        assert!(result.duration_ms >= 0);

        // The check was rescheduled one frequency ahead.
        assert_eq!(schedule_keys(&f.engine), vec![key]);

        let health = f.sim.health_reports();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].state, HealthState::Ok);
        assert_eq!(health[0].source, REPORT_SOURCE);
        assert_eq!(health[0].property, "hc1");

        assert!(f.sink.events().iter().any(|e| matches!(
            e,
            TelemetryEvent::Availability { success: true, .. }
        )));
        assert_eq!(f.engine.health_state(), HealthState::Ok);
    }

    #[tokio::test]
    async fn register_unknown_service_is_invalid_argument() {
        let f = fixture(Arc::new(SimPlatform::new()));
        let err = f
            .engine
            .register(check("fabric:/X/Y", Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
        assert_eq!(f.engine.registered_count(), 0);
        assert!(f.engine.list(None, None, None).unwrap().is_empty());
        assert!(schedule_keys(&f.engine).is_empty());
    }

    #[tokio::test]
    async fn warning_status_code_produces_warning_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/values"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        sim.add_service(service, vec![SimPartition::singleton(partition, &server.uri())]);

        let f = fixture(sim);
        let mut hc = check(service, partition);
        hc.warning_status_codes = BTreeSet::from([400, 401, 403]);
        f.engine.register(hc).await.unwrap();
        f.engine.tick(&CancellationToken::new()).await.unwrap();

        let listed = f.engine.list(None, None, None).unwrap();
        assert_eq!(listed[0].result_code, 403);
        assert_eq!(listed[0].failure_count, 1);

        let health = f.sim.health_reports();
        assert_eq!(health.last().unwrap().state, HealthState::Warning);
        assert!(f.sink.events().iter().any(|e| matches!(
            e,
            TelemetryEvent::Availability { success: false, .. }
        )));
    }

    #[tokio::test]
    async fn vanished_partition_removes_the_check() {
        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        sim.add_service(
            service,
            vec![SimPartition::singleton(partition, "http://127.0.0.1:1")],
        );

        let f = fixture(sim);
        f.engine.register(check(service, partition)).await.unwrap();
        f.sim.remove_partition(partition);

        f.engine.tick(&CancellationToken::new()).await.unwrap();

        assert!(f.engine.list(None, None, None).unwrap().is_empty());
        assert!(schedule_keys(&f.engine).is_empty());
        assert_eq!(f.engine.registered_count(), 0);
        // No probe was issued against the vanished target.
        assert!(f.sim.health_reports().is_empty());
    }

    #[tokio::test]
    async fn schedule_collision_steps_to_the_next_tick() {
        let f = fixture(Arc::new(SimPlatform::new()));
        let at = Ticks(638_000_000_000_000_000);

        let mut tx = f.engine.store.begin();
        f.engine.insert_schedule(&mut tx, at, "/A/B/p1").unwrap();
        f.engine.insert_schedule(&mut tx, at, "/A/B/p2").unwrap();
        tx.commit().unwrap();

        let tx = f.engine.store.begin();
        let entries = f.engine.schedule.iter_ordered(&tx, None).unwrap();
        let ticks: Vec<i64> = entries.iter().map(|(t, _)| *t).collect();
        assert_eq!(ticks, vec![at.as_i64(), at.as_i64() + 1]);
        assert_eq!(entries[0].1.key, "/A/B/p1");
        assert_eq!(entries[1].1.key, "/A/B/p2");
    }

    #[tokio::test]
    async fn schedule_collision_retry_is_bounded() {
        let f = fixture(Arc::new(SimPlatform::new()));
        let at = Ticks(638_000_000_000_000_000);

        let mut tx = f.engine.store.begin();
        for i in 0..=5 {
            f.engine
                .insert_schedule(&mut tx, at, &format!("/A/B/p{}", i))
                .unwrap();
        }
        let err = f.engine.insert_schedule(&mut tx, at, "/A/B/p6").unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn transient_probe_failure_increments_and_marks_unavailable() {
        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        // Nothing listens here; the connection is refused.
        sim.add_service(
            service,
            vec![SimPartition::singleton(partition, "http://127.0.0.1:1")],
        );

        let f = fixture(sim);
        f.engine.register(check(service, partition)).await.unwrap();
        f.engine.tick(&CancellationToken::new()).await.unwrap();

        let listed = f.engine.list(None, None, None).unwrap();
        assert_eq!(listed[0].failure_count, 1);
        assert_eq!(listed[0].result_code, 500);
        assert_eq!(listed[0].duration_ms, -1);
        assert_eq!(
            f.sim.health_reports().last().unwrap().state,
            HealthState::Error
        );
    }

    #[tokio::test]
    async fn failure_count_resets_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/values"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/values"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        sim.add_service(service, vec![SimPartition::singleton(partition, &server.uri())]);

        let f = fixture(sim);
        let mut hc = check(service, partition);
        hc.frequency_secs = 1;
        f.engine.register(hc).await.unwrap();

        f.engine.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.engine.list(None, None, None).unwrap()[0].failure_count, 1);

        tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
        f.engine.tick(&CancellationToken::new()).await.unwrap();
        let listed = f.engine.list(None, None, None).unwrap();
        assert_eq!(listed[0].failure_count, 0);
        assert_eq!(listed[0].result_code, 200);
    }

    #[tokio::test]
    async fn custom_method_headers_and_body_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/values"))
            .and(header("x-probe", "watchdog"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        sim.add_service(service, vec![SimPartition::singleton(partition, &server.uri())]);

        let f = fixture(sim);
        let mut hc = check(service, partition);
        hc.method = "POST".into();
        hc.headers.insert("x-probe".into(), "watchdog".into());
        hc.content = Some(r#"{"ping":true}"#.into());
        hc.media_type = Some("application/json".into());
        f.engine.register(hc).await.unwrap();
        f.engine.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.engine.list(None, None, None).unwrap()[0].result_code, 204);
    }

    #[tokio::test]
    async fn reregistration_resets_the_schedule_to_one_entry() {
        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        sim.add_service(
            service,
            vec![SimPartition::singleton(partition, "http://127.0.0.1:1")],
        );

        let f = fixture(sim);
        f.engine.register(check(service, partition)).await.unwrap();
        f.engine.register(check(service, partition)).await.unwrap();

        assert_eq!(schedule_keys(&f.engine).len(), 1);
        assert_eq!(f.engine.registered_count(), 1);
    }

    #[tokio::test]
    async fn tick_is_a_no_op_without_access() {
        let sim = Arc::new(SimPlatform::new());
        let service = "fabric:/A/B";
        let partition = Uuid::new_v4();
        sim.add_service(
            service,
            vec![SimPartition::singleton(partition, "http://127.0.0.1:1")],
        );

        let f = fixture(sim);
        f.engine.register(check(service, partition)).await.unwrap();
        f.engine.store.set_role(StoreRole::ActiveSecondary);

        f.engine.tick(&CancellationToken::new()).await.unwrap();
        assert!(f.sim.health_reports().is_empty());
    }
}
