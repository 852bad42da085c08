//! In-memory cluster model
//!
//! Stands in for the real platform in local runs and in engine tests: a
//! handful of services with partitions, replicas, endpoints, and canned load
//! data, plus capture of everything the watchdog reports back.

use crate::types::*;
use crate::PlatformClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;
use watchdog_common::{Error, HealthState, Result};

/// A partition hosted by a simulated service
#[derive(Debug, Clone)]
pub struct SimPartition {
    pub partition: Partition,
    pub replicas: Vec<Replica>,
    pub endpoints: Vec<ResolvedEndpoint>,
}

impl SimPartition {
    /// A ready singleton partition with one primary listener at `address`
    pub fn singleton(id: Uuid, address: &str) -> Self {
        Self {
            partition: Partition {
                id,
                kind: PartitionKind::Singleton,
                status: PartitionStatus::Ready,
            },
            replicas: vec![Replica {
                id: 1,
                role: ReplicaRole::Primary,
                status: ReplicaStatus::Ready,
            }],
            endpoints: vec![ResolvedEndpoint {
                role: ReplicaRole::Primary,
                listeners: BTreeMap::from([(String::new(), address.to_string())]),
            }],
        }
    }
}

/// A recorded partition-health event
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReportRecord {
    pub partition: Uuid,
    pub source: String,
    pub property: String,
    pub state: HealthState,
    pub description: String,
}

#[derive(Default)]
struct SimState {
    services: BTreeMap<String, Vec<SimPartition>>,
    app_loads: HashMap<String, ApplicationLoadInfo>,
    partition_loads: HashMap<Uuid, PartitionLoadInfo>,
    replica_loads: HashMap<(Uuid, i64), ReplicaLoadInfo>,
    cluster: ClusterHealth,
    health_reports: Vec<HealthReportRecord>,
    load_reports: Vec<(Uuid, Vec<(String, i64)>)>,
    list_faults: u32,
}

/// Simulated platform client
pub struct SimPlatform {
    state: Mutex<SimState>,
    page_size: usize,
    closed: AtomicBool,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            page_size: usize::MAX,
            closed: AtomicBool::new(false),
        }
    }

    /// Limit enumeration pages to `size` items to exercise continuation
    /// tokens
    pub fn with_page_size(size: usize) -> Self {
        Self {
            page_size: size.max(1),
            ..Self::new()
        }
    }

    pub fn add_service(&self, service: &str, partitions: Vec<SimPartition>) {
        self.state
            .lock()
            .services
            .insert(service.to_string(), partitions);
    }

    pub fn set_partition_load(&self, partition: Uuid, load: PartitionLoadInfo) {
        self.state.lock().partition_loads.insert(partition, load);
    }

    pub fn set_replica_load(&self, partition: Uuid, replica: i64, load: ReplicaLoadInfo) {
        self.state
            .lock()
            .replica_loads
            .insert((partition, replica), load);
    }

    pub fn set_app_load(&self, application: &str, load: ApplicationLoadInfo) {
        self.state
            .lock()
            .app_loads
            .insert(application.to_string(), load);
    }

    pub fn set_cluster_health(&self, health: ClusterHealth) {
        self.state.lock().cluster = health;
    }

    /// Remove a partition, simulating a target that has gone away
    pub fn remove_partition(&self, partition: Uuid) {
        let mut state = self.state.lock();
        for partitions in state.services.values_mut() {
            partitions.retain(|p| p.partition.id != partition);
        }
    }

    /// The next `count` enumeration calls fail with a transient fault
    pub fn inject_list_faults(&self, count: u32) {
        self.state.lock().list_faults = count;
    }

    /// When closed, every call fails with `PlatformClosed`
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    pub fn health_reports(&self) -> Vec<HealthReportRecord> {
        self.state.lock().health_reports.clone()
    }

    pub fn load_reports(&self) -> Vec<(Uuid, Vec<(String, i64)>)> {
        self.state.lock().load_reports.clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PlatformClosed);
        }
        Ok(())
    }

    fn consume_list_fault(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.list_faults > 0 {
            state.list_faults -= 1;
            return Err(Error::Transient("simulated enumeration fault".into()));
        }
        Ok(())
    }

    fn page<T: Clone>(&self, items: &[T], continuation: Option<String>) -> Result<Page<T>> {
        let start = match continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::Platform(format!("bad continuation token '{}'", token)))?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let continuation = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: items[start..end].to_vec(),
            continuation,
        })
    }
}

#[async_trait]
impl PlatformClient for SimPlatform {
    async fn service_exists(&self, service: &str, partition: Option<Uuid>) -> Result<bool> {
        self.check_open()?;
        let state = self.state.lock();
        let Some(partitions) = state.services.get(service) else {
            return Ok(false);
        };
        Ok(match partition {
            Some(id) => partitions.iter().any(|p| p.partition.id == id),
            None => true,
        })
    }

    async fn find_partition(&self, partition: Uuid) -> Result<Option<Partition>> {
        self.check_open()?;
        let state = self.state.lock();
        Ok(state
            .services
            .values()
            .flatten()
            .find(|p| p.partition.id == partition)
            .map(|p| p.partition.clone()))
    }

    async fn resolve_endpoints(
        &self,
        service: &str,
        key: &PartitionKeyValue,
    ) -> Result<Vec<ResolvedEndpoint>> {
        self.check_open()?;
        let state = self.state.lock();
        let partitions = state
            .services
            .get(service)
            .ok_or_else(|| Error::NotFound(format!("service '{}'", service)))?;
        let hit = partitions.iter().find(|p| match (key, &p.partition.kind) {
            (PartitionKeyValue::None, PartitionKind::Singleton) => true,
            (PartitionKeyValue::Int64(v), PartitionKind::Int64Range { low_key, high_key }) => {
                low_key <= v && v <= high_key
            }
            (PartitionKeyValue::Named(n), PartitionKind::Named { name }) => n == name,
            _ => false,
        });
        Ok(hit.map(|p| p.endpoints.clone()).unwrap_or_default())
    }

    async fn report_partition_health(
        &self,
        partition: Uuid,
        source: &str,
        property: &str,
        state: HealthState,
        description: &str,
    ) -> Result<()> {
        self.check_open()?;
        self.state.lock().health_reports.push(HealthReportRecord {
            partition,
            source: source.to_string(),
            property: property.to_string(),
            state,
            description: description.to_string(),
        });
        Ok(())
    }

    async fn report_load(&self, partition: Uuid, metrics: &[(String, i64)]) -> Result<()> {
        self.check_open()?;
        self.state
            .lock()
            .load_reports
            .push((partition, metrics.to_vec()));
        Ok(())
    }

    async fn cluster_health(&self, _timeout: Duration) -> Result<ClusterHealth> {
        self.check_open()?;
        Ok(self.state.lock().cluster.clone())
    }

    async fn partition_load(&self, partition: Uuid) -> Result<PartitionLoadInfo> {
        self.check_open()?;
        self.state
            .lock()
            .partition_loads
            .get(&partition)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("partition load for {}", partition)))
    }

    async fn replica_load(&self, partition: Uuid, replica: i64) -> Result<ReplicaLoadInfo> {
        self.check_open()?;
        self.state
            .lock()
            .replica_loads
            .get(&(partition, replica))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("replica load for {}/{}", partition, replica)))
    }

    async fn app_load(&self, application: &str) -> Result<ApplicationLoadInfo> {
        self.check_open()?;
        self.state
            .lock()
            .app_loads
            .get(application)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("application '{}'", application)))
    }

    async fn partition_list(
        &self,
        service: &str,
        continuation: Option<String>,
    ) -> Result<Page<Partition>> {
        self.check_open()?;
        self.consume_list_fault()?;
        let state = self.state.lock();
        let partitions = state
            .services
            .get(service)
            .ok_or_else(|| Error::NotFound(format!("service '{}'", service)))?;
        let items: Vec<Partition> = partitions.iter().map(|p| p.partition.clone()).collect();
        drop(state);
        self.page(&items, continuation)
    }

    async fn replica_list(
        &self,
        partition: Uuid,
        continuation: Option<String>,
    ) -> Result<Page<Replica>> {
        self.check_open()?;
        self.consume_list_fault()?;
        let state = self.state.lock();
        let replicas = state
            .services
            .values()
            .flatten()
            .find(|p| p.partition.id == partition)
            .map(|p| p.replicas.clone())
            .ok_or_else(|| Error::NotFound(format!("partition {}", partition)))?;
        drop(state);
        self.page(&replicas, continuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pagination_walks_continuations() {
        let sim = SimPlatform::with_page_size(2);
        let svc = "fabric:/App/Svc";
        sim.add_service(
            svc,
            (0..5)
                .map(|_| SimPartition::singleton(Uuid::new_v4(), "http://n1:8080"))
                .collect(),
        );

        let mut seen = 0;
        let mut continuation = None;
        loop {
            let page = sim.partition_list(svc, continuation).await.unwrap();
            seen += page.items.len();
            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn closed_platform_rejects_calls() {
        let sim = SimPlatform::new();
        sim.set_closed(true);
        let err = sim.find_partition(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::PlatformClosed));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn list_faults_are_transient_and_consumed() {
        let sim = SimPlatform::new();
        sim.add_service("fabric:/A/B", vec![]);
        sim.inject_list_faults(1);
        assert!(sim
            .partition_list("fabric:/A/B", None)
            .await
            .unwrap_err()
            .is_transient());
        assert!(sim.partition_list("fabric:/A/B", None).await.is_ok());
    }

    #[tokio::test]
    async fn resolves_by_partition_kind() {
        let sim = SimPlatform::new();
        let svc = "fabric:/A/B";
        let ranged = SimPartition {
            partition: Partition {
                id: Uuid::new_v4(),
                kind: PartitionKind::Int64Range {
                    low_key: 0,
                    high_key: 99,
                },
                status: PartitionStatus::Ready,
            },
            replicas: vec![],
            endpoints: vec![ResolvedEndpoint {
                role: ReplicaRole::Primary,
                listeners: BTreeMap::from([(String::new(), "http://n2:9000".to_string())]),
            }],
        };
        sim.add_service(svc, vec![ranged]);

        let hit = sim
            .resolve_endpoints(svc, &PartitionKeyValue::Int64(42))
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);
        let miss = sim
            .resolve_endpoints(svc, &PartitionKeyValue::Int64(200))
            .await
            .unwrap();
        assert!(miss.is_empty());
    }
}
