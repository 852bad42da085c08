//! Host-platform client abstraction for the cluster watchdog

mod sim;
mod types;

pub use sim::{SimPartition, SimPlatform};
pub use types::*;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use watchdog_common::{HealthState, Result};

/// Client surface of the host platform.
///
/// Everything the watchdog needs from the cluster runtime goes through this
/// trait: existence and partition lookups for registration, endpoint
/// resolution for probes, health and load reporting, and the paged load
/// enumerations the metrics engine harvests.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn service_exists(&self, service: &str, partition: Option<Uuid>) -> Result<bool>;

    async fn find_partition(&self, partition: Uuid) -> Result<Option<Partition>>;

    /// Resolve the endpoints of the partition selected by `key`
    async fn resolve_endpoints(
        &self,
        service: &str,
        key: &PartitionKeyValue,
    ) -> Result<Vec<ResolvedEndpoint>>;

    async fn report_partition_health(
        &self,
        partition: Uuid,
        source: &str,
        property: &str,
        state: HealthState,
        description: &str,
    ) -> Result<()>;

    /// Report this service's own load metrics
    async fn report_load(&self, partition: Uuid, metrics: &[(String, i64)]) -> Result<()>;

    async fn cluster_health(&self, timeout: Duration) -> Result<ClusterHealth>;

    async fn partition_load(&self, partition: Uuid) -> Result<PartitionLoadInfo>;

    async fn replica_load(&self, partition: Uuid, replica: i64) -> Result<ReplicaLoadInfo>;

    async fn app_load(&self, application: &str) -> Result<ApplicationLoadInfo>;

    async fn partition_list(
        &self,
        service: &str,
        continuation: Option<String>,
    ) -> Result<Page<Partition>>;

    async fn replica_list(
        &self,
        partition: Uuid,
        continuation: Option<String>,
    ) -> Result<Page<Replica>>;
}

type PlatformFactory = Box<dyn Fn() -> Arc<dyn PlatformClient> + Send + Sync>;

/// Process-wide platform client holder.
///
/// `refresh` rebuilds the client after the platform reports itself closed.
/// The swap races under a generation counter: the caller that wins the
/// compare-and-swap installs its new instance, losers drop theirs.
pub struct PlatformHandle {
    client: parking_lot::RwLock<Arc<dyn PlatformClient>>,
    generation: AtomicU64,
    factory: PlatformFactory,
}

impl PlatformHandle {
    pub fn new(factory: impl Fn() -> Arc<dyn PlatformClient> + Send + Sync + 'static) -> Self {
        let client = factory();
        Self {
            client: parking_lot::RwLock::new(client),
            generation: AtomicU64::new(0),
            factory: Box::new(factory),
        }
    }

    /// Wrap one fixed client; `refresh` hands back the same instance
    pub fn fixed(client: Arc<dyn PlatformClient>) -> Self {
        let held = client.clone();
        Self::new(move || held.clone())
    }

    pub fn client(&self) -> Arc<dyn PlatformClient> {
        self.client.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Swap in a fresh client; returns false for callers that lost the race
    pub fn refresh(&self) -> bool {
        let observed = self.generation();
        let fresh = (self.factory)();
        if self
            .generation
            .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller already swapped; this instance is dropped here.
            return false;
        }
        *self.client.write() = fresh;
        debug!("platform client refreshed (generation {})", observed + 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_bumps_generation_and_swaps() {
        let handle = PlatformHandle::new(|| Arc::new(SimPlatform::new()) as Arc<dyn PlatformClient>);
        let before = Arc::as_ptr(&handle.client()) as *const ();
        assert_eq!(handle.generation(), 0);

        assert!(handle.refresh());
        assert_eq!(handle.generation(), 1);
        let after = Arc::as_ptr(&handle.client()) as *const ();
        assert_ne!(before, after);
    }

    #[test]
    fn fixed_handle_keeps_one_instance() {
        let sim: Arc<dyn PlatformClient> = Arc::new(SimPlatform::new());
        let handle = PlatformHandle::fixed(sim.clone());
        assert!(handle.refresh());
        assert!(Arc::ptr_eq(&handle.client(), &sim));
    }
}
