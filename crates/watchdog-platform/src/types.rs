//! Platform-side entities: partitions, replicas, endpoints, load, health

use std::collections::BTreeMap;
use uuid::Uuid;
use watchdog_common::HealthState;

/// How a service is partitioned, which determines the key used to resolve it
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionKind {
    Singleton,
    Int64Range { low_key: i64, high_key: i64 },
    Named { name: String },
    /// Returned by the platform for partitions it cannot describe
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Ready,
    NotReady,
    InQuorumLoss,
    Reconfiguring,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub id: Uuid,
    pub kind: PartitionKind,
    pub status: PartitionStatus,
}

impl Partition {
    /// Resolution key derived from the partition kind
    pub fn resolution_key(&self) -> Option<PartitionKeyValue> {
        match &self.kind {
            PartitionKind::Singleton => Some(PartitionKeyValue::None),
            PartitionKind::Int64Range { low_key, .. } => Some(PartitionKeyValue::Int64(*low_key)),
            PartitionKind::Named { name } => Some(PartitionKeyValue::Named(name.clone())),
            PartitionKind::Invalid => None,
        }
    }
}

/// Key used when resolving a service endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionKeyValue {
    None,
    Int64(i64),
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Primary,
    ActiveSecondary,
    IdleSecondary,
    Stateless,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Ready,
    Down,
    Standby,
}

/// A running copy of a partition (stateful) or of a stateless instance
#[derive(Debug, Clone, PartialEq)]
pub struct Replica {
    pub id: i64,
    pub role: ReplicaRole,
    pub status: ReplicaStatus,
}

/// One resolved endpoint of a partition: a role plus its named listeners
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEndpoint {
    pub role: ReplicaRole,
    pub listeners: BTreeMap<String, String>,
}

impl ResolvedEndpoint {
    /// Address of the named listener, or of the first listener when no name
    /// is given
    pub fn listener_address(&self, name: Option<&str>) -> Option<&str> {
        match name {
            Some(n) => self.listeners.get(n).map(String::as_str),
            None => self.listeners.values().next().map(String::as_str),
        }
    }
}

/// A single reported load value
#[derive(Debug, Clone, PartialEq)]
pub struct LoadMetricReport {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionLoadInfo {
    pub primary_reports: Vec<LoadMetricReport>,
    pub secondary_reports: Vec<LoadMetricReport>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaLoadInfo {
    pub reports: Vec<LoadMetricReport>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationLoadInfo {
    pub reports: Vec<LoadMetricReport>,
}

/// One page of a continuation-token enumeration
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            continuation: None,
        }
    }
}

/// Aggregate health of a named entity in the cluster roll-up
#[derive(Debug, Clone, PartialEq)]
pub struct EntityHealth {
    pub name: String,
    pub state: HealthState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterHealth {
    pub aggregate: HealthState,
    pub applications: Vec<EntityHealth>,
    pub nodes: Vec<EntityHealth>,
}

impl Default for ClusterHealth {
    fn default() -> Self {
        Self {
            aggregate: HealthState::Ok,
            applications: Vec::new(),
            nodes: Vec::new(),
        }
    }
}
