//! Durable transactional maps for the cluster watchdog
//!
//! All maps live in one sled tree under per-map key prefixes, so a
//! transaction spanning several maps commits through a single sled
//! transaction. Access to the store is gated by the replica role: engines
//! check `read_status` and `write_status` before touching state, and a
//! commit attempted without write access fails with `NotPrimary`.

mod map;
mod tx;

pub use map::{DurableMap, LockMode, MapKey};
pub use tx::Transaction;

use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use watchdog_common::{Error, Result};

/// Separator between the map name and the key inside the shared tree.
/// Map names must not contain it; stored keys are paths and ids, which never do.
pub(crate) const KEY_SEPARATOR: u8 = 0x1f;

/// Role of this replica within its partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Unknown,
    Primary,
    ActiveSecondary,
    IdleSecondary,
}

/// Whether the store currently grants an access class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    ReconfigurationPending,
    NotReady,
    NotPrimary,
}

type RoleCallback = Box<dyn Fn(ReplicaRole) + Send + Sync>;

/// Transactional ordered key-value store with role gating
pub struct DurableStore {
    db: sled::Db,
    data: sled::Tree,
    role: RwLock<ReplicaRole>,
    reconfiguring: AtomicBool,
    role_callbacks: RwLock<Vec<RoleCallback>>,
}

impl DurableStore {
    /// Open (or create) the store under `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| Error::Storage(format!("failed to open store at {:?}: {}", path, e)))?;
        let data = db
            .open_tree("watchdog")
            .map_err(|e| Error::Storage(format!("failed to open data tree: {}", e)))?;
        info!("durable store opened at {:?}", path);
        Ok(Self {
            db,
            data,
            role: RwLock::new(ReplicaRole::Unknown),
            reconfiguring: AtomicBool::new(false),
            role_callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Idempotent map materialization
    pub fn get_or_create<K: MapKey, V: watchdog_common::codec::Persist>(
        &self,
        name: &str,
    ) -> Result<DurableMap<K, V>> {
        if name.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(Error::InvalidArgument(format!(
                "map name '{}' contains the key separator",
                name
            )));
        }
        Ok(DurableMap::new(name, self.data.clone()))
    }

    /// Start a transaction; commit it or let it drop to discard
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    pub fn read_status(&self) -> AccessStatus {
        self.status()
    }

    pub fn write_status(&self) -> AccessStatus {
        self.status()
    }

    /// True when both read and write access are granted
    pub fn access_granted(&self) -> bool {
        self.read_status() == AccessStatus::Granted && self.write_status() == AccessStatus::Granted
    }

    fn status(&self) -> AccessStatus {
        if self.reconfiguring.load(Ordering::Acquire) {
            return AccessStatus::ReconfigurationPending;
        }
        match *self.role.read() {
            ReplicaRole::Primary => AccessStatus::Granted,
            ReplicaRole::Unknown => AccessStatus::NotReady,
            ReplicaRole::ActiveSecondary | ReplicaRole::IdleSecondary => AccessStatus::NotPrimary,
        }
    }

    /// Update the replica role and notify subscribers
    pub fn set_role(&self, role: ReplicaRole) {
        {
            let mut current = self.role.write();
            if *current == role {
                return;
            }
            debug!("replica role change: {:?} -> {:?}", *current, role);
            *current = role;
        }
        for callback in self.role_callbacks.read().iter() {
            callback(role);
        }
    }

    /// Mark a reconfiguration window during which access is denied
    pub fn set_reconfiguring(&self, pending: bool) {
        self.reconfiguring.store(pending, Ordering::Release);
    }

    /// Invoked whenever this replica gains or loses primacy
    pub fn on_role_change(&self, callback: impl Fn(ReplicaRole) + Send + Sync + 'static) {
        self.role_callbacks.write().push(Box::new(callback));
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| Error::Storage(format!("flush failed: {}", e)))?;
        Ok(())
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use watchdog_common::MetricCheck;

    fn open_store() -> (tempfile::TempDir, DurableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn sample(app: &str) -> MetricCheck {
        MetricCheck {
            metric_names: BTreeSet::from(["reads".to_string()]),
            application: app.to_string(),
            service: None,
            partition: None,
        }
    }

    #[test]
    fn statuses_follow_role() {
        let (_dir, store) = open_store();
        assert_eq!(store.read_status(), AccessStatus::NotReady);
        store.set_role(ReplicaRole::Primary);
        assert!(store.access_granted());
        store.set_role(ReplicaRole::ActiveSecondary);
        assert_eq!(store.write_status(), AccessStatus::NotPrimary);
        store.set_role(ReplicaRole::Primary);
        store.set_reconfiguring(true);
        assert_eq!(store.read_status(), AccessStatus::ReconfigurationPending);
    }

    #[test]
    fn role_change_notifies_subscribers() {
        let (_dir, store) = open_store();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        store.on_role_change(move |role| {
            if role == ReplicaRole::Primary {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            }
        });
        store.set_role(ReplicaRole::Primary);
        // Setting the same role again is not a change.
        store.set_role(ReplicaRole::Primary);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn commit_requires_write_access() {
        let (_dir, store) = open_store();
        store.set_role(ReplicaRole::ActiveSecondary);
        let map = store.get_or_create::<String, MetricCheck>("mc").unwrap();
        let mut tx = store.begin();
        map.add_or_update(&mut tx, &"App".to_string(), &sample("App"))
            .unwrap();
        assert!(matches!(tx.commit(), Err(Error::NotPrimary)));
    }

    #[test]
    fn map_name_cannot_contain_separator() {
        let (_dir, store) = open_store();
        let result = store.get_or_create::<String, MetricCheck>("bad\u{1f}name");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
