//! Scoped transactions over the shared tree

use crate::{AccessStatus, DurableStore};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::{BTreeMap, HashMap};
use watchdog_common::{Error, Result};

/// A staged set of reads and writes.
///
/// Writes are buffered in memory and applied atomically on `commit`;
/// dropping an uncommitted transaction discards them. Update-mode reads and
/// compare-and-swap updates register guards that are revalidated inside the
/// sled transaction, so a value that moved between the read and the commit
/// aborts the whole batch with a transient conflict.
pub struct Transaction<'s> {
    store: &'s DurableStore,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    guards: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s DurableStore) -> Self {
        Self {
            store,
            staged: BTreeMap::new(),
            guards: HashMap::new(),
        }
    }

    /// Apply every staged operation atomically
    pub fn commit(self) -> Result<()> {
        if self.staged.is_empty() && self.guards.is_empty() {
            return Ok(());
        }
        match self.store.write_status() {
            AccessStatus::Granted => {}
            AccessStatus::NotPrimary => return Err(Error::NotPrimary),
            status => {
                return Err(Error::Transient(format!(
                    "write access not granted: {:?}",
                    status
                )))
            }
        }

        let staged = &self.staged;
        let guards = &self.guards;
        let outcome: std::result::Result<(), TransactionError<()>> =
            self.store.tree().transaction(|t| {
                for (key, expected) in guards.iter() {
                    let current = t.get(key)?.map(|v| v.to_vec());
                    if current.as_ref() != expected.as_ref() {
                        return Err(ConflictableTransactionError::Abort(()));
                    }
                }
                for (key, op) in staged.iter() {
                    match op {
                        Some(value) => {
                            t.insert(key.clone(), value.clone())?;
                        }
                        None => {
                            t.remove(key.clone())?;
                        }
                    }
                }
                Ok(())
            });

        match outcome {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(())) => Err(Error::Transient(
                "value changed between read and commit".into(),
            )),
            Err(TransactionError::Storage(e)) => {
                Err(Error::Storage(format!("commit failed: {}", e)))
            }
        }
    }

    /// Overlay view: `None` = untouched, `Some(None)` = staged delete
    pub(crate) fn staged_get(&self, full_key: &[u8]) -> Option<Option<&Vec<u8>>> {
        self.staged.get(full_key).map(|op| op.as_ref())
    }

    pub(crate) fn stage_put(&mut self, full_key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(full_key, Some(value));
    }

    pub(crate) fn stage_delete(&mut self, full_key: Vec<u8>) {
        self.staged.insert(full_key, None);
    }

    /// Register a lost-write guard. The first guard for a key wins, and keys
    /// this transaction already wrote are its own and need no guard.
    pub(crate) fn add_guard(&mut self, full_key: &[u8], expected: Option<Vec<u8>>) {
        if self.staged.contains_key(full_key) {
            return;
        }
        self.guards
            .entry(full_key.to_vec())
            .or_insert(expected);
    }

    pub(crate) fn committed_get(&self, full_key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store
            .tree()
            .get(full_key)
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(|e| Error::Storage(format!("read failed: {}", e)))
    }

    pub(crate) fn staged_in_range<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> {
        self.staged
            .iter()
            .filter(move |(k, _)| k.starts_with(prefix))
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        self.store.tree()
    }
}
