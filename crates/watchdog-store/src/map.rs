//! Typed ordered maps over the shared tree

use crate::{Transaction, KEY_SEPARATOR};
use std::marker::PhantomData;
use watchdog_common::codec::Persist;
use watchdog_common::{Error, Result};

/// Lock strength for a transactional read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    /// Guards the read against lost writes: if the value changes before the
    /// transaction commits, the commit fails with a transient conflict.
    Update,
}

/// Encoding of map keys into the tree's ordered byte space
pub trait MapKey: Sized + Clone {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

impl MapKey for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Serialization("map key is not utf-8".into()))
    }
}

impl MapKey for i64 {
    // Big-endian with the sign bit flipped, so byte order equals numeric order.
    fn to_bytes(&self) -> Vec<u8> {
        ((*self as u64) ^ (1 << 63)).to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Serialization("map key is not 8 bytes".into()))?;
        Ok((u64::from_be_bytes(arr) ^ (1 << 63)) as i64)
    }
}

/// A named, ordered, typed view over the store
pub struct DurableMap<K, V> {
    prefix: Vec<u8>,
    tree: sled::Tree,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: MapKey, V: Persist> DurableMap<K, V> {
    pub(crate) fn new(name: &str, tree: sled::Tree) -> Self {
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);
        Self {
            prefix,
            tree,
            _marker: PhantomData,
        }
    }

    fn full_key(&self, key: &K) -> Vec<u8> {
        let mut bytes = self.prefix.clone();
        bytes.extend_from_slice(&key.to_bytes());
        bytes
    }

    fn get_bytes(&self, tx: &Transaction<'_>, full_key: &[u8]) -> Result<Option<Vec<u8>>> {
        match tx.staged_get(full_key) {
            Some(Some(value)) => Ok(Some(value.clone())),
            Some(None) => Ok(None),
            None => tx.committed_get(full_key),
        }
    }

    /// Insert only if the key is absent; returns whether the insert happened
    pub fn try_add(&self, tx: &mut Transaction<'_>, key: &K, value: &V) -> Result<bool> {
        let full_key = self.full_key(key);
        if self.get_bytes(tx, &full_key)?.is_some() {
            return Ok(false);
        }
        tx.add_guard(&full_key, None);
        tx.stage_put(full_key, value.encode_bytes());
        Ok(true)
    }

    /// Unconditional upsert
    pub fn add_or_update(&self, tx: &mut Transaction<'_>, key: &K, value: &V) -> Result<()> {
        tx.stage_put(self.full_key(key), value.encode_bytes());
        Ok(())
    }

    pub fn try_get(&self, tx: &mut Transaction<'_>, key: &K, mode: LockMode) -> Result<Option<V>> {
        let full_key = self.full_key(key);
        let bytes = self.get_bytes(tx, &full_key)?;
        if mode == LockMode::Update {
            tx.add_guard(&full_key, bytes.clone());
        }
        bytes.map(|b| V::decode_bytes(&b)).transpose()
    }

    /// Compare-and-swap: replace the value only if it still equals `witness`.
    /// The comparison is revalidated at commit.
    pub fn try_update(
        &self,
        tx: &mut Transaction<'_>,
        key: &K,
        value: &V,
        witness: &V,
    ) -> Result<bool> {
        let full_key = self.full_key(key);
        let witness_bytes = witness.encode_bytes();
        match self.get_bytes(tx, &full_key)? {
            Some(current) if current == witness_bytes => {
                tx.add_guard(&full_key, Some(witness_bytes));
                tx.stage_put(full_key, value.encode_bytes());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove the key, returning the previous value when present
    pub fn try_remove(&self, tx: &mut Transaction<'_>, key: &K) -> Result<Option<V>> {
        let full_key = self.full_key(key);
        let previous = self.get_bytes(tx, &full_key)?;
        if previous.is_some() {
            tx.stage_delete(full_key);
        }
        previous.map(|b| V::decode_bytes(&b)).transpose()
    }

    /// Ordered snapshot of the map merged with this transaction's overlay.
    /// `prefix` restricts the scan to keys starting with those bytes.
    pub fn iter_ordered(&self, tx: &Transaction<'_>, prefix: Option<&[u8]>) -> Result<Vec<(K, V)>> {
        let mut scan_prefix = self.prefix.clone();
        if let Some(p) = prefix {
            scan_prefix.extend_from_slice(p);
        }

        let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = Default::default();
        for entry in tx.tree().scan_prefix(&scan_prefix) {
            let (key, value) =
                entry.map_err(|e| Error::Storage(format!("iteration failed: {}", e)))?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, op) in tx.staged_in_range(&scan_prefix) {
            match op {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }

        merged
            .into_iter()
            .map(|(full_key, value)| {
                let key = K::from_bytes(&full_key[self.prefix.len()..])?;
                Ok((key, V::decode_bytes(&value)?))
            })
            .collect()
    }

    /// Number of committed entries, read outside any transaction
    pub fn count(&self) -> usize {
        self.tree.scan_prefix(&self.prefix).count()
    }
}
