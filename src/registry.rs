use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    error::{ConfigError, Result},
    signal::{Dtype, Signal, SignalKey},
};

/// Whether the local buffer survives registration with a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Keep,
    Reclaim,
}

/// A signal's initial state as transmitted into one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalPayload {
    pub key: SignalKey,
    pub label: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

/// The signals one partition holds, in key order.
#[derive(Debug, Clone, Default)]
pub struct PartitionStore {
    entries: BTreeMap<SignalKey, SignalPayload>,
}

impl PartitionStore {
    pub fn get(&self, key: SignalKey) -> Option<&SignalPayload> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: SignalKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = SignalKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn payloads(&self) -> impl Iterator<Item = &SignalPayload> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tracks which partitions hold a copy of each signal.
#[derive(Debug)]
pub struct SignalRegistry {
    stores: Vec<PartitionStore>,
}

impl SignalRegistry {
    pub fn new(n_partitions: u32) -> Self {
        Self {
            stores: vec![PartitionStore::default(); n_partitions as usize],
        }
    }

    pub fn n_partitions(&self) -> u32 {
        self.stores.len() as u32
    }

    /// The key of a signal's underlying buffer.
    pub fn identify(&self, signal: &Signal) -> SignalKey {
        signal.key()
    }

    /// Transmits `signal`'s buffer into partition `partition` unless it is
    /// already there. Returns true if this call transmitted it.
    ///
    /// With [`Retention::Reclaim`] the local buffer is replaced by a
    /// placeholder afterwards, so later registrations of the same buffer with
    /// another partition fail.
    pub fn register(
        &mut self,
        partition: u32,
        signal: &Signal,
        retention: Retention,
    ) -> Result<bool> {
        let n_partitions = self.n_partitions();
        let store = match self.stores.get_mut(partition as usize) {
            Some(store) => store,
            None => Err(ConfigError::PartitionOutOfRange {
                partition,
                n_partitions,
            })?,
        };
        let key = signal.key();
        if store.contains(key) {
            return Ok(false);
        }
        let data = match signal.buffer_data() {
            Some(data) => data,
            None => Err(ConfigError::SignalReclaimed {
                signal: signal.to_string(),
                partition,
            })?,
        };
        let shape = match signal.base_shape() {
            [] => vec![1, 1],
            shape => shape.to_vec(),
        };
        debug!(
            "transmitting signal {} {:?} to partition {}",
            signal, shape, partition
        );
        store.entries.insert(
            key,
            SignalPayload {
                key,
                label: signal.label().to_string(),
                dtype: signal.dtype(),
                shape,
                data,
            },
        );
        if retention == Retention::Reclaim {
            signal.reclaim();
        }
        Ok(true)
    }

    /// Partitions that hold the signal with this key, ascending.
    pub fn holders(&self, key: SignalKey) -> Vec<u32> {
        self.stores
            .iter()
            .enumerate()
            .filter(|(_, store)| store.contains(key))
            .map(|(p, _)| p as u32)
            .collect()
    }

    pub fn store(&self, partition: u32) -> Option<&PartitionStore> {
        self.stores.get(partition as usize)
    }

    pub fn into_stores(self) -> Vec<PartitionStore> {
        self.stores
    }
}
