use std::fmt;

use hashbrown::HashMap;
use rkyv::{to_bytes, Archive, Deserialize, Serialize};

use crate::{
    error::{CodecError, Result},
    host::HostFunctionTable,
    lower::{wire, OpRecord, Operand},
    registry::PartitionStore,
    signal::Dtype,
};

/// Initial state of one signal held by a partition.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct SignalEntry {
    pub key: u64,
    pub label: String,
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct PartitionPlan {
    pub id: u32,
    /// Operators in execution order.
    pub ops: Vec<OpRecord>,
    pub signals: Vec<SignalEntry>,
}

impl PartitionPlan {
    pub(crate) fn new(id: u32, ops: Vec<OpRecord>, store: &PartitionStore) -> Self {
        let signals = store
            .payloads()
            .map(|payload| SignalEntry {
                key: payload.key.get(),
                label: payload.label.clone(),
                dtype: payload.dtype,
                shape: payload.shape.iter().map(|&d| d as u64).collect(),
                data: payload.data.clone(),
            })
            .collect();
        Self { id, ops, signals }
    }

    pub fn signal(&self, key: u64) -> Option<&SignalEntry> {
        self.signals.iter().find(|entry| entry.key == key)
    }

    /// Operator records in their text form.
    pub fn lines(&self) -> Vec<String> {
        self.ops.iter().map(ToString::to_string).collect()
    }
}

/// Where the execution engine records one probe.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct ProbeBinding {
    pub probe: u64,
    pub label: String,
    pub partition: u32,
    pub signal: u64,
    /// Sampling period in steps, at least 1.
    pub period: u64,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct LoweredPlan {
    pub label: String,
    pub dt: f64,
    pub partitions: Vec<PartitionPlan>,
    pub probes: Vec<ProbeBinding>,
}

impl LoweredPlan {
    pub fn partition(&self, id: u32) -> Option<&PartitionPlan> {
        self.partitions.get(id as usize)
    }

    pub fn probe(&self, key: u64) -> Option<&ProbeBinding> {
        self.probes.iter().find(|binding| binding.probe == key)
    }

    /// A copy with signal and probe keys renumbered from 1 in order of first
    /// appearance. Two lowerings of the same model compare equal here even
    /// though their keys were allocated differently.
    pub fn canonical(&self) -> LoweredPlan {
        let mut signals = Renumber::default();
        let mut probes = Renumber::default();
        let mut plan = self.clone();
        for partition in &mut plan.partitions {
            for record in &mut partition.ops {
                for operand in &mut record.operands {
                    if let Operand::Signal(key) = operand {
                        *key = signals.get(*key);
                    }
                }
            }
        }
        for partition in &mut plan.partitions {
            for entry in &mut partition.signals {
                entry.key = signals.get(entry.key);
            }
            partition.signals.sort_by_key(|entry| entry.key);
        }
        for binding in &mut plan.probes {
            binding.signal = signals.get(binding.signal);
            binding.probe = probes.get(binding.probe);
        }
        plan
    }

    /// blake3 digest of the archived canonical plan.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let bytes = to_bytes::<_, 4096>(&self.canonical())
            .map_err(|_| CodecError::Archive)?;
        Ok(Fingerprint(*blake3::hash(&bytes).as_bytes()))
    }

    /// Encodes every partition plan as a wire frame.
    pub fn to_frames(&self, compression_level: i32) -> Result<Vec<Vec<u8>>> {
        self.partitions
            .iter()
            .map(|partition| wire::encode_partition(partition, compression_level))
            .collect()
    }
}

#[derive(Default)]
struct Renumber {
    map: HashMap<u64, u64>,
}

impl Renumber {
    fn get(&mut self, key: u64) -> u64 {
        let next = self.map.len() as u64 + 1;
        *self.map.entry(key).or_insert(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The output of lowering: the portable plan and the host functions its
/// `HostFunc` records refer to.
#[derive(Debug, Clone)]
pub struct Lowered {
    pub plan: LoweredPlan,
    pub host_functions: HostFunctionTable,
}
