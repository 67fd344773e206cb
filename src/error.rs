use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the lowering engine can report. Nothing is retried: the first
/// error aborts the lowering.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Graph,
    Usage,
    Codec,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Graph(_) => ErrorKind::Graph,
            Error::Usage(_) => ErrorKind::Usage,
            Error::Codec(_) => ErrorKind::Codec,
        }
    }
}

/// The model handed to the engine cannot be realized as given.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("connection {connection} crosses partitions {from} -> {to} but is modulatory")]
    CrossingModulatory {
        connection: String,
        from: u32,
        to: u32,
    },
    #[error("connection {connection} crosses partitions {from} -> {to} but has a {rule} learning rule")]
    CrossingLearningRule {
        connection: String,
        rule: String,
        from: u32,
        to: u32,
    },
    #[error("connection {connection} must contain exactly one operator updating {signal}, found {count}; cross-partition connections must be filtered")]
    BoundaryOwners {
        connection: String,
        signal: String,
        count: usize,
    },
    #[error("unsupported {kind}: {name}")]
    Unsupported { kind: &'static str, name: String },
    #[error("construct {open} was entered but never exited")]
    UnbalancedConstructs { open: String },
    #[error("construct {construct} has no partition assignment")]
    Unassigned { construct: String },
    #[error("partition {partition} is out of range for {n_partitions} partitions")]
    PartitionOutOfRange { partition: u32, n_partitions: u32 },
    #[error("a model needs at least one partition")]
    NoPartitions,
    #[error("step size must be finite and positive, got {0}")]
    InvalidStep(f64),
    #[error("signal {label}: shape {shape:?} needs {expected} elements, got {actual}")]
    ShapeMismatch {
        label: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("signal {label}: invalid view ({reason})")]
    InvalidView { label: String, reason: String },
    #[error("signal {signal} was reclaimed and cannot be transmitted to partition {partition}")]
    SignalReclaimed { signal: String, partition: u32 },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("probe {probe} has an invalid sampling interval {sample_every}")]
    InvalidProbePeriod { probe: String, sample_every: f64 },
    #[error("probe {probe} observes {signal}, which partition {partition} does not hold")]
    ProbeTargetMissing {
        probe: String,
        signal: String,
        partition: u32,
    },
}

/// The per-partition operator graph cannot be ordered or synchronized.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle in partition {partition} through {operators:?}")]
    Cycle {
        partition: u32,
        operators: Vec<String>,
    },
    #[error("partition {partition}: {operator} reads {signal} before any operator writes it")]
    ReadBeforeWrite {
        partition: u32,
        signal: String,
        operator: String,
    },
    #[error("partition {partition} reads {signal}, which is written in another partition and never received")]
    UnsyncedRead { partition: u32, signal: String },
    #[error("partition {partition}: boundary signal {signal} must have exactly one updater, found {count}")]
    TransferOwners {
        partition: u32,
        signal: String,
        count: usize,
    },
}

/// The construction API was driven out of order.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("operator {operator} emitted with no active construct")]
    NoActiveConstruct { operator: String },
    #[error("end_construct called with no active construct")]
    EndWithoutBegin,
    #[error("end_construct called for {found} while {open} is active")]
    MismatchedEnd { open: String, found: String },
    #[error("the model has already been finalized")]
    AlreadyFinalized,
}

/// A lowered plan could not be encoded or decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to archive partition plan")]
    Archive,
    #[error("archived partition plan failed validation")]
    InvalidArchive,
    #[error("compression failed: {0}")]
    Compression(#[from] io::Error),
    #[error("frame does not start with the plan magic")]
    BadMagic,
    #[error("frame truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("malformed length prefix")]
    Varint,
}
