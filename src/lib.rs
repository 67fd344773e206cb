//! Partitioned lowering of dataflow operator graphs.
//!
//! A model is built construct by construct through [`Model`]. Every
//! construct's operators land on the partition its [`Assignment`] names.
//! Connections between partitions are split at their filtered output, which
//! then moves between partitions every step. Finalizing orders each
//! partition's operators, inserts the Wait, Send and Recv markers that
//! synchronize those transfers, and lowers everything into a
//! [`LoweredPlan`] for an external execution engine.

pub mod assemble;
pub mod config;
pub mod construct;
pub mod error;
pub mod host;
pub mod lower;
pub mod model;
pub mod operator;
pub mod partition;
pub mod plan;
pub mod probe;
pub mod registry;
pub mod resolve;
pub mod schedule;
pub mod signal;

pub use config::LoweringConfig;
pub use construct::{
    ConnectionSpec, Construct, ConstructId, ConstructKind, LearningRuleKind,
    ProbeSpec,
};
pub use error::{Error, ErrorKind, Result};
pub use host::{HostArgs, HostFunction, HostValue};
pub use lower::{OpRecord, OpTag, Operand};
pub use model::{BuildConstruct, ConstructScope, Model};
pub use operator::{NeuronType, Operator, Slice, Synapse};
pub use partition::{
    Assignment, ConstructGraph, PartitionId, Partitioner, SinglePartition,
};
pub use plan::{Lowered, LoweredPlan, PartitionPlan, ProbeBinding};
pub use signal::{Signal, SignalKey};
