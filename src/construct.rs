use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use typed_builder::TypedBuilder;

use crate::signal::Signal;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstructId(u64);

impl ConstructId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConstructId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningRuleKind {
    Pes,
    Bcm,
    Oja,
    Voja,
}

impl fmt::Display for LearningRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LearningRuleKind::Pes => "PES",
            LearningRuleKind::Bcm => "BCM",
            LearningRuleKind::Oja => "Oja",
            LearningRuleKind::Voja => "Voja",
        };
        f.write_str(name)
    }
}

/// What the lowering engine needs to know about a connection.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ConnectionSpec {
    pub pre: ConstructId,
    pub post: ConstructId,
    /// The raw (unfiltered) output signal.
    pub output: Signal,
    /// The filtered output, present when the connection carries a synapse.
    #[builder(default, setter(strip_option))]
    pub synapse_out: Option<Signal>,
    #[builder(default)]
    pub modulatory: bool,
    #[builder(default, setter(strip_option))]
    pub learning_rule: Option<LearningRuleKind>,
}

impl ConnectionSpec {
    /// The signal at which a crossing connection is split.
    pub fn boundary_signal(&self) -> &Signal {
        self.synapse_out.as_ref().unwrap_or(&self.output)
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct ProbeSpec {
    pub target: Signal,
    /// Sampling interval in seconds. `None` samples every step.
    #[builder(default, setter(strip_option))]
    pub sample_every: Option<f64>,
    /// Key under which the execution engine records samples. Defaults to the
    /// probe's construct id.
    #[builder(default, setter(strip_option))]
    pub key: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum ConstructKind {
    Ensemble,
    Node,
    Connection(ConnectionSpec),
    Probe(ProbeSpec),
}

/// A high-level object whose build emits operators.
#[derive(Debug, Clone)]
pub struct Construct {
    id: ConstructId,
    label: String,
    kind: ConstructKind,
}

impl Construct {
    pub fn new(label: impl Into<String>, kind: ConstructKind) -> Self {
        Self {
            id: ConstructId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            kind,
        }
    }

    pub fn ensemble(label: impl Into<String>) -> Self {
        Self::new(label, ConstructKind::Ensemble)
    }

    pub fn node(label: impl Into<String>) -> Self {
        Self::new(label, ConstructKind::Node)
    }

    pub fn connection(label: impl Into<String>, spec: ConnectionSpec) -> Self {
        Self::new(label, ConstructKind::Connection(spec))
    }

    pub fn probe(label: impl Into<String>, spec: ProbeSpec) -> Self {
        Self::new(label, ConstructKind::Probe(spec))
    }

    pub fn id(&self) -> ConstructId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &ConstructKind {
        &self.kind
    }

    pub fn as_connection(&self) -> Option<&ConnectionSpec> {
        match &self.kind {
            ConstructKind::Connection(spec) => Some(spec),
            _ => None,
        }
    }
}

impl fmt::Display for Construct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_prefers_filtered_output() {
        let a = Construct::ensemble("a");
        let b = Construct::ensemble("b");
        let raw = Signal::zeros("raw", &[1]);
        let filtered = Signal::zeros("filtered", &[1]);
        let spec = ConnectionSpec::builder()
            .pre(a.id())
            .post(b.id())
            .output(raw.clone())
            .build();
        assert_eq!(spec.boundary_signal().key(), raw.key());

        let spec = ConnectionSpec {
            synapse_out: Some(filtered.clone()),
            ..spec
        };
        assert_eq!(spec.boundary_signal().key(), filtered.key());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.to_string(), format!("a#{}", a.id()));
    }
}
