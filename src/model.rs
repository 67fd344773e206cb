//! The construction API.
//!
//! A front end drives a [`Model`] construct by construct: it begins a
//! construct, emits the operators that realize it, and ends it. Ending a
//! construct dispatches its operators to the partition its assignment names,
//! splitting connections that cross partitions. [`Model::finalize`] then
//! orders, synchronizes and lowers every partition.

use std::mem;

use tracing::{debug, warn};

use crate::{
    assemble::{check_unsynced_reads, PartitionAssembler},
    config::LoweringConfig,
    construct::{Construct, ConstructId, ConstructKind},
    error::{ConfigError, Result, UsageError},
    host::HostFunctionTable,
    lower::{lower_partition, LoweringContext},
    operator::Operator,
    partition::{Assignment, ConstructGraph, Partitioner},
    plan::{Lowered, LoweredPlan, PartitionPlan},
    probe::{self, ProbeRequest},
    registry::{PartitionStore, SignalRegistry},
    resolve::{check_connection, resolve_connection},
    schedule::{schedule, verify_order},
};

struct Frame {
    construct: Construct,
    ops: Vec<Operator>,
}

pub struct Model {
    config: LoweringConfig,
    assignment: Assignment,
    registry: SignalRegistry,
    assembler: PartitionAssembler,
    stack: Vec<Frame>,
    probes: Vec<ProbeRequest>,
    finalized: bool,
}

impl Model {
    pub fn new(assignment: Assignment, config: LoweringConfig) -> Result<Self> {
        config.validate()?;
        let n = assignment.n_partitions();
        Ok(Self {
            config,
            assignment,
            registry: SignalRegistry::new(n),
            assembler: PartitionAssembler::new(n),
            stack: Vec::new(),
            probes: Vec::new(),
            finalized: false,
        })
    }

    /// Creates a model whose assignment comes from `partitioner`, verified
    /// against every construct in `graph`.
    pub fn with_partitioner<P: Partitioner + ?Sized>(
        graph: &ConstructGraph,
        partitioner: &P,
        config: LoweringConfig,
    ) -> Result<Self> {
        let assignment = partitioner.partition(graph)?;
        assignment.verify(graph.constructs())?;
        Self::new(assignment, config)
    }

    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    /// Number of constructs currently being built.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Makes `construct` the target of subsequent [`emit`](Self::emit)
    /// calls. Connections crossing partitions are checked here, before any
    /// of their operators exist.
    pub fn begin_construct(&mut self, construct: Construct) -> Result<()> {
        self.ensure_open()?;
        match construct.kind() {
            ConstructKind::Connection(spec) => {
                check_connection(&construct, spec, &self.assignment)?;
            }
            _ => {
                self.assignment.partition_of(&construct)?;
            }
        }
        self.stack.push(Frame {
            construct,
            ops: Vec::new(),
        });
        Ok(())
    }

    /// Records `op` against the innermost active construct.
    pub fn emit(&mut self, op: Operator) -> Result<()> {
        self.ensure_open()?;
        match self.stack.last_mut() {
            Some(frame) => frame.ops.push(op),
            None => Err(UsageError::NoActiveConstruct {
                operator: op.to_string(),
            })?,
        }
        Ok(())
    }

    /// Ends the innermost active construct, which must be `id`, and
    /// dispatches its operators.
    pub fn end_construct(&mut self, id: ConstructId) -> Result<()> {
        self.ensure_open()?;
        let frame = match self.stack.pop() {
            Some(frame) if frame.construct.id() == id => frame,
            Some(frame) => {
                let open = frame.construct.to_string();
                self.stack.push(frame);
                Err(UsageError::MismatchedEnd {
                    open,
                    found: format!("#{}", id),
                })?
            }
            None => Err(UsageError::EndWithoutBegin)?,
        };
        self.dispatch(frame)
    }

    /// Begins `construct` and returns a scope that ends it. A scope dropped
    /// without [`ConstructScope::finish`] discards the construct and its
    /// operators.
    pub fn enter(&mut self, construct: Construct) -> Result<ConstructScope<'_>> {
        let id = construct.id();
        let depth = self.stack.len();
        self.begin_construct(construct)?;
        Ok(ConstructScope {
            model: self,
            id,
            depth,
            finished: false,
        })
    }

    /// Builds `construct` with `builder` inside a scope.
    pub fn build<B: BuildConstruct + ?Sized>(
        &mut self,
        construct: Construct,
        builder: &B,
    ) -> Result<()> {
        let mut scope = self.enter(construct)?;
        builder.build(&mut scope)?;
        scope.finish()
    }

    /// Dispatches prebuilt operators straight to `partition`, bypassing the
    /// construct stack.
    pub fn assign_ops(&mut self, partition: u32, ops: Vec<Operator>) -> Result<()> {
        self.ensure_open()?;
        self.assembler.dispatch(&mut self.registry, partition, ops)
    }

    /// Orders, synchronizes and lowers every partition, then binds probes.
    /// Can only be called once.
    pub fn finalize(&mut self) -> Result<Lowered> {
        self.ensure_open()?;
        if let Some(frame) = self.stack.last() {
            Err(ConfigError::UnbalancedConstructs {
                open: frame.construct.to_string(),
            })?
        }
        self.finalized = true;

        let n = self.assignment.n_partitions();
        let drafts =
            mem::replace(&mut self.assembler, PartitionAssembler::new(n))
                .into_drafts();
        check_unsynced_reads(&drafts)?;

        let mut host_functions = HostFunctionTable::default();
        let mut lowered = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = draft.id;
            let ordered = schedule(draft)?;
            verify_order(id, &ordered)?;
            let mut ctx = LoweringContext {
                partition: id,
                dt: self.config.dt,
                filter_skip_ratio: self.config.filter_skip_ratio,
                store: self.registry.store(id),
                host_functions: &mut host_functions,
            };
            lowered.push((id, lower_partition(&ordered, &mut ctx)?));
        }

        let probes = probe::bind(&self.probes, &mut self.registry, self.config.dt)?;

        let empty = PartitionStore::default();
        let partitions = lowered
            .into_iter()
            .map(|(id, ops)| {
                PartitionPlan::new(id, ops, self.registry.store(id).unwrap_or(&empty))
            })
            .collect();
        debug!("finalized {} partitions", n);
        Ok(Lowered {
            plan: LoweredPlan {
                label: self.config.plan_label(),
                dt: self.config.dt,
                partitions,
                probes,
            },
            host_functions,
        })
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let Frame { construct, ops } = frame;
        debug!("dispatching {} with {} operators", construct, ops.len());
        match construct.kind() {
            ConstructKind::Connection(spec) => resolve_connection(
                &construct,
                spec,
                ops,
                &self.assignment,
                &mut self.registry,
                &mut self.assembler,
            ),
            ConstructKind::Probe(spec) => {
                let partition = self.assignment.partition_of(&construct)?;
                self.assembler.dispatch(&mut self.registry, partition, ops)?;
                self.probes.push(ProbeRequest {
                    key: spec.key.unwrap_or_else(|| construct.id().get()),
                    label: construct.label().to_string(),
                    partition,
                    target: spec.target.clone(),
                    sample_every: spec.sample_every,
                });
                Ok(())
            }
            ConstructKind::Ensemble | ConstructKind::Node => {
                let partition = self.assignment.partition_of(&construct)?;
                self.assembler.dispatch(&mut self.registry, partition, ops)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finalized {
            Err(UsageError::AlreadyFinalized)?
        }
        Ok(())
    }
}

/// An active construct. Ends it on [`finish`](Self::finish), discards it on
/// drop.
pub struct ConstructScope<'m> {
    model: &'m mut Model,
    id: ConstructId,
    depth: usize,
    finished: bool,
}

impl ConstructScope<'_> {
    pub fn id(&self) -> ConstructId {
        self.id
    }

    pub fn emit(&mut self, op: Operator) -> Result<()> {
        self.model.emit(op)
    }

    /// Begins a construct nested inside this one.
    pub fn enter(&mut self, construct: Construct) -> Result<ConstructScope<'_>> {
        self.model.enter(construct)
    }

    pub fn build<B: BuildConstruct + ?Sized>(
        &mut self,
        construct: Construct,
        builder: &B,
    ) -> Result<()> {
        self.model.build(construct, builder)
    }

    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.model.end_construct(self.id)
    }
}

impl Drop for ConstructScope<'_> {
    fn drop(&mut self) {
        if !self.finished && self.model.stack.len() > self.depth {
            warn!("discarding unfinished construct #{}", self.id);
            self.model.stack.truncate(self.depth);
        }
    }
}

/// Emits the operators of one construct. Implemented by the front end for
/// each kind of object it builds.
pub trait BuildConstruct {
    fn build(&self, scope: &mut ConstructScope<'_>) -> Result<()>;
}

impl<F> BuildConstruct for F
where
    F: Fn(&mut ConstructScope<'_>) -> Result<()>,
{
    fn build(&self, scope: &mut ConstructScope<'_>) -> Result<()> {
        self(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{Error, ErrorKind},
        signal::Signal,
    };

    fn reset(label: &str) -> Operator {
        Operator::Reset {
            dst: Signal::zeros(label, &[1]),
            value: 0.,
        }
    }

    fn model_with(constructs: &[&Construct]) -> Model {
        let mut assignment = Assignment::new(1).unwrap();
        for c in constructs {
            assignment.assign(c.id(), 0).unwrap();
        }
        Model::new(assignment, LoweringConfig::default()).unwrap()
    }

    #[test]
    fn emit_needs_active_construct() {
        let mut model = model_with(&[]);
        let err = model.emit(reset("x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(matches!(
            model.end_construct(Construct::node("n").id()),
            Err(Error::Usage(UsageError::EndWithoutBegin))
        ));
    }

    #[test]
    fn end_must_match_innermost() {
        let (a, b) = (Construct::node("a"), Construct::node("b"));
        let mut model = model_with(&[&a, &b]);
        model.begin_construct(a.clone()).unwrap();
        model.begin_construct(b.clone()).unwrap();
        assert!(matches!(
            model.end_construct(a.id()),
            Err(Error::Usage(UsageError::MismatchedEnd { .. }))
        ));
        assert_eq!(model.depth(), 2);
        model.end_construct(b.id()).unwrap();
        model.end_construct(a.id()).unwrap();
        assert_eq!(model.depth(), 0);
    }

    #[test]
    fn unassigned_constructs_are_rejected_on_entry() {
        let mut model = model_with(&[]);
        let err = model.begin_construct(Construct::ensemble("e")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(model.depth(), 0);
    }

    #[test]
    fn finalize_runs_once() {
        let a = Construct::node("a");
        let mut model = model_with(&[&a]);
        model.begin_construct(a.clone()).unwrap();
        model.emit(reset("x")).unwrap();
        assert!(matches!(
            model.finalize(),
            Err(Error::Config(ConfigError::UnbalancedConstructs { .. }))
        ));
        model.end_construct(a.id()).unwrap();

        let lowered = model.finalize().unwrap();
        assert_eq!(lowered.plan.partitions[0].ops.len(), 1);
        assert!(matches!(
            model.finalize(),
            Err(Error::Usage(UsageError::AlreadyFinalized))
        ));
        assert!(model.emit(reset("y")).is_err());
        assert!(model.begin_construct(a).is_err());
    }

    #[test]
    fn failed_builds_release_their_scope() {
        let (outer, inner) = (Construct::node("outer"), Construct::node("inner"));
        let mut model = model_with(&[&outer, &inner]);
        let failing = |scope: &mut ConstructScope<'_>| -> Result<()> {
            scope.emit(reset("x"))?;
            Err(UsageError::EndWithoutBegin.into())
        };
        let nesting = |scope: &mut ConstructScope<'_>| -> Result<()> {
            scope.emit(reset("y"))?;
            scope.build(inner.clone(), &failing)
        };
        assert!(model.build(outer.clone(), &nesting).is_err());
        assert_eq!(model.depth(), 0);

        let lowered = model.finalize().unwrap();
        assert!(lowered.plan.partitions[0].ops.is_empty());
    }

    fn probed_model() -> Lowered {
        let x = Signal::zeros("x", &[2]);
        let node = Construct::node("n");
        let probe = Construct::probe(
            "p",
            crate::construct::ProbeSpec::builder().target(x.clone()).build(),
        );
        let mut model = model_with(&[&node, &probe]);
        model.begin_construct(node.clone()).unwrap();
        model
            .emit(Operator::Reset {
                dst: x.clone(),
                value: 1.,
            })
            .unwrap();
        model.end_construct(node.id()).unwrap();
        model.begin_construct(probe.clone()).unwrap();
        model.end_construct(probe.id()).unwrap();
        model.finalize().unwrap()
    }

    #[test]
    fn probed_builds_share_a_fingerprint() {
        let (first, second) = (probed_model().plan, probed_model().plan);
        assert_eq!(first.probes[0].label, "p");
        assert_ne!(first.probes[0].probe, second.probes[0].probe);
        assert_eq!(first.canonical(), second.canonical());
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
    }

    #[test]
    fn scopes_nest() {
        let (outer, inner) = (Construct::node("outer"), Construct::node("inner"));
        let mut model = model_with(&[&outer, &inner]);
        {
            let mut scope = model.enter(outer.clone()).unwrap();
            scope.emit(reset("a")).unwrap();
            let mut nested = scope.enter(inner.clone()).unwrap();
            nested.emit(reset("b")).unwrap();
            nested.finish().unwrap();
            scope.finish().unwrap();
        }
        model.assign_ops(0, vec![reset("c")]).unwrap();
        let lowered = model.finalize().unwrap();
        assert_eq!(lowered.plan.partitions[0].ops.len(), 3);
        assert_eq!(lowered.plan.partitions[0].signals.len(), 3);
    }
}
