//! Splitting of connections whose endpoints run on different partitions.

use ahash::AHashSet;
use tracing::debug;

use crate::{
    assemble::PartitionAssembler,
    construct::{ConnectionSpec, Construct},
    error::{ConfigError, Result},
    operator::Operator,
    partition::Assignment,
    registry::{Retention, SignalRegistry},
    signal::{Signal, SignalKey},
};

/// Partitions of a connection's source and destination constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub from: u32,
    pub to: u32,
}

impl Endpoints {
    pub fn crosses(&self) -> bool {
        self.from != self.to
    }
}

/// Looks up both ends of a connection and rejects crossing connections that
/// cannot be split.
pub fn check_connection(
    construct: &Construct,
    spec: &ConnectionSpec,
    assignment: &Assignment,
) -> Result<Endpoints> {
    let ends = Endpoints {
        from: assignment.endpoint(spec.pre)?,
        to: assignment.endpoint(spec.post)?,
    };
    if ends.crosses() {
        if spec.modulatory {
            Err(ConfigError::CrossingModulatory {
                connection: construct.to_string(),
                from: ends.from,
                to: ends.to,
            })?
        }
        if let Some(rule) = spec.learning_rule {
            Err(ConfigError::CrossingLearningRule {
                connection: construct.to_string(),
                rule: rule.to_string(),
                from: ends.from,
                to: ends.to,
            })?
        }
    }
    Ok(ends)
}

/// Membership of each operator of a connection in the pre-group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    in_pre: Vec<bool>,
}

impl Split {
    pub fn pre(&self) -> Vec<usize> {
        self.indices(true)
    }

    pub fn post(&self) -> Vec<usize> {
        self.indices(false)
    }

    fn indices(&self, pre: bool) -> Vec<usize> {
        self.in_pre
            .iter()
            .enumerate()
            .filter(|(_, &p)| p == pre)
            .map(|(i, _)| i)
            .collect()
    }

    /// Moves `ops` into the pre and post groups, keeping their order.
    pub fn apply(&self, ops: Vec<Operator>) -> (Vec<Operator>, Vec<Operator>) {
        let mut pre = Vec::new();
        let mut post = Vec::new();
        for (op, &in_pre) in ops.into_iter().zip(&self.in_pre) {
            if in_pre {
                pre.push(op);
            } else {
                post.push(op);
            }
        }
        (pre, post)
    }
}

/// Splits a connection's operators at `boundary`.
///
/// The single operator updating `boundary` seeds the pre-group. Any
/// operator that sets or increments a signal read by the pre-group joins it,
/// until nothing changes. The rest form the post-group.
pub fn split_connection(
    construct: &Construct,
    ops: &[Operator],
    boundary: &Signal,
) -> Result<Split> {
    let key = boundary.key();
    let owners: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.effects().updates.iter().any(|s| s.key() == key))
        .map(|(i, _)| i)
        .collect();
    if owners.len() != 1 {
        Err(ConfigError::BoundaryOwners {
            connection: construct.to_string(),
            signal: boundary.to_string(),
            count: owners.len(),
        })?
    }

    let mut in_pre = vec![false; ops.len()];
    in_pre[owners[0]] = true;
    let mut needed: AHashSet<SignalKey> = ops[owners[0]]
        .effects()
        .reads
        .iter()
        .map(|s| s.key())
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for (i, op) in ops.iter().enumerate() {
            if in_pre[i] {
                continue;
            }
            let effects = op.effects();
            if effects.writes().any(|s| needed.contains(&s.key())) {
                in_pre[i] = true;
                needed.extend(effects.reads.iter().map(|s| s.key()));
                changed = true;
            }
        }
    }
    Ok(Split { in_pre })
}

/// Dispatches a finished connection. A crossing connection is split at its
/// boundary signal, which is transmitted to both partitions and recorded as
/// a transfer between them.
pub fn resolve_connection(
    construct: &Construct,
    spec: &ConnectionSpec,
    ops: Vec<Operator>,
    assignment: &Assignment,
    registry: &mut SignalRegistry,
    assembler: &mut PartitionAssembler,
) -> Result<()> {
    let ends = check_connection(construct, spec, assignment)?;
    if !ends.crosses() {
        return assembler.dispatch(registry, ends.from, ops);
    }

    let boundary = spec.boundary_signal();
    let split = split_connection(construct, &ops, boundary)?;
    debug!(
        "splitting {} at {}: {} -> {}",
        construct, boundary, ends.from, ends.to
    );

    registry.register(ends.from, boundary, Retention::Keep)?;
    registry.register(ends.to, boundary, Retention::Reclaim)?;
    assembler.record_transfer(ends.from, ends.to, boundary);

    let (pre, post) = split.apply(ops);
    assembler.dispatch(registry, ends.from, pre)?;
    assembler.dispatch(registry, ends.to, post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        construct::LearningRuleKind,
        error::{Error, ErrorKind},
        operator::Synapse,
    };

    struct Conn {
        ops: Vec<Operator>,
        decoded: Signal,
        filtered: Signal,
    }

    // reset -> decode -> filter -> transform, as a decoded connection builds
    fn decoded_connection(pre_out: &Signal, post_in: &Signal) -> Conn {
        let decoded = Signal::zeros("decoded", &[2]);
        let filtered = Signal::zeros("filtered", &[2]);
        let ops = vec![
            Operator::Reset {
                dst: decoded.clone(),
                value: 0.,
            },
            Operator::DotInc {
                a: Signal::zeros("decoders", &[2, 3]),
                x: pre_out.clone(),
                y: decoded.clone(),
            },
            Operator::SimSynapse {
                synapse: Synapse::Lowpass { tau: 0.005 },
                input: decoded.clone(),
                output: filtered.clone(),
            },
            Operator::ElementwiseInc {
                a: Signal::vector("transform", vec![1., 1.]),
                x: filtered.clone(),
                y: post_in.clone(),
            },
        ];
        Conn {
            ops,
            decoded,
            filtered,
        }
    }

    fn spec(a: &Construct, b: &Construct, conn: &Conn) -> ConnectionSpec {
        ConnectionSpec::builder()
            .pre(a.id())
            .post(b.id())
            .output(conn.decoded.clone())
            .synapse_out(conn.filtered.clone())
            .build()
    }

    #[test]
    fn split_follows_write_read_closure() {
        let conn = decoded_connection(
            &Signal::zeros("a.out", &[3]),
            &Signal::zeros("b.in", &[2]),
        );
        let construct = Construct::ensemble("c");
        let split =
            split_connection(&construct, &conn.ops, &conn.filtered).unwrap();
        assert_eq!(split.pre(), vec![0, 1, 2]);
        assert_eq!(split.post(), vec![3]);

        let (pre, post) = split.apply(conn.ops);
        assert_eq!(pre.len(), 3);
        assert_eq!(post[0].name(), "ElementwiseInc");
    }

    #[test]
    fn unfiltered_boundary_has_no_owner() {
        let conn = decoded_connection(
            &Signal::zeros("a.out", &[3]),
            &Signal::zeros("b.in", &[2]),
        );
        let construct = Construct::ensemble("c");
        let err =
            split_connection(&construct, &conn.ops, &conn.decoded).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::BoundaryOwners { count: 0, .. })
        ));
    }

    #[test]
    fn doubly_filtered_boundary_is_rejected() {
        let mut conn = decoded_connection(
            &Signal::zeros("a.out", &[3]),
            &Signal::zeros("b.in", &[2]),
        );
        conn.ops.insert(
            3,
            Operator::SimSynapse {
                synapse: Synapse::Alpha { tau: 0.01 },
                input: conn.decoded.clone(),
                output: conn.filtered.clone(),
            },
        );
        let construct = Construct::ensemble("c");
        let err =
            split_connection(&construct, &conn.ops, &conn.filtered).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::BoundaryOwners { count: 2, .. })
        ));
    }

    #[test]
    fn crossing_connection_rejects_modulation() {
        let (a, b) = (Construct::ensemble("a"), Construct::ensemble("b"));
        let conn = decoded_connection(
            &Signal::zeros("a.out", &[3]),
            &Signal::zeros("b.in", &[2]),
        );
        let modulatory = Construct::connection(
            "a->b",
            ConnectionSpec {
                modulatory: true,
                ..spec(&a, &b, &conn)
            },
        );
        let assignment = Assignment::new(2)
            .unwrap()
            .with(&a, 1)
            .unwrap()
            .with(&b, 0)
            .unwrap();
        let spec = modulatory.as_connection().unwrap();
        assert!(matches!(
            check_connection(&modulatory, spec, &assignment),
            Err(Error::Config(ConfigError::CrossingModulatory {
                from: 1,
                to: 0,
                ..
            }))
        ));

        let local = assignment.with(&b, 1).unwrap();
        assert!(check_connection(&modulatory, spec, &local).is_ok());
    }

    #[test]
    fn crossing_connection_rejects_learning() {
        let (a, b) = (Construct::ensemble("a"), Construct::ensemble("b"));
        let conn = decoded_connection(
            &Signal::zeros("a.out", &[3]),
            &Signal::zeros("b.in", &[2]),
        );
        let learning = Construct::connection(
            "a->b",
            ConnectionSpec {
                learning_rule: Some(LearningRuleKind::Pes),
                ..spec(&a, &b, &conn)
            },
        );
        let assignment = Assignment::new(2)
            .unwrap()
            .with(&a, 0)
            .unwrap()
            .with(&b, 1)
            .unwrap();
        let spec = learning.as_connection().unwrap();
        let err = check_connection(&learning, spec, &assignment).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("PES"));

        let local = assignment.with(&b, 0).unwrap();
        assert!(!check_connection(&learning, spec, &local)
            .unwrap()
            .crosses());
    }

    #[test]
    fn crossing_connection_transfers_boundary() {
        let (a, b) = (Construct::ensemble("a"), Construct::ensemble("b"));
        let (a_out, b_in) =
            (Signal::zeros("a.out", &[3]), Signal::zeros("b.in", &[2]));
        let conn = decoded_connection(&a_out, &b_in);
        let construct = Construct::connection("a->b", spec(&a, &b, &conn));
        let assignment = Assignment::new(2)
            .unwrap()
            .with(&a, 0)
            .unwrap()
            .with(&b, 1)
            .unwrap();
        let mut registry = SignalRegistry::new(2);
        let mut assembler = PartitionAssembler::new(2);

        let filtered = conn.filtered.clone();
        resolve_connection(
            &construct,
            construct.as_connection().unwrap(),
            conn.ops,
            &assignment,
            &mut registry,
            &mut assembler,
        )
        .unwrap();

        assert_eq!(registry.holders(filtered.key()), vec![0, 1]);
        assert!(filtered.is_reclaimed());
        assert_eq!(registry.holders(b_in.key()), vec![1]);
        assert_eq!(registry.holders(a_out.key()), vec![0]);
        let drafts = assembler.drafts();
        assert_eq!(drafts[0].ops.len(), 3);
        assert_eq!(drafts[1].ops.len(), 1);
        assert_eq!(drafts[0].outgoing[0].peer, 1);
        assert_eq!(drafts[1].incoming[0].peer, 0);
    }
}
