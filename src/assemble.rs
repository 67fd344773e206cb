use ahash::AHashSet;
use tracing::debug;

use crate::{
    error::{ConfigError, GraphError, Result},
    operator::Operator,
    registry::{Retention, SignalRegistry},
    signal::{Signal, SignalKey},
};

/// A pending boundary transfer. `peer` is the destination on the sending
/// side and the source on the receiving side.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub signal: Signal,
    pub peer: u32,
}

/// Everything dispatched to one partition, in dispatch order.
#[derive(Debug, Clone)]
pub struct PartitionDraft {
    pub id: u32,
    pub ops: Vec<Operator>,
    pub outgoing: Vec<Transfer>,
    pub incoming: Vec<Transfer>,
}

impl PartitionDraft {
    fn new(id: u32) -> Self {
        Self {
            id,
            ops: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    /// Keys of signals some operator here sets, increments or updates.
    fn written(&self) -> AHashSet<SignalKey> {
        let mut keys = AHashSet::new();
        for op in self.ops.iter().filter(|op| !op.is_synthetic()) {
            let effects = op.effects();
            keys.extend(effects.writes().map(Signal::key));
            keys.extend(effects.updates.iter().map(|s| s.key()));
        }
        keys
    }
}

#[derive(Debug)]
pub struct PartitionAssembler {
    drafts: Vec<PartitionDraft>,
}

impl PartitionAssembler {
    pub fn new(n_partitions: u32) -> Self {
        Self {
            drafts: (0..n_partitions).map(PartitionDraft::new).collect(),
        }
    }

    /// Appends `ops` to a partition, transmitting every signal they touch.
    pub fn dispatch(
        &mut self,
        registry: &mut SignalRegistry,
        partition: u32,
        ops: Vec<Operator>,
    ) -> Result<()> {
        let n_partitions = self.drafts.len() as u32;
        let draft = match self.drafts.get_mut(partition as usize) {
            Some(draft) => draft,
            None => Err(ConfigError::PartitionOutOfRange {
                partition,
                n_partitions,
            })?,
        };
        for op in &ops {
            for signal in op.signals() {
                registry.register(partition, signal, Retention::Reclaim)?;
            }
        }
        debug!("dispatching {} operators to partition {}", ops.len(), partition);
        draft.ops.extend(ops);
        Ok(())
    }

    /// Records that `signal` moves from partition `from` to partition `to`
    /// every step.
    pub fn record_transfer(&mut self, from: u32, to: u32, signal: &Signal) {
        if let Some(draft) = self.drafts.get_mut(from as usize) {
            draft.outgoing.push(Transfer {
                signal: signal.clone(),
                peer: to,
            });
        }
        if let Some(draft) = self.drafts.get_mut(to as usize) {
            draft.incoming.push(Transfer {
                signal: signal.clone(),
                peer: from,
            });
        }
    }

    pub fn drafts(&self) -> &[PartitionDraft] {
        &self.drafts
    }

    pub fn into_drafts(self) -> Vec<PartitionDraft> {
        self.drafts
    }
}

/// Fails if a partition reads a signal that it never writes, that another
/// partition does write, and that it does not receive.
///
/// Drafts filled through [`PartitionAssembler::dispatch`] cannot trip this:
/// dispatch reclaims every signal it transmits, so a second partition
/// touching it fails with `SignalReclaimed` first. Drafts assembled by
/// other means, or signals registered with `Retention::Keep`, are only
/// caught here.
pub fn check_unsynced_reads(drafts: &[PartitionDraft]) -> Result<()> {
    let written: Vec<AHashSet<SignalKey>> =
        drafts.iter().map(PartitionDraft::written).collect();
    for (draft, local) in drafts.iter().zip(&written) {
        let received: AHashSet<SignalKey> =
            draft.incoming.iter().map(|t| t.signal.key()).collect();
        for op in &draft.ops {
            for signal in op.effects().reads {
                let key = signal.key();
                if local.contains(&key) || received.contains(&key) {
                    continue;
                }
                if written.iter().any(|keys| keys.contains(&key)) {
                    Err(GraphError::UnsyncedRead {
                        partition: draft.id,
                        signal: signal.to_string(),
                    })?
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(dst: &Signal, src: &Signal) -> Operator {
        Operator::Copy {
            dst: dst.clone(),
            src: src.clone(),
        }
    }

    #[test]
    fn dispatch_registers_signals() {
        let mut registry = SignalRegistry::new(2);
        let mut assembler = PartitionAssembler::new(2);
        let (a, b) = (Signal::zeros("a", &[1]), Signal::zeros("b", &[1]));
        assembler.dispatch(&mut registry, 1, vec![copy(&b, &a)]).unwrap();

        assert_eq!(assembler.drafts()[1].ops.len(), 1);
        assert!(assembler.drafts()[0].ops.is_empty());
        assert_eq!(registry.holders(a.key()), vec![1]);
        assert!(a.is_reclaimed() && b.is_reclaimed());
        assert!(assembler.dispatch(&mut registry, 2, vec![]).is_err());
    }

    #[test]
    fn transfers_are_recorded_on_both_sides() {
        let mut assembler = PartitionAssembler::new(3);
        let sig = Signal::zeros("x", &[1]);
        assembler.record_transfer(2, 0, &sig);
        let drafts = assembler.into_drafts();
        assert_eq!(drafts[2].outgoing[0].peer, 0);
        assert_eq!(drafts[0].incoming[0].peer, 2);
        assert_eq!(drafts[0].incoming[0].signal.key(), sig.key());
        assert!(drafts[1].incoming.is_empty());
    }

    #[test]
    fn kept_signals_are_checked_for_foreign_reads() {
        let mut registry = SignalRegistry::new(2);
        let mut assembler = PartitionAssembler::new(2);
        let (x, y) = (Signal::zeros("x", &[1]), Signal::zeros("y", &[1]));
        registry.register(0, &x, Retention::Keep).unwrap();
        let writer = Operator::Reset {
            dst: x.clone(),
            value: 0.,
        };
        assembler.dispatch(&mut registry, 0, vec![writer]).unwrap();
        assert!(!x.is_reclaimed());

        assembler
            .dispatch(&mut registry, 1, vec![copy(&y, &x)])
            .unwrap();
        assert!(matches!(
            check_unsynced_reads(assembler.drafts()),
            Err(crate::error::Error::Graph(GraphError::UnsyncedRead {
                partition: 1,
                ..
            }))
        ));

        let mut unkept = SignalRegistry::new(2);
        let mut assembler = PartitionAssembler::new(2);
        let (z, w) = (Signal::zeros("z", &[1]), Signal::zeros("w", &[1]));
        let writer = Operator::Reset {
            dst: z.clone(),
            value: 0.,
        };
        assembler.dispatch(&mut unkept, 0, vec![writer]).unwrap();
        assert!(assembler
            .dispatch(&mut unkept, 1, vec![copy(&w, &z)])
            .is_err());
        assert!(unkept.holders(z.key()) == vec![0]);
    }

    #[test]
    fn foreign_reads_must_be_received() {
        let mut registry = SignalRegistry::new(2);
        let mut assembler = PartitionAssembler::new(2);
        let (x, y, z) = (
            Signal::zeros("x", &[1]),
            Signal::zeros("y", &[1]),
            Signal::zeros("z", &[1]),
        );
        let writer = Operator::Reset {
            dst: x.clone(),
            value: 0.,
        };
        assembler.dispatch(&mut registry, 0, vec![writer]).unwrap();
        // x was reclaimed by partition 0, so bypass registration
        let mut drafts = assembler.into_drafts();
        drafts[1].ops.push(copy(&y, &x));
        drafts[1].ops.push(copy(&y, &z));
        assert!(check_unsynced_reads(&drafts).is_err());

        drafts[1].incoming.push(Transfer {
            signal: x.clone(),
            peer: 0,
        });
        assert!(check_unsynced_reads(&drafts).is_ok());
    }
}
