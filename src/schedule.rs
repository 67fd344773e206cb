//! Per-partition ordering of operators and placement of transfer markers.

use std::{cmp::Reverse, collections::BinaryHeap};

use ahash::AHashSet;
use hashbrown::HashMap;
use petgraph::{algo::tarjan_scc, prelude::DiGraphMap};
use tracing::{debug, debug_span, trace};

use crate::{
    assemble::PartitionDraft,
    error::{GraphError, Result},
    operator::Operator,
    signal::SignalKey,
};

#[derive(Default)]
struct Touches {
    sets: Vec<usize>,
    incs: Vec<usize>,
    reads: Vec<usize>,
    updates: Vec<usize>,
}

/// Builds the dependency graph over `ops`, with nodes being indices into
/// `ops`.
///
/// Per signal, setters precede incrementers, writers precede readers and
/// every other operator touching the signal precedes its updaters. Updaters
/// of one signal are chained in index order.
pub fn dependency_graph(ops: &[Operator]) -> DiGraphMap<usize, ()> {
    let mut touches: HashMap<SignalKey, Touches> = HashMap::new();
    for (i, op) in ops.iter().enumerate() {
        let effects = op.effects();
        for s in &effects.sets {
            touches.entry(s.key()).or_default().sets.push(i);
        }
        for s in &effects.incs {
            touches.entry(s.key()).or_default().incs.push(i);
        }
        for s in &effects.reads {
            touches.entry(s.key()).or_default().reads.push(i);
        }
        for s in &effects.updates {
            touches.entry(s.key()).or_default().updates.push(i);
        }
    }

    let mut graph = DiGraphMap::new();
    for i in 0..ops.len() {
        graph.add_node(i);
    }
    let mut link = |from: &[usize], to: &[usize]| {
        for &a in from {
            for &b in to {
                if a != b {
                    graph.add_edge(a, b, ());
                }
            }
        }
    };
    for t in touches.values() {
        let writers: Vec<usize> = t.sets.iter().chain(&t.incs).copied().collect();
        let touched: Vec<usize> =
            writers.iter().chain(&t.reads).copied().collect();
        link(&t.sets, &t.incs);
        link(&writers, &t.reads);
        link(&touched, &t.updates);
        for pair in t.updates.windows(2) {
            link(&pair[..1], &pair[1..]);
        }
    }
    graph
}

/// Kahn's algorithm, always taking the ready node with the lowest index. On
/// a cycle, returns the nodes of one strongly connected component that
/// closes it.
pub fn topological_order(
    graph: &DiGraphMap<usize, ()>,
) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: HashMap<usize, usize> =
        graph.nodes().map(|n| (n, 0)).collect();
    for (_, b, _) in graph.all_edges() {
        *in_degree.entry(b).or_default() += 1;
    }
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| Reverse(n))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(n)) = ready.pop() {
        order.push(n);
        for m in graph.neighbors(n) {
            if let Some(d) = in_degree.get_mut(&m) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(m));
                }
            }
        }
    }

    if order.len() == graph.node_count() {
        return Ok(order);
    }
    let mut cycle = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.len() > 1)
        .unwrap_or_default();
    cycle.sort_unstable();
    Err(cycle)
}

/// Orders a partition's operators and inserts its Wait, Send and Recv
/// markers.
///
/// One Wait per transferred signal is placed ahead of the build order. Each
/// Send follows the single operator updating its signal. Each Recv follows
/// the last read of its signal, or its Wait when nothing reads it.
pub fn schedule(draft: PartitionDraft) -> Result<Vec<Operator>> {
    let partition = draft.id;
    let span = debug_span!("partition", id = partition);
    let _guard = span.enter();

    let mut seen = AHashSet::new();
    let mut ops: Vec<Operator> = draft
        .outgoing
        .iter()
        .chain(&draft.incoming)
        .filter(|t| seen.insert(t.signal.key()))
        .map(|t| Operator::Wait {
            signal: t.signal.clone(),
        })
        .collect();
    ops.extend(draft.ops);

    let graph = dependency_graph(&ops);
    let order = match topological_order(&graph) {
        Ok(order) => order,
        Err(cycle) => Err(GraphError::Cycle {
            partition,
            operators: cycle.iter().map(|&i| ops[i].to_string()).collect(),
        })?,
    };
    let mut slots: Vec<Option<Operator>> = ops.into_iter().map(Some).collect();
    let mut ordered: Vec<Operator> =
        order.iter().filter_map(|&i| slots[i].take()).collect();

    for transfer in &draft.outgoing {
        let key = transfer.signal.key();
        let owners: Vec<usize> = ordered
            .iter()
            .enumerate()
            .filter(|(_, op)| op.effects().updates.iter().any(|s| s.key() == key))
            .map(|(i, _)| i)
            .collect();
        if owners.len() != 1 {
            Err(GraphError::TransferOwners {
                partition,
                signal: transfer.signal.to_string(),
                count: owners.len(),
            })?
        }
        trace!(
            "send {} to {} after {}",
            transfer.signal,
            transfer.peer,
            ordered[owners[0]]
        );
        ordered.insert(
            owners[0] + 1,
            Operator::Send {
                signal: transfer.signal.clone(),
                dst: transfer.peer,
            },
        );
    }

    for transfer in &draft.incoming {
        let key = transfer.signal.key();
        let last_read = ordered
            .iter()
            .rposition(|op| op.effects().reads.iter().any(|s| s.key() == key));
        let wait = ordered.iter().position(|op| {
            matches!(op, Operator::Wait { signal } if signal.key() == key)
        });
        let at = match last_read.or(wait) {
            Some(at) => at,
            None => Err(GraphError::UnsyncedRead {
                partition,
                signal: transfer.signal.to_string(),
            })?,
        };
        trace!(
            "recv {} from {} after {}",
            transfer.signal,
            transfer.peer,
            ordered[at]
        );
        ordered.insert(
            at + 1,
            Operator::Recv {
                signal: transfer.signal.clone(),
                src: transfer.peer,
            },
        );
    }

    debug!("scheduled {} operators", ordered.len());
    Ok(ordered)
}

/// Checks that every read of a signal with a local setter or incrementer
/// comes after one of them. Signals that are only updated, or have no local
/// writer at all, are state or external input and exempt.
pub fn verify_order(partition: u32, ops: &[Operator]) -> Result<()> {
    let mut has_writer = AHashSet::new();
    for op in ops {
        has_writer.extend(op.effects().writes().map(|s| s.key()));
    }
    let mut written = AHashSet::new();
    for op in ops {
        let effects = op.effects();
        for signal in &effects.reads {
            let key = signal.key();
            if has_writer.contains(&key) && !written.contains(&key) {
                Err(GraphError::ReadBeforeWrite {
                    partition,
                    signal: signal.to_string(),
                    operator: op.to_string(),
                })?
            }
        }
        written.extend(effects.writes().map(|s| s.key()));
    }
    Ok(())
}
