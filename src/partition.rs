use hashbrown::HashMap;
use petgraph::{prelude::GraphMap, Undirected};

use crate::{
    construct::{Construct, ConstructId, ConstructKind},
    error::{ConfigError, Result},
};

pub type PartitionId = u32;

/// Maps every construct to the partition that runs it.
#[derive(Debug, Clone)]
pub struct Assignment {
    n_partitions: u32,
    map: HashMap<ConstructId, PartitionId>,
}

impl Assignment {
    pub fn new(n_partitions: u32) -> Result<Self> {
        if n_partitions == 0 {
            Err(ConfigError::NoPartitions)?
        }
        Ok(Self {
            n_partitions,
            map: HashMap::new(),
        })
    }

    pub fn n_partitions(&self) -> u32 {
        self.n_partitions
    }

    pub fn assign(
        &mut self,
        construct: ConstructId,
        partition: PartitionId,
    ) -> Result<()> {
        self.check_range(partition)?;
        self.map.insert(construct, partition);
        Ok(())
    }

    /// Builder-style [`assign`](Self::assign).
    pub fn with(
        mut self,
        construct: &Construct,
        partition: PartitionId,
    ) -> Result<Self> {
        self.assign(construct.id(), partition)?;
        Ok(self)
    }

    pub fn get(&self, id: ConstructId) -> Option<PartitionId> {
        self.map.get(&id).copied()
    }

    /// The partition of `construct`, or an error naming it.
    pub fn partition_of(&self, construct: &Construct) -> Result<PartitionId> {
        self.get(construct.id()).ok_or_else(|| {
            ConfigError::Unassigned {
                construct: construct.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn endpoint(&self, id: ConstructId) -> Result<PartitionId> {
        self.get(id).ok_or_else(|| {
            ConfigError::Unassigned {
                construct: format!("#{}", id),
            }
            .into()
        })
    }

    /// Checks that every construct, and both endpoints of every connection,
    /// has a partition within range.
    pub fn verify<'a>(
        &self,
        constructs: impl IntoIterator<Item = &'a Construct>,
    ) -> Result<()> {
        for construct in constructs {
            self.check_range(self.partition_of(construct)?)?;
            if let ConstructKind::Connection(spec) = construct.kind() {
                self.endpoint(spec.pre)?;
                self.endpoint(spec.post)?;
            }
        }
        Ok(())
    }

    fn check_range(&self, partition: PartitionId) -> Result<()> {
        if partition >= self.n_partitions {
            Err(ConfigError::PartitionOutOfRange {
                partition,
                n_partitions: self.n_partitions,
            })?
        }
        Ok(())
    }
}

/// Constructs and their connection adjacency, as handed to a
/// [`Partitioner`].
pub struct ConstructGraph {
    constructs: Vec<Construct>,
    graph: GraphMap<ConstructId, u32, Undirected>,
}

impl ConstructGraph {
    pub fn new(constructs: impl IntoIterator<Item = Construct>) -> Self {
        let constructs: Vec<Construct> = constructs.into_iter().collect();
        let mut graph = GraphMap::new();
        for construct in &constructs {
            match construct.kind() {
                ConstructKind::Connection(spec) => {
                    // parallel connections add weight to one edge
                    match graph.edge_weight_mut(spec.pre, spec.post) {
                        Some(weight) => *weight += 1,
                        None => {
                            graph.add_edge(spec.pre, spec.post, 1);
                        }
                    }
                }
                _ => {
                    graph.add_node(construct.id());
                }
            }
        }
        Self { constructs, graph }
    }

    pub fn constructs(&self) -> &[Construct] {
        &self.constructs
    }

    pub fn graph(&self) -> &GraphMap<ConstructId, u32, Undirected> {
        &self.graph
    }

    pub fn neighbors(
        &self,
        id: ConstructId,
    ) -> impl Iterator<Item = ConstructId> + '_ {
        self.graph.neighbors(id)
    }
}

/// Decides which partition each construct runs on.
pub trait Partitioner {
    fn partition(&self, graph: &ConstructGraph) -> Result<Assignment>;
}

/// Puts every construct on partition 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePartition;

impl Partitioner for SinglePartition {
    fn partition(&self, graph: &ConstructGraph) -> Result<Assignment> {
        let mut assignment = Assignment::new(1)?;
        for construct in graph.constructs() {
            assignment.assign(construct.id(), 0)?;
        }
        Ok(assignment)
    }
}
