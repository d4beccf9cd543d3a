//! Target ownership tables produced by the balancer.

use crate::types::{ClusterKey, NodeId, PartitionId};

/// Target owners of one partition, in selection order.
///
/// The master is usually the first node; quiesce can promote a later one
/// while the quiesced node stays on as a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    /// Selected owner nodes. May be shorter than the replication factor
    /// when the eligible pool is too small.
    pub nodes: Vec<NodeId>,
    /// Index of the master within `nodes`.
    pub master_index: usize,
    /// Owner slots the eligible pool could not fill.
    pub missing_replicas: usize,
}

impl PartitionAssignment {
    /// An assignment with no owners at all: a dead partition.
    pub fn dead(replication_factor: usize) -> Self {
        Self {
            nodes: Vec::new(),
            master_index: 0,
            missing_replicas: replication_factor,
        }
    }

    /// The master node, if the partition has any owner.
    pub fn master(&self) -> Option<NodeId> {
        self.nodes.get(self.master_index).copied()
    }

    /// Replica nodes (owners other than the master).
    pub fn replicas(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.master_index)
            .map(|(_, &n)| n)
    }

    /// Whether a node owns this partition in any role.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// No live owner exists.
    pub fn is_dead(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fewer owners than the replication factor (but at least one).
    pub fn is_under_replicated(&self) -> bool {
        !self.is_dead() && self.missing_replicas > 0
    }
}

/// The balancer's output for every partition of a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipTable {
    assignments: Vec<PartitionAssignment>,
}

impl OwnershipTable {
    /// Build a table from per-partition assignments.
    pub fn new(assignments: Vec<PartitionAssignment>) -> Self {
        Self { assignments }
    }

    /// An all-dead table, the state before any balance has run.
    pub fn unassigned(partition_count: u32, replication_factor: usize) -> Self {
        Self {
            assignments: (0..partition_count)
                .map(|_| PartitionAssignment::dead(replication_factor))
                .collect(),
        }
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.assignments.len() as u32
    }

    /// Assignment for one partition.
    pub fn get(&self, pid: PartitionId) -> Option<&PartitionAssignment> {
        self.assignments.get(pid as usize)
    }

    /// Iterate assignments with their partition ids.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &PartitionAssignment)> {
        self.assignments
            .iter()
            .enumerate()
            .map(|(i, a)| (i as PartitionId, a))
    }

    /// Partitions with at least one owner but fewer than the factor.
    pub fn n_unavailable(&self) -> u64 {
        self.assignments
            .iter()
            .filter(|a| a.is_under_replicated())
            .count() as u64
    }

    /// Partitions with no owner.
    pub fn n_dead(&self) -> u64 {
        self.assignments.iter().filter(|a| a.is_dead()).count() as u64
    }

    /// Partitions a node owns in any role.
    pub fn partitions_of(&self, node: NodeId) -> Vec<PartitionId> {
        self.iter()
            .filter(|(_, a)| a.contains(node))
            .map(|(pid, _)| pid)
            .collect()
    }
}

/// One complete balance result, stamped with the key it was computed for.
#[derive(Debug, Clone)]
pub struct BalanceOutput {
    /// Key the inputs were read under. The result is stale, and must be
    /// discarded, once the live key differs.
    pub key: ClusterKey,
    /// Target ownership for every partition.
    pub table: OwnershipTable,
    /// Count of under-replicated partitions.
    pub n_unavailable: u64,
    /// Count of ownerless partitions.
    pub n_dead: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_roles() {
        let a = PartitionAssignment {
            nodes: vec![10, 20, 30],
            master_index: 1,
            missing_replicas: 0,
        };
        assert_eq!(a.master(), Some(20));
        assert_eq!(a.replicas().collect::<Vec<_>>(), vec![10, 30]);
        assert!(a.contains(30));
        assert!(!a.is_dead());
        assert!(!a.is_under_replicated());
    }

    #[test]
    fn test_dead_and_under_replicated() {
        let dead = PartitionAssignment::dead(2);
        assert!(dead.is_dead());
        assert_eq!(dead.master(), None);

        let under = PartitionAssignment {
            nodes: vec![1],
            master_index: 0,
            missing_replicas: 1,
        };
        assert!(under.is_under_replicated());
    }

    #[test]
    fn test_table_counts() {
        let table = OwnershipTable::new(vec![
            PartitionAssignment {
                nodes: vec![1, 2],
                master_index: 0,
                missing_replicas: 0,
            },
            PartitionAssignment {
                nodes: vec![1],
                master_index: 0,
                missing_replicas: 1,
            },
            PartitionAssignment::dead(2),
        ]);

        assert_eq!(table.n_unavailable(), 1);
        assert_eq!(table.n_dead(), 1);
        assert_eq!(table.partitions_of(1), vec![0, 1]);
        assert_eq!(table.partitions_of(2), vec![0]);
    }
}
