//! Per-namespace runtime state: the fixed partition array, topology guard,
//! counters, quiesce flags, and appeal registry.
//!
//! Partitions are allocated once at namespace init and never destroyed;
//! only their owner sets and state churn. Each partition slot owns its
//! migration sessions exclusively — a session is installed or swapped out
//! under the slot lock and never mutated by two threads.

use crate::appeal::AppealRegistry;
use crate::balance::PartitionAssignment;
use crate::config::NamespaceConfig;
use crate::error::{Error, Result};
use crate::metrics::{NamespaceCounters, StatsSnapshot};
use crate::migrate::{MigrationSession, SessionState};
use crate::roster::QuiesceState;
use crate::topology::TopologyState;
use crate::types::{NodeId, PartitionId};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use smol_str::SmolStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle of one partition as realized on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionLifeState {
    /// Current ownership equals target ownership.
    Stable,
    /// Transfers outstanding against the current target.
    Migrating,
    /// Fewer owners than the replication factor, or an unresolved appeal.
    Unavailable,
    /// No live owner holds this partition.
    Dead,
}

/// One partition slot.
#[derive(Debug)]
pub struct Partition {
    /// Partition index.
    pub id: PartitionId,
    /// Ownership as actually realized by migration.
    pub current: PartitionAssignment,
    /// Ownership computed by the balancer for the current key.
    pub target: PartitionAssignment,
    /// Lifecycle state.
    pub state: PartitionLifeState,
    /// Operator accepted current data as authoritative (`revive`); cleared
    /// at the next rebalance.
    pub revived: bool,
    /// This node expects an inbound transfer it has not seen yet.
    pub awaiting_immigration: bool,
    /// Outbound sessions, one per receiving peer.
    pub emigrations: Vec<Arc<MigrationSession>>,
    /// Inbound session, installed when the sender's start arrives.
    pub immigration: Option<Arc<MigrationSession>>,
}

impl Partition {
    fn new(id: PartitionId, replication_factor: usize) -> Self {
        Self {
            id,
            current: PartitionAssignment::dead(replication_factor),
            target: PartitionAssignment::dead(replication_factor),
            state: PartitionLifeState::Dead,
            revived: false,
            awaiting_immigration: false,
            emigrations: Vec::new(),
            immigration: None,
        }
    }

    /// State an assignment maps to once realized.
    pub fn state_of(assignment: &PartitionAssignment) -> PartitionLifeState {
        if assignment.is_dead() {
            PartitionLifeState::Dead
        } else if assignment.is_under_replicated() {
            PartitionLifeState::Unavailable
        } else {
            PartitionLifeState::Stable
        }
    }

    /// Whether any session can still make progress.
    pub fn transfers_outstanding(&self) -> bool {
        if self.awaiting_immigration {
            return true;
        }
        if let Some(rx) = &self.immigration {
            if !rx.state().is_terminal() {
                return true;
            }
        }
        self.emigrations.iter().any(|s| !s.state().is_terminal())
    }

    /// Advance `current` to `target` if every planned transfer finished
    /// cleanly. Aborted sessions block realization: a fresh plan under the
    /// new key owns the partition's future.
    pub fn try_realize_target(&mut self) -> bool {
        if self.transfers_outstanding() {
            return false;
        }
        let any_aborted = self
            .emigrations
            .iter()
            .chain(self.immigration.iter())
            .any(|s| s.state() == SessionState::Aborted);
        if any_aborted {
            return false;
        }

        self.current = self.target.clone();
        self.state = Self::state_of(&self.current);
        self.revived = false;
        self.emigrations.clear();
        self.immigration = None;
        true
    }
}

/// One namespace's control-plane state.
#[derive(Debug)]
pub struct Namespace {
    /// Static configuration.
    pub config: NamespaceConfig,
    /// Progress counters read by the ticker.
    pub counters: Arc<NamespaceCounters>,
    /// Appeal bookkeeping (meaningful in strong-consistency mode only).
    pub appeals: AppealRegistry,

    topology: RwLock<TopologyState>,
    partitions: Vec<Mutex<Partition>>,
    quiesce: Mutex<QuiesceState>,

    migrations_allowed: AtomicBool,
    rebalance_in_progress: AtomicBool,
}

impl Namespace {
    /// Create a namespace with all partitions dead, awaiting the first
    /// balance run.
    pub fn new(config: NamespaceConfig, node_id: NodeId, sticky_quiesce: bool) -> Self {
        let counters = Arc::new(NamespaceCounters::new());
        let partitions = (0..config.partition_count)
            .map(|pid| Mutex::new(Partition::new(pid, config.replication_factor)))
            .collect();

        Self {
            appeals: AppealRegistry::new(config.name.clone(), node_id, Arc::clone(&counters)),
            counters,
            topology: RwLock::new(TopologyState::new()),
            partitions,
            quiesce: Mutex::new(QuiesceState::new(sticky_quiesce)),
            migrations_allowed: AtomicBool::new(false),
            rebalance_in_progress: AtomicBool::new(false),
            config,
        }
    }

    /// Namespace name.
    pub fn name(&self) -> &SmolStr {
        &self.config.name
    }

    /// Read the topology state.
    pub fn topology(&self) -> RwLockReadGuard<'_, TopologyState> {
        self.topology.read()
    }

    /// Write the topology state. Held across a whole balance run so the run
    /// sees a consistent snapshot.
    pub fn topology_mut(&self) -> RwLockWriteGuard<'_, TopologyState> {
        self.topology.write()
    }

    /// The quiesce flags of the local node.
    pub fn quiesce(&self) -> MutexGuard<'_, QuiesceState> {
        self.quiesce.lock()
    }

    /// One partition slot.
    pub fn partition(&self, pid: PartitionId) -> Result<&Mutex<Partition>> {
        self.partitions
            .get(pid as usize)
            .ok_or(Error::UnknownPartition(pid))
    }

    /// All partition slots.
    pub fn partitions(&self) -> &[Mutex<Partition>] {
        &self.partitions
    }

    /// Whether migrations may run: false before the first rebalance, while
    /// a balance result is stale, and mid-revive.
    pub fn migrations_allowed(&self) -> bool {
        self.migrations_allowed.load(Ordering::Acquire)
    }

    /// Set by the coordinator when a rebalance commits or is invalidated.
    pub fn set_migrations_allowed(&self, allowed: bool) {
        self.migrations_allowed.store(allowed, Ordering::Release);
    }

    /// Whether a rebalance is currently being computed or committed.
    pub fn rebalance_in_progress(&self) -> bool {
        self.rebalance_in_progress.load(Ordering::Acquire)
    }

    /// Mark the rebalance window. Returns false if one was already marked.
    pub fn begin_rebalance(&self) -> bool {
        !self.rebalance_in_progress.swap(true, Ordering::AcqRel)
    }

    /// Close the rebalance window.
    pub fn end_rebalance(&self) {
        self.rebalance_in_progress.store(false, Ordering::Release);
    }

    /// Advance a partition's `current` to its `target` if its transfers all
    /// finished. Returns whether the partition was realized.
    pub fn finalize_partition(&self, pid: PartitionId) -> Result<bool> {
        let slot = self.partition(pid)?;
        let realized = slot.lock().try_realize_target();
        Ok(realized)
    }

    /// Whether current ownership equals target ownership everywhere.
    pub fn converged(&self) -> bool {
        self.partitions.iter().all(|slot| {
            let p = slot.lock();
            p.current == p.target && !p.transfers_outstanding()
        })
    }

    /// Consistent counter snapshot: taken under the topology guard so no
    /// partial rebalance update is visible.
    pub fn stats(&self) -> StatsSnapshot {
        let _guard = self.topology.read();
        let mut snapshot = self.counters.snapshot();
        let quiesce = self.quiesce.lock();
        snapshot.pending_quiesce = quiesce.pending();
        snapshot.effective_is_quiesced = quiesce.effective();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::Direction;
    use crate::types::ClusterKey;

    fn namespace() -> Namespace {
        Namespace::new(
            NamespaceConfig::new("test").with_partition_count(8),
            1,
            false,
        )
    }

    fn assignment(nodes: Vec<NodeId>) -> PartitionAssignment {
        PartitionAssignment {
            nodes,
            master_index: 0,
            missing_replicas: 0,
        }
    }

    #[test]
    fn test_partitions_created_once() {
        let ns = namespace();
        assert_eq!(ns.partitions().len(), 8);
        assert!(ns.partition(7).is_ok());
        assert!(matches!(
            ns.partition(8),
            Err(Error::UnknownPartition(8))
        ));
    }

    #[test]
    fn test_realize_waits_for_sessions() {
        let ns = namespace();
        let slot = ns.partition(0).unwrap();

        {
            let mut p = slot.lock();
            p.target = assignment(vec![1, 2]);
            let tx = Arc::new(MigrationSession::new(
                SmolStr::new("test"),
                0,
                2,
                Direction::Emigrate,
                ClusterKey::new(1),
            ));
            p.emigrations.push(Arc::clone(&tx));
            p.state = PartitionLifeState::Migrating;

            assert!(!p.try_realize_target());
            tx.try_activate();
            tx.complete();
            assert!(p.try_realize_target());
            assert_eq!(p.current, assignment(vec![1, 2]));
            assert_eq!(p.state, PartitionLifeState::Stable);
        }

        assert!(ns.converged());
    }

    #[test]
    fn test_aborted_session_blocks_realization() {
        let ns = namespace();
        let slot = ns.partition(0).unwrap();
        let mut p = slot.lock();

        p.target = assignment(vec![1, 2]);
        let tx = Arc::new(MigrationSession::new(
            SmolStr::new("test"),
            0,
            2,
            Direction::Emigrate,
            ClusterKey::new(1),
        ));
        tx.abort();
        p.emigrations.push(tx);

        assert!(!p.try_realize_target());
        assert!(p.current.is_dead(), "aborted transfer must not advance ownership");
    }

    #[test]
    fn test_rebalance_window_flag() {
        let ns = namespace();
        assert!(ns.begin_rebalance());
        assert!(!ns.begin_rebalance());
        assert!(ns.rebalance_in_progress());
        ns.end_rebalance();
        assert!(!ns.rebalance_in_progress());
    }
}
