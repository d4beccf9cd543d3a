//! Per-namespace topology state.
//!
//! Everything a balance run reads lives here, behind a single
//! reader/writer guard owned by the namespace: the last observed cluster
//! view, rack assignments, the active and pending rosters, and the
//! cluster-wide quiesced set. Readers for reporting (`roster`, `racks`)
//! take the same guard, so an info query never interleaves with a roster
//! being rewritten mid-read.

use crate::topology::exchange::ClusterView;
use crate::types::{ClusterKey, NodeId, RackId, RosterNode};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Mutable topology state of one namespace. Always accessed under the
/// namespace guard; has no locking of its own.
#[derive(Debug)]
pub struct TopologyState {
    /// Last cluster view observed from the exchange.
    pub view: ClusterView,

    /// Observed rack assignment per node, gathered from exchange metadata.
    pub rack_ids: HashMap<NodeId, RackId>,

    /// Active roster (strong-consistency ownership fence). Empty when unset.
    pub roster: Vec<RosterNode>,

    /// Staged roster awaiting adoption at the next rebalance.
    pub pending_roster: Vec<RosterNode>,

    /// Nodes whose quiesce flag is effective cluster-wide.
    pub quiesced_nodes: HashSet<NodeId>,

    /// Key of the last committed rebalance. A key is balanced exactly once;
    /// roster and quiesce changes wait for the next key.
    pub last_balance_key: ClusterKey,

    /// Bumped once per committed rebalance.
    pub rebalance_generation: u64,
}

impl TopologyState {
    /// Fresh state with no cluster observed yet.
    pub fn new() -> Self {
        Self {
            view: ClusterView::empty(),
            rack_ids: HashMap::new(),
            roster: Vec::new(),
            pending_roster: Vec::new(),
            quiesced_nodes: HashSet::new(),
            last_balance_key: ClusterKey::ZERO,
            rebalance_generation: 0,
        }
    }

    /// Record a newly observed view and the rack assignments that came with
    /// it. Returns true if the view actually changed.
    pub fn apply_view(&mut self, view: ClusterView, rack_ids: HashMap<NodeId, RackId>) -> bool {
        if view == self.view {
            self.rack_ids.extend(rack_ids);
            return false;
        }
        self.view = view;
        self.rack_ids.extend(rack_ids);
        true
    }

    /// Rack of a node, 0 when unknown.
    pub fn rack_of(&self, node: NodeId) -> RackId {
        self.rack_ids.get(&node).copied().unwrap_or(0)
    }

    /// Rack ids parallel to the succession list, the shape the balancer
    /// consumes.
    pub fn succession_racks(&self) -> Vec<RackId> {
        self.view
            .succession
            .iter()
            .map(|&n| self.rack_of(n))
            .collect()
    }

    /// Nodes present in the succession but absent from the active roster.
    /// Tracked for operator visibility; never eligible as owners in
    /// strong-consistency mode.
    pub fn observed_nodes(&self) -> Vec<RosterNode> {
        self.view
            .succession
            .iter()
            .map(|&n| RosterNode::new(n, self.rack_of(n)))
            .collect()
    }

    /// Adopt the pending roster as active. Called only while a rebalance is
    /// being committed; the staged copy stays visible as `pending_roster`.
    pub fn adopt_pending_roster(&mut self) -> bool {
        if self.pending_roster.is_empty() || self.pending_roster == self.roster {
            return false;
        }
        self.roster = self.pending_roster.clone();
        true
    }

    /// Group nodes by rack for `racks` output, ordered by rack id.
    pub fn rack_groups(nodes: &[RosterNode]) -> Vec<(RackId, Vec<NodeId>)> {
        let mut groups: BTreeMap<RackId, Vec<NodeId>> = BTreeMap::new();
        for n in nodes {
            groups.entry(n.rack_id).or_default().push(n.id);
        }
        groups.into_iter().collect()
    }
}

impl Default for TopologyState {
    fn default() -> Self {
        Self::new()
    }
}
