//! The balance function: topology in, target ownership out.

use crate::balance::table::{BalanceOutput, OwnershipTable, PartitionAssignment};
use crate::types::{ClusterKey, NodeId, PartitionId, RackId, RosterNode};
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use tracing::debug;
use twox_hash::XxHash64;

/// Everything one balance run reads. Snapshotted by the caller under the
/// namespace topology guard, so a run always sees consistent inputs.
#[derive(Debug)]
pub struct BalanceInput<'a> {
    /// Key the inputs were read under.
    pub key: ClusterKey,
    /// Agreed succession list.
    pub succession: &'a [NodeId],
    /// Rack ids parallel to `succession`.
    pub rack_ids: &'a [RackId],
    /// Active roster; `Some` iff the namespace is strong-consistency.
    pub roster: Option<&'a [RosterNode]>,
    /// Configured replication factor.
    pub replication_factor: usize,
    /// Nodes with an effective quiesce: replica-eligible, master-ineligible.
    pub quiesced: &'a HashSet<NodeId>,
    /// Previous ownership, consulted by the uniform-balance tie-break to
    /// minimize movement. Stability is a preference, never a hard
    /// constraint; the legacy hash ranking gets it structurally instead.
    pub previous: Option<&'a OwnershipTable>,
    /// Use the explicit uniform-load tie-break instead of clustering-by-hash.
    pub prefer_uniform_balance: bool,
    /// Fixed partition count of the namespace.
    pub partition_count: u32,
}

/// Compute the target ownership table for every partition.
///
/// Deterministic and idempotent: identical inputs yield an identical table.
/// Rack diversity is a hard constraint whenever the eligible pool spans at
/// least `replication_factor` distinct racks. Candidate order within that
/// constraint depends on the mode:
///
/// - legacy clustering-by-hash ranks the pool by a per-(node, partition)
///   hash. The ranking of surviving nodes is unchanged by another node's
///   arrival or departure, so partitions whose owners all survive keep
///   their exact assignment — previous owners are preserved without being
///   consulted.
/// - uniform-balance ranks by accumulated ownership count, preferring
///   previous owners among equally loaded candidates. Evens load at the
///   cost of some extra movement.
pub fn balance(input: &BalanceInput) -> BalanceOutput {
    let pool = eligible_pool(input);
    let rf = input.replication_factor;

    if pool.is_empty() {
        let table = OwnershipTable::unassigned(input.partition_count, rf);
        let n_dead = table.n_dead();
        debug!(key = %input.key, "balance with empty eligible pool, all partitions dead");
        return BalanceOutput {
            key: input.key,
            table,
            n_unavailable: 0,
            n_dead,
        };
    }

    let distinct_racks: HashSet<RackId> = pool.iter().map(|&(_, rack)| rack).collect();
    let rack_constrained = distinct_racks.len() >= rf;

    // Per-node ownership tally, only consulted in uniform-balance mode.
    let mut load: HashMap<NodeId, u64> = pool.iter().map(|&(n, _)| (n, 0)).collect();

    let mut assignments = Vec::with_capacity(input.partition_count as usize);

    for pid in 0..input.partition_count {
        let ordered = order_candidates(input, &pool, &load, pid);
        let selected = select_owners(&ordered, rf, rack_constrained);

        if input.prefer_uniform_balance {
            for &(node, _) in &selected {
                *load.entry(node).or_insert(0) += 1;
            }
        }

        let master_index = selected
            .iter()
            .position(|&(node, _)| !input.quiesced.contains(&node))
            .unwrap_or(0);

        assignments.push(PartitionAssignment {
            missing_replicas: rf.saturating_sub(selected.len()),
            nodes: selected.into_iter().map(|(n, _)| n).collect(),
            master_index,
        });
    }

    let table = OwnershipTable::new(assignments);
    let n_unavailable = table.n_unavailable();
    let n_dead = table.n_dead();

    debug!(
        key = %input.key,
        pool = pool.len(),
        n_unavailable,
        n_dead,
        "balance computed"
    );

    BalanceOutput {
        key: input.key,
        table,
        n_unavailable,
        n_dead,
    }
}

/// The pool of nodes allowed to own partitions: succession intersected with
/// the roster in strong-consistency mode, the succession directly otherwise.
/// Roster rack pins win over observed racks.
fn eligible_pool(input: &BalanceInput) -> Vec<(NodeId, RackId)> {
    match input.roster {
        Some(roster) => {
            let rostered: HashMap<NodeId, RackId> =
                roster.iter().map(|r| (r.id, r.rack_id)).collect();
            input
                .succession
                .iter()
                .filter_map(|&n| rostered.get(&n).map(|&rack| (n, rack)))
                .collect()
        }
        None => input
            .succession
            .iter()
            .enumerate()
            .map(|(i, &n)| (n, input.rack_ids.get(i).copied().unwrap_or(0)))
            .collect(),
    }
}

/// Candidate order for one partition, per the configured tie-break mode.
fn order_candidates(
    input: &BalanceInput,
    pool: &[(NodeId, RackId)],
    load: &HashMap<NodeId, u64>,
    pid: PartitionId,
) -> Vec<(NodeId, RackId)> {
    let mut ordered: Vec<(NodeId, RackId)> = pool.to_vec();

    if input.prefer_uniform_balance {
        let was_owner: HashMap<NodeId, bool> = input
            .previous
            .and_then(|t| t.get(pid))
            .map(|a| a.nodes.iter().map(|&n| (n, true)).collect())
            .unwrap_or_default();
        ordered.sort_by_key(|&(node, _)| {
            (
                load.get(&node).copied().unwrap_or(0),
                !was_owner.get(&node).copied().unwrap_or(false),
                node_score(node, pid),
                node,
            )
        });
    } else {
        ordered.sort_by_key(|&(node, _)| (node_score(node, pid), node));
    }
    ordered
}

/// Greedy pick of up to `rf` distinct owners. With the rack constraint on,
/// no two picks may share a rack; the constraint is only applied when the
/// pool is known to span enough racks to fill every slot.
fn select_owners(
    ordered: &[(NodeId, RackId)],
    rf: usize,
    rack_constrained: bool,
) -> Vec<(NodeId, RackId)> {
    let mut selected: Vec<(NodeId, RackId)> = Vec::with_capacity(rf);
    let mut used_racks: HashSet<RackId> = HashSet::new();

    for &(node, rack) in ordered {
        if selected.len() == rf {
            break;
        }
        if rack_constrained && used_racks.contains(&rack) {
            continue;
        }
        selected.push((node, rack));
        used_racks.insert(rack);
    }

    selected
}

/// Deterministic per-(node, partition) score for the legacy
/// clustering-by-hash tie-break.
fn node_score(node: NodeId, pid: PartitionId) -> u64 {
    let mut hasher = XxHash64::with_seed(pid as u64);
    hasher.write(&node.to_le_bytes());
    hasher.finish()
}
