//! Core types used throughout the partition control plane.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
///
/// Rendered as lower-case hex in the admin protocol and logs.
pub type NodeId = u64;

/// Rack (failure domain) identifier. Zero means "no rack configured".
pub type RackId = u32;

/// Index of one partition within a namespace. Partitions are allocated once
/// at namespace init and never destroyed.
pub type PartitionId = u32;

/// Largest rack id accepted by `roster-set`.
pub const MAX_RACK_ID: RackId = 1_000_000;

/// Largest cluster (and roster) size supported.
pub const MAX_CLUSTER_SIZE: usize = 256;

/// Opaque, totally-ordered token identifying one agreed membership view.
///
/// The key changes exactly when the succession list changes. Any decision
/// made "for" a key is invalid once the key advances; long-running work must
/// re-check it before committing side effects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ClusterKey(u64);

impl ClusterKey {
    /// The "no cluster yet" key, never produced by a live exchange.
    pub const ZERO: ClusterKey = ClusterKey(0);

    /// Create a key from its raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value of the key.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The next key in total order. Used by in-process exchanges; a real
    /// agreement protocol may jump arbitrarily as long as keys stay ordered.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::LowerHex for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Format a node id the way the admin protocol expects it.
pub fn format_node_id(id: NodeId) -> String {
    format!("{:x}", id)
}

/// Parse a hex node id as it appears in `roster-set` and `racks` output.
pub fn parse_node_id(s: &str) -> Option<NodeId> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    NodeId::from_str_radix(s, 16).ok()
}

/// One roster entry: a node id with the rack it is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterNode {
    /// Node identifier.
    pub id: NodeId,
    /// Rack identifier, 0 when no rack is configured.
    pub rack_id: RackId,
}

impl RosterNode {
    /// Create a roster entry.
    pub fn new(id: NodeId, rack_id: RackId) -> Self {
        Self { id, rack_id }
    }

    /// Parse one `node-id[:rack-id]` element of a roster nodes string.
    ///
    /// A missing `:rack-id` suffix means rack 0.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once(':') {
            None => parse_node_id(s).map(|id| Self::new(id, 0)),
            Some((id_str, rack_str)) => {
                let id = parse_node_id(id_str)?;
                let rack_id: RackId = rack_str.parse().ok()?;
                if rack_id > MAX_RACK_ID {
                    return None;
                }
                Some(Self::new(id, rack_id))
            }
        }
    }
}

impl fmt::Display for RosterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rack_id == 0 {
            write!(f, "{:x}", self.id)
        } else {
            write!(f, "{:x}:{}", self.id, self.rack_id)
        }
    }
}

/// Render a roster (or observed-node) list as the admin protocol's
/// comma-separated `id[:rack]` form, or `null` when empty.
pub fn format_roster(nodes: &[RosterNode]) -> String {
    if nodes.is_empty() {
        return "null".to_string();
    }
    nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_key_ordering() {
        let a = ClusterKey::new(1);
        let b = a.next();
        assert!(b > a);
        assert_ne!(a, b);
        assert_eq!(format!("{}", ClusterKey::new(0xbeef)), "beef");
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!(parse_node_id("bb9040011ac4202"), Some(0xbb9040011ac4202));
        assert_eq!(parse_node_id("a"), Some(0xa));
        assert_eq!(parse_node_id(""), None);
        assert_eq!(parse_node_id("xyz"), None);
        assert_eq!(parse_node_id("11112222333344445"), None); // 17 digits
    }

    #[test]
    fn test_roster_node_parse() {
        assert_eq!(RosterNode::parse("a1"), Some(RosterNode::new(0xa1, 0)));
        assert_eq!(RosterNode::parse("a1:3"), Some(RosterNode::new(0xa1, 3)));
        assert_eq!(RosterNode::parse("a1:"), None);
        assert_eq!(RosterNode::parse(":3"), None);
        assert_eq!(RosterNode::parse("a1:1000001"), None); // rack out of range
    }

    #[test]
    fn test_format_roster() {
        assert_eq!(format_roster(&[]), "null");
        let nodes = [RosterNode::new(0xa1, 0), RosterNode::new(0xb2, 2)];
        assert_eq!(format_roster(&nodes), "a1,b2:2");
    }
}
