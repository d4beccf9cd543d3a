//! Roster and quiesce administration.
//!
//! The roster is the operator's durable statement of which nodes may hold
//! data in strong-consistency mode. `roster-set` validates and persists a
//! staged roster; it never triggers rebalancing by itself — adoption waits
//! for the next rebalance after an explicit `recluster`. Roster changes
//! never rewrite history: they only affect future balancing.

mod quiesce;
mod store;

pub use quiesce::QuiesceState;
pub use store::{FileRosterStore, RosterPersistence, RosterRecord};

use crate::error::{ParamError, Result};
use crate::types::{RosterNode, MAX_CLUSTER_SIZE};
use std::collections::HashSet;

/// Longest accepted `nodes=` parameter value. 256 nodes at up to 24 chars
/// per `id:rack` element.
pub const MAX_NODES_STRING: usize = MAX_CLUSTER_SIZE * 24;

/// Parse and validate a `roster-set` nodes string: comma-separated
/// `node-id[:rack-id]` elements, hex node ids, distinct, within the
/// cluster-size bound.
pub fn parse_nodes_string(nodes: &str) -> Result<Vec<RosterNode>> {
    if nodes.len() > MAX_NODES_STRING {
        return Err(ParamError::TooLong {
            key: "nodes",
            max: MAX_NODES_STRING,
        }
        .into());
    }

    let mut parsed = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();

    for element in nodes.split(',') {
        let node = RosterNode::parse(element).ok_or_else(|| ParamError::Malformed {
            key: "nodes",
            value: element.to_string(),
        })?;
        if !seen.insert(node.id) {
            return Err(ParamError::Malformed {
                key: "nodes",
                value: format!("duplicate node {:x}", node.id),
            }
            .into());
        }
        parsed.push(node);
    }

    if parsed.len() > MAX_CLUSTER_SIZE {
        return Err(ParamError::Malformed {
            key: "nodes",
            value: format!("{} nodes exceeds cluster limit", parsed.len()),
        }
        .into());
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_parse_nodes_string() {
        let nodes = parse_nodes_string("a1,b2:2,c3:1").unwrap();
        assert_eq!(
            nodes,
            vec![
                RosterNode::new(0xa1, 0),
                RosterNode::new(0xb2, 2),
                RosterNode::new(0xc3, 1),
            ]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            parse_nodes_string("a1,,b2"),
            Err(Error::BadParam(ParamError::Malformed { key: "nodes", .. }))
        ));
        assert!(parse_nodes_string("zz!").is_err());
        assert!(parse_nodes_string("a1:9999999").is_err());
    }

    #[test]
    fn test_parse_rejects_duplicates() {
        assert!(parse_nodes_string("a1,a1:2").is_err());
    }
}
