//! Handlers for the administrative request surface.
//!
//! Responses use the exact wire tokens clients match on (`ok`,
//! `ERROR::unstable-cluster`, `ignored-by-non-principal`, ...), so the
//! strings here are load-bearing. Malformed parameters and violated
//! preconditions are rejected at this boundary and never mutate state.

use crate::admin::params::{Params, MAX_NAMESPACE_LEN};
use crate::admin::BoxFuture;
use crate::coordinator::ClusterCoordinator;
use crate::error::Error;
use crate::namespace::Namespace;
use crate::roster::{parse_nodes_string, MAX_NODES_STRING};
use crate::topology::{ReformOutcome, TopologyState};
use crate::types::{format_node_id, format_roster};
use tracing::warn;

pub(super) fn roster<'a>(coord: &'a ClusterCoordinator, raw: &'a str) -> BoxFuture<'a, String> {
    Box::pin(async move {
        let params = Params::parse(raw);
        let ns_name = match params.get_str("namespace", MAX_NAMESPACE_LEN) {
            Ok(v) => v,
            Err(_) => return "ERROR::bad-namespace".to_string(),
        };

        match ns_name {
            Some(name) => match coord.namespace(name) {
                Ok(ns) => namespace_roster_info(ns),
                Err(_) => {
                    warn!(namespace = name, "roster: unknown namespace");
                    "ERROR::unknown-namespace".to_string()
                }
            },
            None => coord
                .namespaces()
                .iter()
                .map(|ns| format!("ns={}:{}", ns.name(), namespace_roster_info(ns)))
                .collect::<Vec<_>>()
                .join(";"),
        }
    })
}

fn namespace_roster_info(ns: &Namespace) -> String {
    // One guard across all three lists, so the reply is a consistent
    // snapshot even while a roster is being rewritten.
    let topo = ns.topology();
    format!(
        "roster={}:pending_roster={}:observed_nodes={}",
        format_roster(&topo.roster),
        format_roster(&topo.pending_roster),
        format_roster(&topo.observed_nodes()),
    )
}

pub(super) fn roster_set<'a>(coord: &'a ClusterCoordinator, raw: &'a str) -> BoxFuture<'a, String> {
    Box::pin(async move {
        let params = Params::parse(raw);

        let ns_name = match params.require_str("namespace", MAX_NAMESPACE_LEN) {
            Ok(v) => v,
            Err(e) => {
                warn!("roster-set: {}", e);
                return "ERROR::namespace-name".to_string();
            }
        };
        let nodes_str = match params.require_str("nodes", MAX_NODES_STRING) {
            Ok(v) => v,
            Err(e) => {
                warn!("roster-set: {}", e);
                return "ERROR::nodes".to_string();
            }
        };
        let nodes = match parse_nodes_string(nodes_str) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("roster-set: {}", e);
                return "ERROR::nodes".to_string();
            }
        };

        match coord.roster_set(ns_name, nodes).await {
            Ok(()) => "ok".to_string(),
            Err(Error::UnknownNamespace(_)) => "ERROR::unknown-namespace".to_string(),
            Err(e) => {
                warn!("roster-set: {}", e);
                "ERROR::failed-roster-set".to_string()
            }
        }
    })
}

pub(super) fn racks<'a>(coord: &'a ClusterCoordinator, raw: &'a str) -> BoxFuture<'a, String> {
    Box::pin(async move {
        let params = Params::parse(raw);
        let ns_name = match params.get_str("namespace", MAX_NAMESPACE_LEN) {
            Ok(v) => v,
            Err(_) => return "ERROR::bad-namespace".to_string(),
        };

        match ns_name {
            Some(name) => match coord.namespace(name) {
                Ok(ns) => namespace_rack_info(ns),
                Err(_) => "ERROR::unknown-namespace".to_string(),
            },
            None => coord
                .namespaces()
                .iter()
                .map(|ns| format!("ns={}:{}", ns.name(), namespace_rack_info(ns)))
                .collect::<Vec<_>>()
                .join(";"),
        }
    })
}

fn namespace_rack_info(ns: &Namespace) -> String {
    let topo = ns.topology();
    let mut out = rack_group_info(&TopologyState::rack_groups(&topo.observed_nodes()), "rack_");
    if !topo.roster.is_empty() {
        out.push(':');
        out.push_str(&rack_group_info(
            &TopologyState::rack_groups(&topo.roster),
            "roster_rack_",
        ));
    }
    out
}

fn rack_group_info(groups: &[(u32, Vec<u64>)], tag: &str) -> String {
    groups
        .iter()
        .map(|(rack, nodes)| {
            let nodes = nodes
                .iter()
                .map(|&n| format_node_id(n))
                .collect::<Vec<_>>()
                .join(",");
            format!("{}{}={}", tag, rack, nodes)
        })
        .collect::<Vec<_>>()
        .join(":")
}

pub(super) fn recluster<'a>(coord: &'a ClusterCoordinator, _raw: &'a str) -> BoxFuture<'a, String> {
    Box::pin(async move {
        match coord.recluster() {
            ReformOutcome::Reformed => "ok".to_string(),
            ReformOutcome::IgnoredByNonPrincipal => "ignored-by-non-principal".to_string(),
            ReformOutcome::Failed => "ERROR".to_string(),
        }
    })
}

pub(super) fn quiesce<'a>(coord: &'a ClusterCoordinator, _raw: &'a str) -> BoxFuture<'a, String> {
    Box::pin(async move {
        match coord.quiesce() {
            Ok(()) => "ok".to_string(),
            Err(_) => "ERROR::permanently-quiesced".to_string(),
        }
    })
}

pub(super) fn quiesce_undo<'a>(
    coord: &'a ClusterCoordinator,
    _raw: &'a str,
) -> BoxFuture<'a, String> {
    Box::pin(async move {
        if coord.quiesce_undo() {
            "ok".to_string()
        } else {
            "ignored-permanently-quiesced".to_string()
        }
    })
}

pub(super) fn revive<'a>(coord: &'a ClusterCoordinator, raw: &'a str) -> BoxFuture<'a, String> {
    Box::pin(async move {
        let params = Params::parse(raw);
        let ns_name = match params.get_str("namespace", MAX_NAMESPACE_LEN) {
            Ok(v) => v,
            Err(_) => return "ERROR::bad-namespace".to_string(),
        };

        match ns_name {
            Some(name) => match coord.namespace(name) {
                Ok(ns) => match coord.revive_namespace(ns) {
                    Ok(_) => "ok".to_string(),
                    Err(e) => {
                        warn!(namespace = name, "revive failed: {}", e);
                        "ERROR::failed-revive".to_string()
                    }
                },
                Err(_) => "ERROR::unknown-namespace".to_string(),
            },
            None => {
                for ns in coord.namespaces() {
                    if !ns.config.strong_consistency {
                        continue;
                    }
                    if let Err(e) = coord.revive_namespace(ns) {
                        warn!(namespace = %ns.name(), "revive failed: {}", e);
                        return "ERROR::failed-revive".to_string();
                    }
                }
                "ok".to_string()
            }
        }
    })
}

pub(super) fn cluster_stable<'a>(
    coord: &'a ClusterCoordinator,
    raw: &'a str,
) -> BoxFuture<'a, String> {
    Box::pin(async move {
        // Fenced query: capture the key first, perform the checks, and fail
        // rather than answer for a view that died under us.
        let begin_key = coord.exchange().cluster_key();

        if !coord.migrations_allowed() {
            return "ERROR::unstable-cluster".to_string();
        }

        let params = Params::parse(raw);

        match params.get_u32("size", 3) {
            Ok(None) => {}
            Ok(Some(target_size)) => {
                if target_size as usize != coord.exchange().cluster_size() {
                    return "ERROR::cluster-not-specified-size".to_string();
                }
            }
            Err(e) => {
                warn!("cluster-stable: {}", e);
                return "ERROR::bad-size".to_string();
            }
        }

        let ignore_migrations = match params.get_bool("ignore-migrations") {
            Ok(v) => v.unwrap_or(false),
            Err(e) => {
                warn!("cluster-stable: {}", e);
                return "ERROR::bad-ignore-migrations".to_string();
            }
        };

        if !ignore_migrations {
            let ns_name = match params.get_str("namespace", MAX_NAMESPACE_LEN) {
                Ok(v) => v,
                Err(_) => return "ERROR::bad-namespace".to_string(),
            };
            match ns_name {
                None => {
                    if coord.total_migrations_remaining() != 0 {
                        return "ERROR::unstable-cluster".to_string();
                    }
                }
                Some(name) => {
                    let Ok(ns) = coord.namespace(name) else {
                        warn!(namespace = name, "cluster-stable: unknown namespace");
                        return "ERROR::unknown-namespace".to_string();
                    };
                    let stats = ns.stats();
                    let outstanding = stats.migrations_remaining()
                        + stats.n_unavailable_partitions
                        + stats.n_dead_partitions
                        + ns.appeals.unresolved() as u64;
                    if outstanding != 0 {
                        return "ERROR::unstable-cluster".to_string();
                    }
                }
            }
        }

        if begin_key != coord.exchange().cluster_key() {
            // The cluster changed while we were checking.
            return "ERROR::unstable-cluster".to_string();
        }

        format!("{:x}", begin_key)
    })
}

pub(super) fn get_sl<'a>(coord: &'a ClusterCoordinator, _raw: &'a str) -> BoxFuture<'a, String> {
    Box::pin(async move {
        coord
            .exchange()
            .current()
            .succession
            .iter()
            .map(|&n| format_node_id(n))
            .collect::<Vec<_>>()
            .join(",")
    })
}
