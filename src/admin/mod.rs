//! Administrative request surface.
//!
//! Requests are `command[:key=value[;key=value...]]` lines answered with a
//! response string. Dispatch goes through a lookup table built once at
//! first use — command name to handler plus required-permission tag — so
//! read-mostly dispatch takes no locks.

mod commands;
mod params;

pub use params::{Params, MAX_NAMESPACE_LEN};

use crate::coordinator::ClusterCoordinator;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

/// Boxed future every handler returns.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Handler = for<'a> fn(&'a ClusterCoordinator, &'a str) -> BoxFuture<'a, String>;

/// Permission a caller needs for a command. Enforcement belongs to the
/// outer request layer; the tag travels with the table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Reads state only.
    ReadOnly,
    /// Mutates cluster state.
    Operator,
}

struct CommandEntry {
    permission: Permission,
    handler: Handler,
}

fn registry() -> &'static HashMap<&'static str, CommandEntry> {
    static REGISTRY: OnceLock<HashMap<&'static str, CommandEntry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, CommandEntry> = HashMap::new();
        let mut add = |name: &'static str, permission: Permission, handler: Handler| {
            map.insert(name, CommandEntry { permission, handler });
        };

        add("roster", Permission::ReadOnly, commands::roster);
        add("roster-set", Permission::Operator, commands::roster_set);
        add("racks", Permission::ReadOnly, commands::racks);
        add("recluster", Permission::Operator, commands::recluster);
        add("quiesce", Permission::Operator, commands::quiesce);
        add("quiesce-undo", Permission::Operator, commands::quiesce_undo);
        add("revive", Permission::Operator, commands::revive);
        add("cluster-stable", Permission::ReadOnly, commands::cluster_stable);
        add("get-sl", Permission::ReadOnly, commands::get_sl);

        map
    })
}

/// Permission tag of a command, if it exists.
pub fn permission_of(command: &str) -> Option<Permission> {
    registry().get(command).map(|e| e.permission)
}

/// Dispatch one request line against a coordinator.
pub async fn dispatch(coord: &ClusterCoordinator, line: &str) -> String {
    let (name, raw_params) = match line.split_once(':') {
        Some((name, rest)) => (name, rest),
        None => (line, ""),
    };

    match registry().get(name) {
        Some(entry) => (entry.handler)(coord, raw_params).await,
        None => "ERROR::unknown-command".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_control_surface() {
        for cmd in [
            "roster",
            "roster-set",
            "racks",
            "recluster",
            "quiesce",
            "quiesce-undo",
            "revive",
            "cluster-stable",
            "get-sl",
        ] {
            assert!(permission_of(cmd).is_some(), "{} not registered", cmd);
        }
        assert!(permission_of("rooster").is_none());
    }

    #[test]
    fn test_mutating_commands_are_operator_gated() {
        for cmd in ["roster-set", "recluster", "quiesce", "quiesce-undo", "revive"] {
            assert_eq!(permission_of(cmd), Some(Permission::Operator));
        }
        for cmd in ["roster", "racks", "cluster-stable", "get-sl"] {
            assert_eq!(permission_of(cmd), Some(Permission::ReadOnly));
        }
    }
}
