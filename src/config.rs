//! Configuration types for the partition control plane.

use crate::types::{NodeId, RackId};
use smol_str::SmolStr;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of partitions per namespace.
pub const DEFAULT_PARTITION_COUNT: u32 = 4096;

/// Main configuration for one control-plane node.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Rack this node lives in (0 = no rack).
    pub rack_id: RackId,

    /// Number of outbound migration worker permits.
    pub migrate_threads: usize,

    /// Maximum concurrent inbound migrations accepted by this node across
    /// all namespaces. Excess senders are told to retry, never failed.
    pub migrate_max_incoming: usize,

    /// Directory holding durable roster and quiesce state.
    pub state_dir: PathBuf,

    /// Sticky quiesce: this node came up permanently quiesced and
    /// `quiesce-undo` must not clear it.
    pub stay_quiesced: bool,

    /// Per-namespace configuration.
    pub namespaces: Vec<NamespaceConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            rack_id: 0,
            migrate_threads: 1,
            migrate_max_incoming: 4,
            state_dir: PathBuf::from("./shardplane-state"),
            stay_quiesced: false,
            namespaces: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration for the given node id.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set this node's rack.
    pub fn with_rack_id(mut self, rack_id: RackId) -> Self {
        self.rack_id = rack_id;
        self
    }

    /// Set the outbound migration worker count.
    pub fn with_migrate_threads(mut self, threads: usize) -> Self {
        self.migrate_threads = threads.max(1);
        self
    }

    /// Set the inbound migration concurrency cap.
    pub fn with_max_incoming(mut self, max: usize) -> Self {
        self.migrate_max_incoming = max.max(1);
        self
    }

    /// Set the durable-state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Come up permanently quiesced.
    pub fn with_stay_quiesced(mut self, stay: bool) -> Self {
        self.stay_quiesced = stay;
        self
    }

    /// Add a namespace.
    pub fn with_namespace(mut self, ns: NamespaceConfig) -> Self {
        self.namespaces.push(ns);
        self
    }
}

/// Per-namespace configuration.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Namespace name.
    pub name: SmolStr,

    /// Fixed number of partitions, set at namespace init.
    pub partition_count: u32,

    /// Configured replication factor (owners per partition).
    pub replication_factor: usize,

    /// Strong-consistency mode: ownership fenced by the operator roster.
    pub strong_consistency: bool,

    /// Prefer the explicit uniform-balance tie-break over the legacy
    /// clustering-by-hash tie-break.
    pub prefer_uniform_balance: bool,

    /// Drain priority relative to other namespaces (lower drains first).
    pub migrate_order: u32,

    /// Delay before emigrations start, letting the prior owner keep serving
    /// while new owners catch up.
    pub migrate_fill_delay: Duration,

    /// Interval after which an unacknowledged transfer batch is resent.
    /// Retransmission repeats until the receiver completes or the key
    /// advances; attempts are counted, never fatal.
    pub migrate_retransmit_interval: Duration,

    /// Optional pause between record batches for throttling.
    pub migrate_sleep: Duration,

    /// Records per transfer batch.
    pub migrate_batch_size: usize,

    /// If the whole rebalance plans at most this many transfers on this
    /// node, skip the fill delay and start replicating immediately.
    pub migrate_lead_threshold: usize,

    /// How long a rostered-but-absent node may stay missing before its
    /// partitions are flagged unavailable. `None` flags them immediately.
    pub absent_node_grace: Option<Duration>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            name: SmolStr::new("default"),
            partition_count: DEFAULT_PARTITION_COUNT,
            replication_factor: 2,
            strong_consistency: false,
            prefer_uniform_balance: false,
            migrate_order: 5,
            migrate_fill_delay: Duration::ZERO,
            migrate_retransmit_interval: Duration::from_secs(5),
            migrate_sleep: Duration::ZERO,
            migrate_batch_size: 1024,
            migrate_lead_threshold: 8,
            absent_node_grace: None,
        }
    }
}

impl NamespaceConfig {
    /// Create a namespace configuration with the given name.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the partition count.
    pub fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = count.max(1);
        self
    }

    /// Set the replication factor.
    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor.max(1);
        self
    }

    /// Enable strong-consistency mode.
    pub fn with_strong_consistency(mut self, sc: bool) -> Self {
        self.strong_consistency = sc;
        self
    }

    /// Use the explicit uniform-balance tie-break.
    pub fn with_uniform_balance(mut self, uniform: bool) -> Self {
        self.prefer_uniform_balance = uniform;
        self
    }

    /// Set the drain priority (lower drains first).
    pub fn with_migrate_order(mut self, order: u32) -> Self {
        self.migrate_order = order.clamp(1, 10);
        self
    }

    /// Set the fill delay.
    pub fn with_fill_delay(mut self, delay: Duration) -> Self {
        self.migrate_fill_delay = delay;
        self
    }

    /// Set the batch retransmit interval.
    pub fn with_retransmit_interval(mut self, interval: Duration) -> Self {
        self.migrate_retransmit_interval = interval;
        self
    }

    /// Set the per-batch throttle sleep.
    pub fn with_migrate_sleep(mut self, sleep: Duration) -> Self {
        self.migrate_sleep = sleep;
        self
    }

    /// Set records per transfer batch.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.migrate_batch_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_config_builder() {
        let config = CoordinatorConfig::new(0xa1)
            .with_rack_id(2)
            .with_migrate_threads(4)
            .with_max_incoming(8)
            .with_namespace(NamespaceConfig::new("test"));

        assert_eq!(config.node_id, 0xa1);
        assert_eq!(config.rack_id, 2);
        assert_eq!(config.migrate_threads, 4);
        assert_eq!(config.migrate_max_incoming, 8);
        assert_eq!(config.namespaces.len(), 1);
    }

    #[test]
    fn test_namespace_config_clamps() {
        let ns = NamespaceConfig::new("test")
            .with_replication_factor(0)
            .with_migrate_order(99)
            .with_partition_count(0);

        assert_eq!(ns.replication_factor, 1);
        assert_eq!(ns.migrate_order, 10);
        assert_eq!(ns.partition_count, 1);
    }
}
