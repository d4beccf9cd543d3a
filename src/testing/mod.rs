//! Testing utilities for the partition control plane.
//!
//! Provides the pieces a multi-node test needs without real networking or
//! a real storage engine:
//! - [`MemoryPartitionStore`] — BTreeMap-backed partition storage
//! - [`MemoryRosterStore`] — roster persistence without a filesystem
//! - [`NullFabric`] — a fabric that acknowledges everything and delivers
//!   nothing, for single-node tests
//! - [`LoopbackFabric`] — routes fabric traffic between in-process
//!   coordinators
//! - [`TestCluster`] — a fixture wiring N coordinators onto one exchange
//!   and one loopback fabric, with explicit, deterministic rebalance
//!   driving

mod rebalance_e2e_tests;

use crate::config::NamespaceConfig;
use crate::coordinator::ClusterCoordinator;
use crate::error::{Error, Result};
use crate::migrate::{
    AppealRequest, AppealVerdict, BatchAck, DoneNotice, MigrationFabric, MigrationRecord,
    PartitionStore, StartRequest, StartResponse, TransferBatch,
};
use crate::roster::{RosterPersistence, RosterRecord};
use crate::topology::{ExchangeView, LocalExchange};
use crate::types::{NodeId, PartitionId};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory partition storage with ordered scans and version-keyed
/// idempotent apply.
#[derive(Debug, Default)]
pub struct MemoryPartitionStore {
    partitions: Mutex<HashMap<PartitionId, BTreeMap<Vec<u8>, MigrationRecord>>>,
}

impl MemoryPartitionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `count` synthetic records into one partition.
    pub fn populate(&self, pid: PartitionId, count: usize) {
        let mut partitions = self.partitions.lock();
        let records = partitions.entry(pid).or_default();
        for i in 0..count {
            let key = format!("k{:05}", i).into_bytes();
            records.insert(
                key.clone(),
                MigrationRecord::new(key, format!("v{}", i).into_bytes(), 1),
            );
        }
    }

    /// Fetch one record, if present.
    pub fn get(&self, pid: PartitionId, key: &[u8]) -> Option<MigrationRecord> {
        self.partitions.lock().get(&pid)?.get(key).cloned()
    }

    /// Records held for one partition.
    pub fn count(&self, pid: PartitionId) -> u64 {
        self.partitions
            .lock()
            .get(&pid)
            .map(|r| r.len() as u64)
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl PartitionStore for MemoryPartitionStore {
    async fn read_batch(
        &self,
        pid: PartitionId,
        cursor: Option<Vec<u8>>,
        max_records: usize,
    ) -> Result<(Vec<MigrationRecord>, Option<Vec<u8>>)> {
        let partitions = self.partitions.lock();
        let Some(records) = partitions.get(&pid) else {
            return Ok((Vec::new(), None));
        };

        let lower = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        let batch: Vec<MigrationRecord> = records
            .range((lower, Bound::Unbounded))
            .take(max_records)
            .map(|(_, r)| r.clone())
            .collect();

        let next = if batch.len() == max_records {
            batch.last().map(|r| r.key.clone())
        } else {
            None
        };
        Ok((batch, next))
    }

    async fn apply_record(&self, pid: PartitionId, record: &MigrationRecord) -> Result<bool> {
        let mut partitions = self.partitions.lock();
        let records = partitions.entry(pid).or_default();

        match records.get(&record.key) {
            Some(existing)
                if (existing.generation, existing.last_update_time)
                    >= (record.generation, record.last_update_time) =>
            {
                Ok(false)
            }
            _ => {
                records.insert(record.key.clone(), record.clone());
                Ok(true)
            }
        }
    }

    async fn record_count(&self, pid: PartitionId) -> Result<u64> {
        Ok(self.count(pid))
    }
}

/// Roster persistence backed by a map, for tests that do not want tempdirs.
#[derive(Debug, Default)]
pub struct MemoryRosterStore {
    rosters: Mutex<HashMap<String, RosterRecord>>,
    sticky: AtomicBool,
}

impl MemoryRosterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RosterPersistence for MemoryRosterStore {
    async fn save(&self, namespace: &str, record: &RosterRecord) -> Result<()> {
        self.rosters
            .lock()
            .insert(namespace.to_string(), record.clone());
        Ok(())
    }

    async fn load(&self, namespace: &str) -> Result<Option<RosterRecord>> {
        Ok(self.rosters.lock().get(namespace).cloned())
    }

    async fn set_sticky_quiesce(&self, sticky: bool) -> Result<()> {
        self.sticky.store(sticky, Ordering::Relaxed);
        Ok(())
    }

    async fn sticky_quiesce(&self) -> Result<bool> {
        Ok(self.sticky.load(Ordering::Relaxed))
    }
}

/// A fabric that acknowledges sends without delivering them. For tests
/// where no data actually needs to move.
#[derive(Debug, Default)]
pub struct NullFabric;

#[async_trait::async_trait]
impl MigrationFabric for NullFabric {
    async fn send_start(&self, _to: NodeId, _req: StartRequest) -> Result<StartResponse> {
        Ok(StartResponse::Ok)
    }

    async fn send_batch(&self, _to: NodeId, payload: Bytes) -> Result<BatchAck> {
        let batch = TransferBatch::decode(&payload)?;
        Ok(BatchAck {
            session: batch.session,
            sequence: batch.sequence,
        })
    }

    async fn send_done(&self, _to: NodeId, _notice: DoneNotice) -> Result<()> {
        Ok(())
    }

    async fn send_appeal(&self, _to: NodeId, _req: AppealRequest) -> Result<AppealVerdict> {
        Ok(AppealVerdict::Retained)
    }
}

/// Routes fabric traffic straight into the receiving coordinator's engine.
#[derive(Debug, Default)]
pub struct LoopbackFabric {
    peers: RwLock<HashMap<NodeId, Arc<ClusterCoordinator>>>,
}

impl LoopbackFabric {
    /// Create an empty fabric; peers register as they come up.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a coordinator as reachable.
    pub fn register(&self, coordinator: Arc<ClusterCoordinator>) {
        self.peers
            .write()
            .insert(coordinator.node_id(), coordinator);
    }

    fn peer(&self, id: NodeId) -> Result<Arc<ClusterCoordinator>> {
        self.peers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Fabric(format!("unreachable node {:x}", id)))
    }
}

#[async_trait::async_trait]
impl MigrationFabric for LoopbackFabric {
    async fn send_start(&self, to: NodeId, req: StartRequest) -> Result<StartResponse> {
        let peer = self.peer(to)?;
        let ns = peer.namespace(req.namespace.as_str())?.clone();
        peer.engine().handle_start(&ns, &req)
    }

    async fn send_batch(&self, to: NodeId, payload: Bytes) -> Result<BatchAck> {
        let peer = self.peer(to)?;
        let batch = TransferBatch::decode(&payload)?;
        let ns = peer.namespace(batch.namespace.as_str())?.clone();
        peer.engine().handle_batch(&ns, &payload).await
    }

    async fn send_done(&self, to: NodeId, notice: DoneNotice) -> Result<()> {
        let peer = self.peer(to)?;
        let ns = peer.namespace(notice.namespace.as_str())?.clone();
        peer.engine().handle_done(&ns, &notice)
    }

    async fn send_appeal(&self, to: NodeId, req: AppealRequest) -> Result<AppealVerdict> {
        let peer = self.peer(to)?;
        let ns = peer.namespace(req.namespace.as_str())?.clone();
        Ok(peer.engine().handle_appeal(&ns, &req))
    }
}

/// One node of a [`TestCluster`].
#[derive(Debug)]
pub struct TestNode {
    /// Node id.
    pub id: NodeId,
    /// The node's coordinator.
    pub coordinator: Arc<ClusterCoordinator>,
    /// The node's storage, for seeding and inspecting records.
    pub store: Arc<MemoryPartitionStore>,
}

/// An in-process cluster fixture.
///
/// Rebalancing is driven explicitly (`advance`, `recluster_from`) rather
/// than through each coordinator's event loop, so tests control exactly
/// when each node reacts and assertions stay deterministic.
#[derive(Debug)]
pub struct TestCluster {
    /// Shared membership exchange.
    pub exchange: Arc<LocalExchange>,
    /// Shared loopback fabric.
    pub fabric: Arc<LoopbackFabric>,
    /// Nodes in id order.
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create coordinators for `node_ids`, all serving one namespace and
    /// all in rack 0.
    pub async fn new(node_ids: &[NodeId], ns_config: NamespaceConfig) -> Self {
        let placed: Vec<(NodeId, crate::types::RackId)> =
            node_ids.iter().map(|&id| (id, 0)).collect();
        Self::with_racks(&placed, ns_config).await
    }

    /// Create coordinators with explicit rack placement.
    pub async fn with_racks(
        nodes_with_racks: &[(NodeId, crate::types::RackId)],
        ns_config: NamespaceConfig,
    ) -> Self {
        let exchange = Arc::new(LocalExchange::new());
        let fabric = Arc::new(LoopbackFabric::new());

        let mut nodes = Vec::with_capacity(nodes_with_racks.len());
        for &(id, rack) in nodes_with_racks {
            let store = Arc::new(MemoryPartitionStore::new());
            let config = crate::config::CoordinatorConfig::new(id)
                .with_rack_id(rack)
                .with_namespace(ns_config.clone());
            let coordinator = ClusterCoordinator::with_persistence(
                config,
                Arc::clone(&exchange) as Arc<dyn ExchangeView>,
                Arc::clone(&fabric) as Arc<dyn MigrationFabric>,
                Arc::clone(&store) as Arc<dyn PartitionStore>,
                Arc::new(MemoryRosterStore::new()),
            )
            .await
            .expect("coordinator");

            fabric.register(Arc::clone(&coordinator));
            nodes.push(TestNode {
                id,
                coordinator,
                store,
            });
        }

        Self {
            exchange,
            fabric,
            nodes,
        }
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("no node {:x}", id))
    }

    /// Agree on a new succession and rebalance every node against it.
    pub fn advance(&self, succession: Vec<NodeId>) {
        self.exchange.advance(succession);
        self.rebalance_all_nodes();
    }

    /// Issue `recluster` from one node and, if the exchange honored it,
    /// rebalance every node against the new key.
    pub async fn recluster_from(&self, id: NodeId) -> String {
        let response = self.node(id).coordinator.info("recluster:").await;
        if response == "ok" {
            self.rebalance_all_nodes();
        }
        response
    }

    /// Run the balancer on every node for the current view.
    pub fn rebalance_all_nodes(&self) {
        for node in &self.nodes {
            node.coordinator.rebalance_all();
        }
    }

    /// Outstanding migrations across every node.
    pub fn total_remaining(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.coordinator.total_migrations_remaining())
            .sum()
    }

    /// Wait until every node converged and no migrations remain.
    pub async fn settle(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let converged = self.total_remaining() == 0
                && self.nodes.iter().all(|n| {
                    n.coordinator
                        .namespaces()
                        .iter()
                        .all(|ns| ns.converged())
                });
            if converged {
                return;
            }
            if Instant::now() >= deadline {
                panic!(
                    "cluster failed to settle: {} migrations remaining",
                    self.total_remaining()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Issue one admin request against one node.
    pub async fn info(&self, id: NodeId, line: &str) -> String {
        self.node(id).coordinator.info(line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_scan_and_apply() {
        let store = MemoryPartitionStore::new();
        store.populate(0, 25);

        let (first, cursor) = store.read_batch(0, None, 10).await.unwrap();
        assert_eq!(first.len(), 10);
        assert!(cursor.is_some());

        let (second, cursor) = store.read_batch(0, cursor, 10).await.unwrap();
        assert_eq!(second.len(), 10);
        let (rest, cursor) = store.read_batch(0, cursor, 10).await.unwrap();
        assert_eq!(rest.len(), 5);
        assert!(cursor.is_none());

        // Older copy is skipped, newer applied.
        let stale = MigrationRecord::new(b"k00000".to_vec(), b"old".to_vec(), 0);
        assert!(!store.apply_record(0, &stale).await.unwrap());
        let fresh = MigrationRecord::new(b"k00000".to_vec(), b"new".to_vec(), 9);
        assert!(store.apply_record(0, &fresh).await.unwrap());
        assert_eq!(store.get(0, b"k00000").unwrap().value, b"new");
    }

    #[tokio::test]
    async fn test_loopback_fabric_unknown_peer() {
        let fabric = LoopbackFabric::new();
        let req = StartRequest {
            namespace: smol_str::SmolStr::new("test"),
            session: uuid::Uuid::new_v4(),
            pid: 0,
            source: 1,
            key: crate::types::ClusterKey::new(1),
            expected_records: 0,
        };
        assert!(matches!(
            fabric.send_start(99, req).await,
            Err(Error::Fabric(_))
        ));
    }
}
