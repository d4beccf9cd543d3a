//! The cluster coordinator: subscribes to the membership exchange, runs the
//! balancer once per key advance (and per `recluster`), and hands the
//! resulting diffs to the migration engine.
//!
//! The balancer runs synchronously under the namespace topology write
//! guard on whichever task observed the trigger; it never performs I/O.
//! If the cluster key advances while a balance is being computed, the
//! result is discarded and recomputation starts immediately.

use crate::balance::{balance, BalanceInput, OwnershipTable};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::migrate::{MigrationEngine, MigrationFabric, PartitionStore};
use crate::namespace::{Namespace, PartitionLifeState};
use crate::roster::{FileRosterStore, RosterPersistence, RosterRecord};
use crate::topology::{ExchangeView, ReformOutcome};
use crate::types::{ClusterKey, NodeId, PartitionId, RackId, RosterNode};
use smol_str::SmolStr;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One node's partition control plane.
#[derive(Debug)]
pub struct ClusterCoordinator {
    config: CoordinatorConfig,
    exchange: Arc<dyn ExchangeView>,
    engine: Arc<MigrationEngine>,
    fabric: Arc<dyn MigrationFabric>,
    roster_store: Arc<dyn RosterPersistence>,
    namespaces: Vec<Arc<Namespace>>,
    stay_quiesced: bool,
}

impl ClusterCoordinator {
    /// Build a coordinator: open durable state, restore staged rosters and
    /// the sticky quiesce marker, and wire up the migration engine.
    pub async fn new(
        config: CoordinatorConfig,
        exchange: Arc<dyn ExchangeView>,
        fabric: Arc<dyn MigrationFabric>,
        store: Arc<dyn PartitionStore>,
    ) -> Result<Arc<Self>> {
        let roster_store: Arc<dyn RosterPersistence> =
            Arc::new(FileRosterStore::open(&config.state_dir)?);
        Self::with_persistence(config, exchange, fabric, store, roster_store).await
    }

    /// Build with explicit roster persistence (tests inject an in-memory
    /// store here).
    pub async fn with_persistence(
        config: CoordinatorConfig,
        exchange: Arc<dyn ExchangeView>,
        fabric: Arc<dyn MigrationFabric>,
        store: Arc<dyn PartitionStore>,
        roster_store: Arc<dyn RosterPersistence>,
    ) -> Result<Arc<Self>> {
        let stay_quiesced = config.stay_quiesced || roster_store.sticky_quiesce().await?;

        let mut namespaces = Vec::with_capacity(config.namespaces.len());
        for ns_config in &config.namespaces {
            let ns = Namespace::new(ns_config.clone(), config.node_id, stay_quiesced);

            // Restore the staged roster; it stays pending until a rebalance
            // adopts it. Corruption here is fatal by policy.
            if let Some(record) = roster_store.load(ns_config.name.as_str()).await? {
                ns.topology_mut().pending_roster = record.nodes;
            }
            namespaces.push(Arc::new(ns));
        }

        let engine = Arc::new(MigrationEngine::new(
            config.node_id,
            config.migrate_threads,
            config.migrate_max_incoming,
            Arc::clone(&exchange),
            Arc::clone(&fabric),
            store,
        ));

        info!(
            node_id = format_args!("{:x}", config.node_id),
            namespaces = namespaces.len(),
            stay_quiesced,
            "coordinator initialized"
        );

        Ok(Arc::new(Self {
            config,
            exchange,
            engine,
            fabric,
            roster_store,
            namespaces,
            stay_quiesced,
        }))
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The membership exchange this coordinator consumes.
    pub fn exchange(&self) -> &Arc<dyn ExchangeView> {
        &self.exchange
    }

    /// The migration engine (receive-side handlers live here).
    pub fn engine(&self) -> &Arc<MigrationEngine> {
        &self.engine
    }

    /// Whether this node is permanently quiesced.
    pub fn stay_quiesced(&self) -> bool {
        self.stay_quiesced
    }

    /// All namespaces, in configuration order.
    pub fn namespaces(&self) -> &[Arc<Namespace>] {
        &self.namespaces
    }

    /// Look up a namespace by name.
    pub fn namespace(&self, name: &str) -> Result<&Arc<Namespace>> {
        self.namespaces
            .iter()
            .find(|ns| ns.name() == name)
            .ok_or_else(|| Error::UnknownNamespace(SmolStr::new(name)))
    }

    /// Spawn the event loop: an initial rebalance against whatever view the
    /// exchange already holds, then one rebalance per delivered advance.
    pub fn spawn_run(self: Arc<Self>) -> JoinHandle<()> {
        let this = self;
        let mut events = this.exchange.subscribe();
        tokio::spawn(async move {
            if this.exchange.cluster_key() != ClusterKey::ZERO {
                this.rebalance_all();
            }
            while let Some(view) = events.recv().await {
                debug!(key = %view.key, size = view.size(), "cluster event");
                this.rebalance_all();
            }
        })
    }

    /// Rebalance every namespace, lowest `migrate_order` first.
    pub fn rebalance_all(&self) {
        let mut order: Vec<&Arc<Namespace>> = self.namespaces.iter().collect();
        order.sort_by_key(|ns| ns.config.migrate_order);
        for ns in order {
            self.rebalance_namespace(ns);
        }
    }

    /// Run the balancer for one namespace and commit the result, retrying
    /// immediately whenever the key advances mid-computation.
    pub fn rebalance_namespace(&self, ns: &Arc<Namespace>) {
        if !ns.begin_rebalance() {
            // A revive or concurrent rebalance holds the window.
            return;
        }

        loop {
            let live = self.exchange.current();
            if live.key == ClusterKey::ZERO {
                break;
            }

            let mut topo = ns.topology_mut();
            if topo.last_balance_key == live.key {
                // This key is already balanced; quiesce and roster changes
                // wait for the next one.
                break;
            }
            ns.set_migrations_allowed(false);
            topo.apply_view(
                live.clone(),
                HashMap::from([(self.config.node_id, self.config.rack_id)]),
            );

            // Quiesce and roster changes bind here, once per rebalance.
            {
                let mut quiesce = ns.quiesce();
                quiesce.apply_at_rebalance();
                if quiesce.effective() {
                    topo.quiesced_nodes.insert(self.config.node_id);
                } else {
                    topo.quiesced_nodes.remove(&self.config.node_id);
                }
            }
            if topo.adopt_pending_roster() {
                info!(
                    namespace = %ns.config.name,
                    nodes = topo.roster.len(),
                    "pending roster adopted"
                );
            }

            let racks = topo.succession_racks();
            let previous = current_table(ns);
            let output = balance(&BalanceInput {
                key: live.key,
                succession: &topo.view.succession,
                rack_ids: &racks,
                roster: ns
                    .config
                    .strong_consistency
                    .then_some(topo.roster.as_slice()),
                replication_factor: ns.config.replication_factor,
                quiesced: &topo.quiesced_nodes,
                previous: Some(&previous),
                prefer_uniform_balance: ns.config.prefer_uniform_balance,
                partition_count: ns.config.partition_count,
            });

            if self.exchange.cluster_key() != live.key {
                // Stale before commit: discard and recompute.
                drop(topo);
                debug!(namespace = %ns.config.name, key = %live.key, "balance stale, recomputing");
                continue;
            }

            let plan = self
                .engine
                .plan_rebalance(ns, &output, &topo.view.succession);
            topo.last_balance_key = live.key;
            topo.rebalance_generation += 1;
            drop(topo);

            ns.appeals.abandon_stale(live.key);
            ns.set_migrations_allowed(true);
            Arc::clone(&self.engine).spawn_emigrations(ns, &plan);
            break;
        }

        ns.end_rebalance();
    }

    /// Ask the exchange to re-form the cluster: a new key for the unchanged
    /// succession. The subscription delivers the advance, which triggers
    /// the rebalance (and with it, pending-roster adoption).
    pub fn recluster(&self) -> ReformOutcome {
        self.exchange.reform(self.config.node_id)
    }

    /// Validate, persist, and stage a roster. Takes effect only at the next
    /// rebalance following a `recluster` — never retroactively.
    pub async fn roster_set(&self, namespace: &str, nodes: Vec<RosterNode>) -> Result<()> {
        let ns = self.namespace(namespace)?;

        self.roster_store
            .save(namespace, &RosterRecord::new(nodes.clone()))
            .await?;
        ns.topology_mut().pending_roster = nodes;

        info!(namespace, "roster staged; issue 'recluster:' to adopt");
        Ok(())
    }

    /// Set the pending quiesce flag for the local node on every namespace.
    pub fn quiesce(&self) -> Result<()> {
        if self.stay_quiesced {
            return Err(Error::Precondition("permanently quiesced".to_string()));
        }
        for ns in &self.namespaces {
            ns.quiesce().request();
        }
        info!("quiesced this node");
        Ok(())
    }

    /// Clear the pending quiesce flag. Refused while permanently quiesced.
    pub fn quiesce_undo(&self) -> bool {
        if self.stay_quiesced {
            return false;
        }
        for ns in &self.namespaces {
            ns.quiesce().undo();
        }
        info!("un-quiesced this node");
        true
    }

    /// Accept current data as authoritative for every dead or unavailable
    /// partition of a strong-consistency namespace. Fails loudly while a
    /// rebalance holds the window: reviving against a moving target is
    /// unsafe. A follow-up `recluster` makes the revival effective.
    pub fn revive_namespace(&self, ns: &Arc<Namespace>) -> Result<u64> {
        if !ns.config.strong_consistency {
            return Err(Error::StrongConsistencyOnly("revive"));
        }
        if !ns.begin_rebalance() {
            return Err(Error::Precondition(
                "recluster in progress".to_string(),
            ));
        }

        let mut revived = 0u64;
        for slot in ns.partitions() {
            let mut p = slot.lock();
            if matches!(
                p.state,
                PartitionLifeState::Dead | PartitionLifeState::Unavailable
            ) {
                p.revived = true;
                p.state = PartitionLifeState::Stable;
                revived += 1;
            }
        }
        ns.counters.n_unavailable_partitions.set(0);
        ns.counters.n_dead_partitions.set(0);
        ns.end_rebalance();

        warn!(
            namespace = %ns.config.name,
            revived,
            "revive complete - issue 'recluster:' command"
        );
        Ok(revived)
    }

    /// Record a node's rack as observed through exchange metadata.
    pub fn observe_rack(&self, namespace: &str, node: NodeId, rack: RackId) -> Result<()> {
        let ns = self.namespace(namespace)?;
        ns.topology_mut().rack_ids.insert(node, rack);
        Ok(())
    }

    /// Record a peer's effective quiesce as observed through exchange
    /// metadata. Applies at the next rebalance like any other input.
    pub fn observe_peer_quiesce(&self, namespace: &str, node: NodeId, quiesced: bool) -> Result<()> {
        let ns = self.namespace(namespace)?;
        let mut topo = ns.topology_mut();
        if quiesced {
            topo.quiesced_nodes.insert(node);
        } else {
            topo.quiesced_nodes.remove(&node);
        }
        Ok(())
    }

    /// Raise an appeal for a partition this node cannot vouch for. Owners
    /// are taken from the partition's target assignment.
    pub fn raise_appeal(&self, namespace: &str, pid: PartitionId) -> Result<()> {
        let ns = self.namespace(namespace)?;
        if !ns.config.strong_consistency {
            return Err(Error::StrongConsistencyOnly("appeal"));
        }
        let owners: Vec<NodeId> = {
            let slot = ns.partition(pid)?;
            let p = slot.lock();
            p.target
                .nodes
                .iter()
                .copied()
                .filter(|&n| n != self.config.node_id)
                .collect()
        };
        ns.appeals.raise(pid, owners, self.exchange.cluster_key());
        Ok(())
    }

    /// Press every unresolved appeal once; returns how many were
    /// exonerated.
    pub async fn press_appeals(&self, namespace: &str) -> Result<usize> {
        let ns = self.namespace(namespace)?;
        ns.appeals.press_all(&self.fabric, &self.exchange).await
    }

    /// Wait until a namespace's migrations drain under a key that holds
    /// still, or time out. The async replacement for blocking
    /// set-and-wait-for-convergence calls.
    pub async fn await_converged(
        &self,
        namespace: &str,
        timeout: std::time::Duration,
    ) -> Result<ClusterKey> {
        let ns = self.namespace(namespace)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let key = self.exchange.cluster_key();
            if key != ClusterKey::ZERO
                && ns.migrations_allowed()
                && ns.counters.migrations_remaining() == 0
                && ns.converged()
                && self.exchange.cluster_key() == key
            {
                return Ok(key);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Outstanding migrations across all namespaces.
    pub fn total_migrations_remaining(&self) -> u64 {
        self.namespaces
            .iter()
            .map(|ns| ns.counters.migrations_remaining())
            .sum()
    }

    /// Whether every namespace currently allows migrations.
    pub fn migrations_allowed(&self) -> bool {
        self.namespaces.iter().all(|ns| ns.migrations_allowed())
    }

    /// Dispatch one admin-protocol request line.
    pub async fn info(&self, line: &str) -> String {
        crate::admin::dispatch(self, line).await
    }

    /// Stop driving migrations. In-flight sessions are abandoned.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

/// Snapshot the realized ownership of a namespace as a table, the
/// "previous ownership" input that keeps balancing stable.
fn current_table(ns: &Namespace) -> OwnershipTable {
    OwnershipTable::new(
        ns.partitions()
            .iter()
            .map(|slot| slot.lock().current.clone())
            .collect(),
    )
}

/// Convenience re-export for callers matching on `recluster` outcomes.
pub use crate::topology::ReformOutcome as ReclusterOutcome;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceConfig;
    use crate::testing::{MemoryPartitionStore, MemoryRosterStore, NullFabric};
    use crate::topology::LocalExchange;

    async fn coordinator(
        exchange: Arc<LocalExchange>,
        sc: bool,
    ) -> Arc<ClusterCoordinator> {
        let config = CoordinatorConfig::new(1).with_namespace(
            NamespaceConfig::new("test")
                .with_partition_count(16)
                .with_replication_factor(2)
                .with_strong_consistency(sc),
        );
        ClusterCoordinator::with_persistence(
            config,
            exchange,
            Arc::new(NullFabric),
            Arc::new(MemoryPartitionStore::new()),
            Arc::new(MemoryRosterStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_rebalance_realizes_empty_partitions() {
        let exchange = Arc::new(LocalExchange::with_succession(vec![1, 2, 3]));
        let coord = coordinator(Arc::clone(&exchange), false).await;

        let ns = coord.namespace("test").unwrap();
        coord.rebalance_namespace(ns);

        // Fresh cluster: nothing to move, ownership realized immediately.
        assert!(ns.converged());
        assert!(ns.migrations_allowed());
        assert_eq!(ns.counters.migrations_remaining(), 0);
        for slot in ns.partitions() {
            let p = slot.lock();
            assert_eq!(p.current.nodes.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_roster_set_stages_without_rebalancing() {
        let exchange = Arc::new(LocalExchange::with_succession(vec![1, 2]));
        let coord = coordinator(Arc::clone(&exchange), true).await;
        let ns = coord.namespace("test").unwrap();
        coord.rebalance_namespace(ns);

        coord
            .roster_set("test", vec![RosterNode::new(1, 0), RosterNode::new(2, 0)])
            .await
            .unwrap();

        let topo = ns.topology();
        assert_eq!(topo.pending_roster.len(), 2);
        assert!(topo.roster.is_empty(), "roster-set must not adopt by itself");
    }

    #[tokio::test]
    async fn test_revive_requires_strong_consistency() {
        let exchange = Arc::new(LocalExchange::with_succession(vec![1]));
        let coord = coordinator(Arc::clone(&exchange), false).await;
        let ns = coord.namespace("test").unwrap();

        assert!(matches!(
            coord.revive_namespace(ns),
            Err(Error::StrongConsistencyOnly(_))
        ));
    }

    #[tokio::test]
    async fn test_revive_fails_during_rebalance_window() {
        let exchange = Arc::new(LocalExchange::with_succession(vec![1]));
        let coord = coordinator(Arc::clone(&exchange), true).await;
        let ns = coord.namespace("test").unwrap();

        assert!(ns.begin_rebalance());
        assert!(matches!(
            coord.revive_namespace(ns),
            Err(Error::Precondition(_))
        ));
        ns.end_rebalance();
    }

    #[tokio::test]
    async fn test_await_converged() {
        let exchange = Arc::new(LocalExchange::with_succession(vec![1, 2]));
        let coord = coordinator(Arc::clone(&exchange), false).await;
        let ns = coord.namespace("test").unwrap();

        // Nothing balanced yet: times out rather than blocking forever.
        let err = coord
            .await_converged("test", std::time::Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        coord.rebalance_namespace(ns);
        let key = coord
            .await_converged("test", std::time::Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(key, exchange.cluster_key());
    }

    #[tokio::test]
    async fn test_spawn_run_follows_exchange_events() {
        let exchange = Arc::new(LocalExchange::with_succession(vec![1]));
        let coord = coordinator(Arc::clone(&exchange), false).await;
        Arc::clone(&coord).spawn_run();

        exchange.advance(vec![1, 2]);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let ns = coord.namespace("test").unwrap();
        loop {
            let balanced = ns.topology().last_balance_key == exchange.cluster_key();
            if balanced && ns.converged() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "event loop never caught up with the exchange"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_quiesce_refused_when_permanently_quiesced() {
        let exchange = Arc::new(LocalExchange::with_succession(vec![1]));
        let config = CoordinatorConfig::new(1)
            .with_stay_quiesced(true)
            .with_namespace(NamespaceConfig::new("test").with_partition_count(4));
        let coord = ClusterCoordinator::with_persistence(
            config,
            exchange,
            Arc::new(NullFabric),
            Arc::new(MemoryPartitionStore::new()),
            Arc::new(MemoryRosterStore::new()),
        )
        .await
        .unwrap();

        assert!(coord.quiesce().is_err());
        assert!(!coord.quiesce_undo());
    }
}
