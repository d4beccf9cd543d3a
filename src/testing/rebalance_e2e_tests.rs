//! End-to-end rebalance scenarios.
//!
//! Each test wires real coordinators onto one exchange and one loopback
//! fabric and drives membership changes the way an operator or the
//! agreement protocol would, then asserts on convergence, counter
//! behavior, and the admin-protocol responses.

#[cfg(test)]
mod tests {
    use crate::config::NamespaceConfig;
    use crate::namespace::PartitionLifeState;
    use crate::testing::TestCluster;
    use crate::topology::ExchangeView;
    use crate::types::NodeId;
    use std::time::Duration;

    const A: NodeId = 0xa;
    const B: NodeId = 0xb;
    const C: NodeId = 0xc;

    const RECORDS_PER_PARTITION: usize = 20;

    fn ap_namespace() -> NamespaceConfig {
        NamespaceConfig::new("test")
            .with_partition_count(32)
            .with_replication_factor(2)
            .with_batch_size(8)
    }

    /// Seed every node's store with records for the partitions it owns.
    fn seed_owned_partitions(cluster: &TestCluster) {
        for node in &cluster.nodes {
            let ns = node.coordinator.namespace("test").unwrap();
            for slot in ns.partitions() {
                let p = slot.lock();
                if p.current.contains(node.id) {
                    node.store.populate(p.id, RECORDS_PER_PARTITION);
                }
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_node_removal_migrates_and_cluster_stable_fences() {
        let mut ns = ap_namespace();
        ns.migrate_fill_delay = Duration::from_millis(200);
        ns.migrate_lead_threshold = 0;
        let cluster = TestCluster::new(&[A, B, C], ns).await;

        cluster.advance(vec![A, B, C]);
        cluster.settle(Duration::from_secs(5)).await;
        seed_owned_partitions(&cluster);

        // Remember who owned what before the change.
        let before: Vec<Vec<NodeId>> = {
            let ns = cluster.node(A).coordinator.namespace("test").unwrap();
            ns.partitions()
                .iter()
                .map(|slot| slot.lock().current.nodes.clone())
                .collect()
        };

        // Node C leaves the succession (roster untouched).
        cluster.advance(vec![A, B]);

        assert!(
            cluster.total_remaining() > 0,
            "losing an owner must plan transfers"
        );
        assert_eq!(
            cluster.info(A, "cluster-stable:").await,
            "ERROR::unstable-cluster",
            "cluster-stable must fence on outstanding migrations"
        );

        cluster.settle(Duration::from_secs(5)).await;

        let key = cluster.exchange.cluster_key();
        assert_eq!(cluster.info(A, "cluster-stable:").await, format!("{:x}", key));

        // Every partition is again fully replicated on the survivors, and
        // partitions C never owned kept their exact owner set.
        let ns = cluster.node(A).coordinator.namespace("test").unwrap();
        for (slot, old) in ns.partitions().iter().zip(&before) {
            let p = slot.lock();
            assert_eq!(p.current.nodes.len(), 2);
            assert!(!p.current.contains(C));
            if !old.contains(&C) {
                assert_eq!(&p.current.nodes, old, "partition {} moved without cause", p.id);
            }
        }

        // Data followed ownership: a partition that gained node B now has
        // B holding every record.
        let moved: Vec<u32> = ns
            .partitions()
            .iter()
            .zip(&before)
            .filter(|(slot, old)| {
                let p = slot.lock();
                old.contains(&C) && p.current.contains(B) && !old.contains(&B)
            })
            .map(|(slot, _)| slot.lock().id)
            .collect();
        assert!(!moved.is_empty());
        for pid in moved {
            assert_eq!(
                cluster.node(B).store.count(pid),
                RECORDS_PER_PARTITION as u64,
                "partition {} records did not reach node B",
                pid
            );
        }
    }

    #[tokio::test]
    async fn test_roster_set_with_absent_node_marks_unavailable() {
        let ns_config = NamespaceConfig::new("test")
            .with_partition_count(16)
            .with_replication_factor(3)
            .with_strong_consistency(true);
        let cluster = TestCluster::new(&[A, B], ns_config).await;

        cluster.advance(vec![A, B]);

        // Stage and adopt a roster of the two live nodes.
        assert_eq!(
            cluster
                .info(A, "roster-set:namespace=test;nodes=a,b")
                .await,
            "ok"
        );
        assert_eq!(cluster.recluster_from(A).await, "ok");
        cluster.settle(Duration::from_secs(5)).await;

        // Roster a third node that has not joined; the rebalance must not
        // fail — the missing replica slot is flagged instead.
        assert_eq!(
            cluster
                .info(A, "roster-set:namespace=test;nodes=a,b,c:1")
                .await,
            "ok"
        );
        assert_eq!(cluster.recluster_from(A).await, "ok");
        cluster.settle(Duration::from_secs(5)).await;

        let ns = cluster.node(A).coordinator.namespace("test").unwrap();
        assert_eq!(ns.counters.n_unavailable_partitions.get(), 16);
        assert_eq!(ns.counters.n_dead_partitions.get(), 0);
        for slot in ns.partitions() {
            let p = slot.lock();
            assert_eq!(p.current.nodes.len(), 2);
            assert_eq!(p.current.missing_replicas, 1);
            assert!(!p.current.contains(C));
        }

        // The adopted roster is visible, rack pin included.
        let roster = cluster.info(A, "roster:namespace=test").await;
        assert!(roster.starts_with("roster=a,b,c:1:pending_roster=a,b,c:1:"), "{}", roster);

        // An unavailable namespace is not stable.
        assert_eq!(
            cluster.info(A, "cluster-stable:namespace=test").await,
            "ERROR::unstable-cluster"
        );
    }

    #[tokio::test]
    async fn test_revive_refused_mid_recluster_then_succeeds() {
        let ns_config = NamespaceConfig::new("test")
            .with_partition_count(8)
            .with_replication_factor(2)
            .with_strong_consistency(true);
        let cluster = TestCluster::new(&[A, B], ns_config).await;

        cluster.advance(vec![A, B]);
        cluster.settle(Duration::from_secs(5)).await;

        // Hold the rebalance window the way an in-flight recluster would.
        let ns = cluster.node(A).coordinator.namespace("test").unwrap();
        assert!(ns.begin_rebalance());
        assert_eq!(
            cluster.info(A, "revive:namespace=test").await,
            "ERROR::failed-revive"
        );
        ns.end_rebalance();

        assert_eq!(cluster.info(A, "revive:namespace=test").await, "ok");
        assert_eq!(
            cluster.info(A, "revive:namespace=nope").await,
            "ERROR::unknown-namespace"
        );
    }

    #[tokio::test]
    async fn test_quiesce_reassigns_masters_keeps_replica_count() {
        let cluster = TestCluster::new(&[A, B, C], ap_namespace()).await;
        cluster.advance(vec![A, B, C]);
        cluster.settle(Duration::from_secs(5)).await;

        assert_eq!(cluster.info(A, "quiesce:").await, "ok");
        // The other nodes learn of A's quiesce through exchange metadata.
        for &node in &[B, C] {
            cluster
                .node(node)
                .coordinator
                .observe_peer_quiesce("test", A, true)
                .unwrap();
        }
        assert_eq!(cluster.recluster_from(A).await, "ok");
        cluster.settle(Duration::from_secs(5)).await;

        let ns = cluster.node(B).coordinator.namespace("test").unwrap();
        let mut quiesced_still_owns = false;
        for slot in ns.partitions() {
            let p = slot.lock();
            assert_eq!(p.current.nodes.len(), 2, "replica count must not change");
            assert_ne!(p.current.master(), Some(A), "quiesced node must not be master");
            quiesced_still_owns |= p.current.contains(A);
        }
        assert!(quiesced_still_owns, "quiesce must not shed replicas");

        // Undo follows the same deferred path.
        assert_eq!(cluster.info(A, "quiesce-undo:").await, "ok");
    }

    #[tokio::test]
    async fn test_sessions_planned_under_old_key_never_commit() {
        let mut ns_config = NamespaceConfig::new("test")
            .with_partition_count(8)
            .with_replication_factor(1)
            .with_batch_size(4);
        ns_config.migrate_fill_delay = Duration::from_millis(300);
        ns_config.migrate_lead_threshold = 0;
        let cluster = TestCluster::new(&[A, B], ns_config).await;

        cluster.advance(vec![A]);
        cluster.settle(Duration::from_secs(5)).await;
        for pid in 0..8 {
            cluster.node(A).store.populate(pid, RECORDS_PER_PARTITION);
        }

        // B joins: transfers toward B are planned but held by the fill
        // delay. Before any record moves, B is gone again.
        cluster.advance(vec![A, B]);
        cluster.advance(vec![A]);
        cluster.settle(Duration::from_secs(5)).await;

        // The sessions planned for the dead view were abandoned, never
        // committed: nothing landed on B.
        for pid in 0..8 {
            assert_eq!(cluster.node(B).store.count(pid), 0);
        }
        let ns = cluster.node(A).coordinator.namespace("test").unwrap();
        for slot in ns.partitions() {
            let p = slot.lock();
            assert_eq!(p.current.nodes, vec![A]);
            assert_eq!(p.state, PartitionLifeState::Stable);
        }
    }

    #[tokio::test]
    async fn test_appeal_blocks_stability_until_exonerated() {
        let ns_config = NamespaceConfig::new("test")
            .with_partition_count(8)
            .with_replication_factor(2)
            .with_strong_consistency(true);
        let cluster = TestCluster::new(&[A, B], ns_config).await;

        cluster.advance(vec![A, B]);
        cluster.settle(Duration::from_secs(5)).await;

        // B doubts its copy of partition 0.
        cluster
            .node(B)
            .coordinator
            .raise_appeal("test", 0)
            .unwrap();
        assert_eq!(
            cluster.info(B, "cluster-stable:namespace=test").await,
            "ERROR::unstable-cluster"
        );

        // A holds partition 0 stable and vouches for B.
        let exonerated = cluster
            .node(B)
            .coordinator
            .press_appeals("test")
            .await
            .unwrap();
        assert_eq!(exonerated, 1);

        let key = cluster.exchange.cluster_key();
        assert_eq!(
            cluster.info(B, "cluster-stable:namespace=test").await,
            format!("{:x}", key)
        );
    }

    #[tokio::test]
    async fn test_cluster_stable_parameters() {
        let cluster = TestCluster::new(&[A, B, C], ap_namespace()).await;
        cluster.advance(vec![A, B, C]);
        cluster.settle(Duration::from_secs(5)).await;

        let key = cluster.exchange.cluster_key();
        assert_eq!(
            cluster.info(A, "cluster-stable:size=3").await,
            format!("{:x}", key)
        );
        assert_eq!(
            cluster.info(A, "cluster-stable:size=2").await,
            "ERROR::cluster-not-specified-size"
        );
        assert_eq!(
            cluster.info(A, "cluster-stable:size=abc").await,
            "ERROR::bad-size"
        );
        assert_eq!(
            cluster.info(A, "cluster-stable:ignore-migrations=maybe").await,
            "ERROR::bad-ignore-migrations"
        );
        assert_eq!(
            cluster.info(A, "cluster-stable:namespace=nope").await,
            "ERROR::unknown-namespace"
        );
        assert_eq!(
            cluster
                .info(A, "cluster-stable:size=3;ignore-migrations=true;namespace=test")
                .await,
            format!("{:x}", key)
        );
    }

    #[tokio::test]
    async fn test_roster_racks_and_succession_info() {
        let ns_config = NamespaceConfig::new("test")
            .with_partition_count(8)
            .with_replication_factor(2)
            .with_strong_consistency(true);
        let cluster = TestCluster::with_racks(&[(A, 1), (B, 2)], ns_config).await;

        // Each node learns the other's rack through exchange metadata.
        for node in &cluster.nodes {
            node.coordinator.observe_rack("test", A, 1).unwrap();
            node.coordinator.observe_rack("test", B, 2).unwrap();
        }
        cluster.advance(vec![A, B]);
        cluster
            .info(A, "roster-set:namespace=test;nodes=a:1,b:2")
            .await;
        assert_eq!(cluster.recluster_from(A).await, "ok");
        cluster.settle(Duration::from_secs(5)).await;

        let roster = cluster.info(A, "roster:namespace=test").await;
        assert_eq!(
            roster,
            "roster=a:1,b:2:pending_roster=a:1,b:2:observed_nodes=a:1,b:2"
        );

        let racks = cluster.info(A, "racks:namespace=test").await;
        assert_eq!(racks, "rack_1=a:rack_2=b:roster_rack_1=a:roster_rack_2=b");

        assert_eq!(cluster.info(B, "get-sl:").await, "a,b");
        assert_eq!(
            cluster.info(B, "recluster:").await,
            "ignored-by-non-principal"
        );
        assert_eq!(cluster.info(A, "bogus:").await, "ERROR::unknown-command");
    }
}
