//! Appeals: the strong-consistency safety net.
//!
//! A replica that cannot prove it holds every committed write for a
//! partition raises an appeal to the partition's other owners. Owners that
//! can vouch for it exonerate the appeal; until then the partition stays
//! flagged unavailable for client traffic even though its nodes are up.
//! Appeals are fenced like every other long-running operation: an appeal
//! raised under one cluster key is abandoned when the key advances, and a
//! fresh one is raised against the new view if still warranted.

use crate::error::Result;
use crate::metrics::NamespaceCounters;
use crate::migrate::{AppealRequest, AppealVerdict, MigrationFabric};
use crate::topology::ExchangeView;
use crate::types::{ClusterKey, NodeId, PartitionId};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One outstanding appeal.
#[derive(Debug, Clone)]
pub struct Appeal {
    /// Partition in doubt.
    pub pid: PartitionId,
    /// Cluster key the appeal was raised under.
    pub raised_under: ClusterKey,
    /// Owners able to judge the appeal, in preference order.
    pub owners: Vec<NodeId>,
}

/// Per-namespace appeal bookkeeping, counters included.
#[derive(Debug)]
pub struct AppealRegistry {
    namespace: SmolStr,
    node_id: NodeId,
    appeals: Mutex<HashMap<PartitionId, Appeal>>,
    counters: Arc<NamespaceCounters>,
}

impl AppealRegistry {
    /// Create an empty registry sharing the namespace counter set.
    pub fn new(namespace: SmolStr, node_id: NodeId, counters: Arc<NamespaceCounters>) -> Self {
        Self {
            namespace,
            node_id,
            appeals: Mutex::new(HashMap::new()),
            counters,
        }
    }

    /// Raise an appeal for a partition. A second raise for the same
    /// partition under the same key is a no-op.
    pub fn raise(&self, pid: PartitionId, owners: Vec<NodeId>, key: ClusterKey) {
        let mut appeals = self.appeals.lock();
        if appeals.contains_key(&pid) {
            return;
        }
        appeals.insert(
            pid,
            Appeal {
                pid,
                raised_under: key,
                owners,
            },
        );
        self.counters.appeals_tx_remaining.inc();
        info!(namespace = %self.namespace, pid, key = %key, "appeal raised");
    }

    /// Mark one appeal exonerated and drop it.
    pub fn exonerate(&self, pid: PartitionId) -> bool {
        let removed = self.appeals.lock().remove(&pid).is_some();
        if removed {
            self.counters.appeals_tx_remaining.dec();
            info!(namespace = %self.namespace, pid, "appeal exonerated");
        }
        removed
    }

    /// Drop every appeal raised under a key other than `live`. Cluster
    /// state changed; unresolved doubt is re-evaluated against the new view.
    pub fn abandon_stale(&self, live: ClusterKey) -> usize {
        let mut appeals = self.appeals.lock();
        let before = appeals.len();
        appeals.retain(|_, a| a.raised_under == live);
        let dropped = before - appeals.len();
        for _ in 0..dropped {
            self.counters.appeals_tx_remaining.dec();
        }
        if dropped > 0 {
            debug!(namespace = %self.namespace, dropped, "stale appeals abandoned");
        }
        dropped
    }

    /// Number of unresolved appeals.
    pub fn unresolved(&self) -> usize {
        self.appeals.lock().len()
    }

    /// Whether a partition has an outstanding appeal.
    pub fn has_appeal(&self, pid: PartitionId) -> bool {
        self.appeals.lock().contains_key(&pid)
    }

    /// Press every unresolved appeal once: ask each appeal's owners, in
    /// order, until one exonerates or all retain. Fenced per appeal; stale
    /// appeals are abandoned instead of pressed.
    pub async fn press_all(
        &self,
        fabric: &Arc<dyn MigrationFabric>,
        exchange: &Arc<dyn ExchangeView>,
    ) -> Result<usize> {
        let pending: Vec<Appeal> = self.appeals.lock().values().cloned().collect();
        let mut exonerated = 0;

        for appeal in pending {
            let live = exchange.cluster_key();
            if appeal.raised_under != live {
                self.abandon_stale(live);
                continue;
            }

            self.counters.appeals_tx_active.inc();
            let verdict = self.press_one(&appeal, fabric).await;
            self.counters.appeals_tx_active.dec();

            // Re-check before committing the verdict; a verdict formed for
            // a dead view is no verdict at all.
            if exchange.cluster_key() != live {
                continue;
            }

            if matches!(verdict, Some(AppealVerdict::Exonerated)) {
                self.exonerate(appeal.pid);
                exonerated += 1;
            }
        }

        Ok(exonerated)
    }

    async fn press_one(
        &self,
        appeal: &Appeal,
        fabric: &Arc<dyn MigrationFabric>,
    ) -> Option<AppealVerdict> {
        let req = AppealRequest {
            namespace: self.namespace.clone(),
            pid: appeal.pid,
            from: self.node_id,
            key: appeal.raised_under,
        };

        for &owner in &appeal.owners {
            match fabric.send_appeal(owner, req.clone()).await {
                Ok(AppealVerdict::Exonerated) => return Some(AppealVerdict::Exonerated),
                Ok(AppealVerdict::Retained) => continue,
                Err(e) => {
                    warn!(
                        namespace = %self.namespace,
                        pid = appeal.pid,
                        owner = format_args!("{:x}", owner),
                        error = %e,
                        "appeal press failed"
                    );
                }
            }
        }
        Some(AppealVerdict::Retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AppealRegistry {
        AppealRegistry::new(SmolStr::new("test"), 1, Arc::new(NamespaceCounters::new()))
    }

    #[test]
    fn test_raise_and_exonerate() {
        let reg = registry();
        reg.raise(3, vec![1, 2], ClusterKey::new(1));
        reg.raise(3, vec![1, 2], ClusterKey::new(1)); // duplicate, no-op

        assert_eq!(reg.unresolved(), 1);
        assert_eq!(reg.counters.appeals_tx_remaining.get(), 1);
        assert!(reg.has_appeal(3));

        assert!(reg.exonerate(3));
        assert!(!reg.exonerate(3));
        assert_eq!(reg.unresolved(), 0);
        assert_eq!(reg.counters.appeals_tx_remaining.get(), 0);
    }

    #[test]
    fn test_abandon_stale() {
        let reg = registry();
        reg.raise(1, vec![9], ClusterKey::new(1));
        reg.raise(2, vec![9], ClusterKey::new(2));

        assert_eq!(reg.abandon_stale(ClusterKey::new(2)), 1);
        assert!(!reg.has_appeal(1));
        assert!(reg.has_appeal(2));
        assert_eq!(reg.counters.appeals_tx_remaining.get(), 1);
    }
}
