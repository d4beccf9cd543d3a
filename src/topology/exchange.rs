//! The membership-exchange contract consumed by the control plane.

use crate::types::{ClusterKey, NodeId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

/// One agreed membership view: the key and the succession list it was
/// agreed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// The key identifying this view.
    pub key: ClusterKey,
    /// Live node ids in agreed order.
    pub succession: Vec<NodeId>,
}

impl ClusterView {
    /// An empty pre-cluster view.
    pub fn empty() -> Self {
        Self {
            key: ClusterKey::ZERO,
            succession: Vec::new(),
        }
    }

    /// The principal node: first in the succession.
    pub fn principal(&self) -> Option<NodeId> {
        self.succession.first().copied()
    }

    /// Number of live nodes.
    pub fn size(&self) -> usize {
        self.succession.len()
    }

    /// Whether a node is in this view.
    pub fn contains(&self, node: NodeId) -> bool {
        self.succession.contains(&node)
    }
}

/// Outcome of asking the exchange to re-form the cluster (`recluster`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReformOutcome {
    /// A new key was issued for the unchanged succession.
    Reformed,
    /// This node is not the principal; the request was ignored.
    IgnoredByNonPrincipal,
    /// The exchange could not re-form (e.g. no cluster yet).
    Failed,
}

/// Read-only view of the membership exchange.
///
/// Implementations must guarantee: keys are totally ordered and change
/// exactly when the succession changes; subscribers receive every view in
/// key order with none skipped. Consumers treat any result computed for a
/// key that no longer matches [`ExchangeView::cluster_key`] as stale and
/// discard it.
pub trait ExchangeView: Send + Sync + std::fmt::Debug {
    /// The current agreed view.
    fn current(&self) -> ClusterView;

    /// The current cluster key.
    fn cluster_key(&self) -> ClusterKey {
        self.current().key
    }

    /// Number of nodes in the current succession.
    fn cluster_size(&self) -> usize {
        self.current().size()
    }

    /// Subscribe to view changes. Every key advance is delivered exactly
    /// once, in order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterView>;

    /// Request a cluster re-form on behalf of `requestor`: a new key for the
    /// unchanged succession. Honored only by the principal.
    fn reform(&self, requestor: NodeId) -> ReformOutcome;
}

/// In-process exchange used by single-process deployments and the test
/// harness. Key generation is a plain monotonic counter, which satisfies the
/// ordering contract.
#[derive(Debug)]
pub struct LocalExchange {
    inner: Mutex<LocalExchangeInner>,
}

#[derive(Debug)]
struct LocalExchangeInner {
    view: ClusterView,
    subscribers: Vec<mpsc::UnboundedSender<ClusterView>>,
}

impl LocalExchange {
    /// Create an exchange with no cluster formed yet.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LocalExchangeInner {
                view: ClusterView::empty(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Create an exchange with an initial succession already agreed.
    pub fn with_succession(succession: Vec<NodeId>) -> Self {
        let exchange = Self::new();
        exchange.advance(succession);
        exchange
    }

    /// Agree on a new succession, advancing the key. A succession identical
    /// to the current one is a no-op: the key changes exactly when
    /// membership changes.
    pub fn advance(&self, succession: Vec<NodeId>) -> ClusterKey {
        let mut inner = self.inner.lock();
        if succession == inner.view.succession && inner.view.key != ClusterKey::ZERO {
            return inner.view.key;
        }
        let key = inner.view.key.next();
        inner.view = ClusterView { key, succession };
        info!(
            cluster_key = %key,
            cluster_size = inner.view.size(),
            "cluster view advanced"
        );
        Self::notify(&mut inner);
        key
    }

    fn notify(inner: &mut LocalExchangeInner) {
        let view = inner.view.clone();
        inner
            .subscribers
            .retain(|tx| tx.send(view.clone()).is_ok());
    }
}

impl Default for LocalExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeView for LocalExchange {
    fn current(&self) -> ClusterView {
        self.inner.lock().view.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterView> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    fn reform(&self, requestor: NodeId) -> ReformOutcome {
        let mut inner = self.inner.lock();
        if inner.view.succession.is_empty() {
            return ReformOutcome::Failed;
        }
        if inner.view.principal() != Some(requestor) {
            return ReformOutcome::IgnoredByNonPrincipal;
        }
        let key = inner.view.key.next();
        inner.view.key = key;
        info!(cluster_key = %key, "cluster re-formed on request");
        Self::notify(&mut inner);
        ReformOutcome::Reformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_changes_key_only_on_membership_change() {
        let exchange = LocalExchange::new();
        let k1 = exchange.advance(vec![1, 2, 3]);
        let k2 = exchange.advance(vec![1, 2, 3]);
        assert_eq!(k1, k2);

        let k3 = exchange.advance(vec![1, 2]);
        assert!(k3 > k2);
    }

    #[tokio::test]
    async fn test_subscription_delivers_every_advance_in_order() {
        let exchange = LocalExchange::new();
        let mut rx = exchange.subscribe();

        exchange.advance(vec![1]);
        exchange.advance(vec![1, 2]);
        exchange.advance(vec![1, 2, 3]);

        let v1 = rx.recv().await.unwrap();
        let v2 = rx.recv().await.unwrap();
        let v3 = rx.recv().await.unwrap();
        assert!(v1.key < v2.key && v2.key < v3.key);
        assert_eq!(v3.succession, vec![1, 2, 3]);
    }

    #[test]
    fn test_reform_principal_only() {
        let exchange = LocalExchange::with_succession(vec![7, 8]);
        let before = exchange.cluster_key();

        assert_eq!(exchange.reform(8), ReformOutcome::IgnoredByNonPrincipal);
        assert_eq!(exchange.cluster_key(), before);

        assert_eq!(exchange.reform(7), ReformOutcome::Reformed);
        assert!(exchange.cluster_key() > before);
        assert_eq!(exchange.current().succession, vec![7, 8]);
    }

    #[test]
    fn test_reform_without_cluster_fails() {
        let exchange = LocalExchange::new();
        assert_eq!(exchange.reform(1), ReformOutcome::Failed);
    }
}
