//! Progress counters exposed to the external stats/ticker collaborator.
//!
//! Counters are owned by the migration engine and the balancer; everything
//! else reads them through [`StatsSnapshot`]. Relaxed ordering is sufficient
//! for monitoring-only fields, but the values themselves are exact integers
//! reflecting committed state: external readers rely on the monotonic
//! decrease of the "remaining" counters to detect convergence.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Create a counter at zero.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A settable, decrementable level value.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    /// Create a gauge at zero.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Set the gauge.
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1, saturating at zero.
    pub fn dec(&self) {
        let mut cur = self.0.load(Ordering::Relaxed);
        while cur > 0 {
            match self
                .0
                .compare_exchange_weak(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-namespace progress counters.
///
/// Field names match what the ticker logs: `migrate_tx_partitions_remaining`
/// reaching 0 on every namespace is the cluster-stable criterion.
#[derive(Debug, Default)]
pub struct NamespaceCounters {
    /// Emigrations planned by the most recent rebalance.
    pub migrate_tx_partitions_initial: Gauge,
    /// Emigrations not yet complete.
    pub migrate_tx_partitions_remaining: Gauge,
    /// Emigrations actively streaming right now.
    pub migrate_tx_partitions_active: Gauge,

    /// Immigrations expected by the most recent rebalance.
    pub migrate_rx_partitions_initial: Gauge,
    /// Immigrations not yet complete.
    pub migrate_rx_partitions_remaining: Gauge,
    /// Immigrations actively applying right now.
    pub migrate_rx_partitions_active: Gauge,

    /// Done-signals not yet delivered to peers.
    pub migrate_signals_remaining: Gauge,
    /// Done-signals currently in flight.
    pub migrate_signals_active: Gauge,

    /// Records sent to peers.
    pub migrate_records_transmitted: Counter,
    /// Records applied from peers.
    pub migrate_records_received: Counter,
    /// Records skipped on apply (receiver already had a newer copy).
    pub migrate_records_skipped: Counter,
    /// Batches resent after an ack timeout.
    pub migrate_record_retransmits: Counter,

    /// Appeals this node has raised and not yet had exonerated.
    pub appeals_tx_remaining: Gauge,
    /// Appeals this node is actively pressing.
    pub appeals_tx_active: Gauge,
    /// Appeals from peers this node is actively judging.
    pub appeals_rx_active: Gauge,

    /// Partitions with fewer live owners than the replication factor.
    pub n_unavailable_partitions: Gauge,
    /// Partitions with no live owner at all.
    pub n_dead_partitions: Gauge,
}

impl NamespaceCounters {
    /// Create a fresh counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding migrations, both directions.
    pub fn migrations_remaining(&self) -> u64 {
        self.migrate_tx_partitions_remaining.get() + self.migrate_rx_partitions_remaining.get()
    }

    /// Take a point-in-time snapshot. Callers wanting cross-field consistency
    /// take the namespace topology guard around this call.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            migrate_tx_partitions_initial: self.migrate_tx_partitions_initial.get(),
            migrate_tx_partitions_remaining: self.migrate_tx_partitions_remaining.get(),
            migrate_tx_partitions_active: self.migrate_tx_partitions_active.get(),
            migrate_rx_partitions_initial: self.migrate_rx_partitions_initial.get(),
            migrate_rx_partitions_remaining: self.migrate_rx_partitions_remaining.get(),
            migrate_rx_partitions_active: self.migrate_rx_partitions_active.get(),
            migrate_signals_remaining: self.migrate_signals_remaining.get(),
            migrate_signals_active: self.migrate_signals_active.get(),
            migrate_records_transmitted: self.migrate_records_transmitted.get(),
            migrate_records_received: self.migrate_records_received.get(),
            migrate_records_skipped: self.migrate_records_skipped.get(),
            migrate_record_retransmits: self.migrate_record_retransmits.get(),
            appeals_tx_remaining: self.appeals_tx_remaining.get(),
            appeals_tx_active: self.appeals_tx_active.get(),
            appeals_rx_active: self.appeals_rx_active.get(),
            n_unavailable_partitions: self.n_unavailable_partitions.get(),
            n_dead_partitions: self.n_dead_partitions.get(),
            pending_quiesce: false,
            effective_is_quiesced: false,
        }
    }
}

/// Point-in-time copy of [`NamespaceCounters`], plus namespace flags the
/// ticker reports alongside them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub migrate_tx_partitions_initial: u64,
    pub migrate_tx_partitions_remaining: u64,
    pub migrate_tx_partitions_active: u64,
    pub migrate_rx_partitions_initial: u64,
    pub migrate_rx_partitions_remaining: u64,
    pub migrate_rx_partitions_active: u64,
    pub migrate_signals_remaining: u64,
    pub migrate_signals_active: u64,
    pub migrate_records_transmitted: u64,
    pub migrate_records_received: u64,
    pub migrate_records_skipped: u64,
    pub migrate_record_retransmits: u64,
    pub appeals_tx_remaining: u64,
    pub appeals_tx_active: u64,
    pub appeals_rx_active: u64,
    pub n_unavailable_partitions: u64,
    pub n_dead_partitions: u64,
    /// Local node's quiesce requested but not yet applied.
    pub pending_quiesce: bool,
    /// Local node's quiesce in force for balancing.
    pub effective_is_quiesced: bool,
}

impl StatsSnapshot {
    /// Outstanding migrations, both directions.
    pub fn migrations_remaining(&self) -> u64 {
        self.migrate_tx_partitions_remaining + self.migrate_rx_partitions_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_gauge_saturating_dec() {
        let g = Gauge::new();
        g.dec();
        assert_eq!(g.get(), 0);
        g.set(2);
        g.dec();
        g.dec();
        g.dec();
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn test_snapshot_remaining() {
        let counters = NamespaceCounters::new();
        counters.migrate_tx_partitions_remaining.set(3);
        counters.migrate_rx_partitions_remaining.set(2);

        let snap = counters.snapshot();
        assert_eq!(snap.migrations_remaining(), 5);
        assert_eq!(counters.migrations_remaining(), 5);
    }
}
