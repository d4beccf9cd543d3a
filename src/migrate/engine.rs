//! The migration engine: diffs target ownership against reality and drives
//! the minimal set of record transfers to close the gap.
//!
//! Emigrations run on a bounded tokio worker pool; the balancer never waits
//! on them. Every commit point — activating a session, applying a batch,
//! honoring a done-signal, decrementing a remaining-counter — first checks
//! the live cluster key against the key the session was planned under, and
//! abandons the session on mismatch. Abandonment is never rolled back
//! destructively: the next plan owns the partition's future.

use crate::balance::BalanceOutput;
use crate::error::{Error, Result};
use crate::migrate::fabric::{
    AppealRequest, AppealVerdict, BatchAck, DoneNotice, MigrationFabric, PartitionStore,
    StartRequest, StartResponse,
};
use crate::migrate::session::{Direction, MigrationSession, SessionState};
use crate::migrate::transfer::TransferBatch;
use crate::namespace::{Namespace, Partition, PartitionLifeState};
use crate::topology::ExchangeView;
use crate::types::{ClusterKey, NodeId, PartitionId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry delay after a receiver answers `Eagain`.
const EAGAIN_RETRY: Duration = Duration::from_millis(50);

/// The sessions one rebalance planned on this node.
#[derive(Debug)]
pub struct RebalancePlan {
    /// Key the plan was made under.
    pub key: ClusterKey,
    /// Outbound sessions this node will drive.
    pub emigrations: Vec<Arc<MigrationSession>>,
    /// Inbound transfers this node expects.
    pub immigrations_expected: u64,
    /// Small enough incoming set to skip the fill delay and lead with
    /// replication before full handoff.
    pub lead: bool,
}

/// Drives migrations for every namespace on one node.
#[derive(Debug)]
pub struct MigrationEngine {
    node_id: NodeId,
    exchange: Arc<dyn ExchangeView>,
    fabric: Arc<dyn MigrationFabric>,
    store: Arc<dyn PartitionStore>,
    tx_permits: Arc<Semaphore>,
    incoming_active: AtomicUsize,
    max_incoming: usize,
    cancel: CancellationToken,
}

impl MigrationEngine {
    /// Create an engine with `migrate_threads` outbound worker permits and
    /// an inbound cap of `max_incoming` concurrent immigrations.
    pub fn new(
        node_id: NodeId,
        migrate_threads: usize,
        max_incoming: usize,
        exchange: Arc<dyn ExchangeView>,
        fabric: Arc<dyn MigrationFabric>,
        store: Arc<dyn PartitionStore>,
    ) -> Self {
        Self {
            node_id,
            exchange,
            fabric,
            store,
            tx_permits: Arc::new(Semaphore::new(migrate_threads.max(1))),
            incoming_active: AtomicUsize::new(0),
            max_incoming: max_incoming.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop all in-flight work. Sessions are abandoned, not rolled back.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Inbound immigrations currently admitted.
    pub fn incoming_active(&self) -> usize {
        self.incoming_active.load(Ordering::Acquire)
    }

    /// Diff the balance output against current ownership and install
    /// sessions into the partition slots. Called under the namespace
    /// topology write guard, with `output.key` verified live by the caller.
    ///
    /// Sessions left over from an older key are aborted here; their worker
    /// tasks observe the abort at their next fence check.
    pub fn plan_rebalance(
        &self,
        ns: &Namespace,
        output: &BalanceOutput,
        succession: &[NodeId],
    ) -> RebalancePlan {
        self.abort_stale_sessions(ns, output.key);

        let mut emigrations: Vec<Arc<MigrationSession>> = Vec::new();
        let mut immigrations_expected = 0u64;

        for pid in 0..ns.config.partition_count {
            let Some(target) = output.table.get(pid) else {
                continue;
            };
            let Ok(slot) = ns.partition(pid) else {
                continue;
            };
            let mut p = slot.lock();
            p.target = target.clone();
            p.revived = false;
            p.emigrations.clear();
            p.immigration = None;
            p.awaiting_immigration = false;

            let receivers: Vec<NodeId> = target
                .nodes
                .iter()
                .copied()
                .filter(|n| !p.current.contains(*n))
                .collect();

            // Donor: the first current owner still alive, master first.
            // No donor or no receiver means no data can or needs to move.
            let donor = donor_of(&p, succession);

            if receivers.is_empty() || donor.is_none() {
                p.current = target.clone();
                p.state = Partition::state_of(&p.current);
                continue;
            }

            let donor = donor.unwrap_or_default();
            let mut involved = false;

            if donor == self.node_id {
                for &peer in &receivers {
                    let session = Arc::new(MigrationSession::new(
                        ns.config.name.clone(),
                        pid,
                        peer,
                        Direction::Emigrate,
                        output.key,
                    ));
                    p.emigrations.push(Arc::clone(&session));
                    emigrations.push(session);
                }
                involved = true;
            }

            if receivers.contains(&self.node_id) {
                p.awaiting_immigration = true;
                immigrations_expected += 1;
                involved = true;
            }

            if involved {
                p.state = PartitionLifeState::Migrating;
            } else {
                // Other nodes move this partition's data; from here it is
                // pure bookkeeping.
                p.current = target.clone();
                p.state = Partition::state_of(&p.current);
            }
        }

        let tx = emigrations.len() as u64;
        let counters = &ns.counters;
        counters.migrate_tx_partitions_initial.set(tx);
        counters.migrate_tx_partitions_remaining.set(tx);
        counters.migrate_tx_partitions_active.set(0);
        counters.migrate_rx_partitions_initial.set(immigrations_expected);
        counters
            .migrate_rx_partitions_remaining
            .set(immigrations_expected);
        counters.migrate_rx_partitions_active.set(0);
        counters.migrate_signals_remaining.set(tx);
        counters.migrate_signals_active.set(0);
        counters.n_unavailable_partitions.set(output.n_unavailable);
        counters.n_dead_partitions.set(output.n_dead);

        let lead = tx + immigrations_expected <= ns.config.migrate_lead_threshold as u64;

        info!(
            namespace = %ns.config.name,
            key = %output.key,
            emigrations = tx,
            immigrations = immigrations_expected,
            lead,
            "rebalance planned"
        );

        RebalancePlan {
            key: output.key,
            emigrations,
            immigrations_expected,
            lead,
        }
    }

    /// Abort every non-terminal session planned under a key other than
    /// `live`. Active immigration admissions are released here; emigration
    /// workers release their own accounting when they observe the abort.
    fn abort_stale_sessions(&self, ns: &Namespace, live: ClusterKey) {
        for slot in ns.partitions() {
            let mut p = slot.lock();
            for s in &p.emigrations {
                if s.planned_key != live {
                    s.abort();
                }
            }
            if let Some(rx) = &p.immigration {
                if rx.planned_key != live {
                    if rx.abort() == Some(SessionState::Active) {
                        ns.counters.migrate_rx_partitions_active.dec();
                        self.end_incoming();
                    }
                }
            }
            if p.awaiting_immigration {
                p.awaiting_immigration = false;
            }
        }
    }

    /// Launch worker tasks for a plan's emigrations, lowest partition
    /// first. Cross-namespace drain order is the caller's concern (it
    /// plans namespaces in `migrate_order`).
    pub fn spawn_emigrations(self: Arc<Self>, ns: &Arc<Namespace>, plan: &RebalancePlan) {
        let fill_delay = if plan.lead {
            Duration::ZERO
        } else {
            ns.config.migrate_fill_delay
        };

        let mut sessions = plan.emigrations.clone();
        sessions.sort_by_key(|s| s.pid);

        for session in sessions {
            let engine = Arc::clone(&self);
            let ns = Arc::clone(ns);
            tokio::spawn(async move {
                engine.run_emigration(ns, session, fill_delay).await;
            });
        }
    }

    /// One emigration worker: fill delay, permit, handshake, stream, done.
    async fn run_emigration(
        &self,
        ns: Arc<Namespace>,
        session: Arc<MigrationSession>,
        fill_delay: Duration,
    ) {
        if !fill_delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(fill_delay) => {}
            }
        }

        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return,
            permit = self.tx_permits.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        if session.fence(self.exchange.cluster_key()).is_err() {
            session.abort();
            return;
        }
        if !session.try_activate() {
            // A newer plan aborted this session before it ever ran.
            return;
        }
        ns.counters.migrate_tx_partitions_active.inc();

        match self.stream_partition(&ns, &session).await {
            Ok(()) => {
                ns.counters.migrate_tx_partitions_active.dec();
                if session.complete() {
                    ns.counters.migrate_tx_partitions_remaining.dec();
                    let _ = ns.finalize_partition(session.pid);
                    debug!(
                        namespace = %ns.config.name,
                        pid = session.pid,
                        peer = format_args!("{:x}", session.peer),
                        records = session.records_transmitted.load(Ordering::Relaxed),
                        elapsed_ms = session.elapsed().as_millis() as u64,
                        "emigration complete"
                    );
                }
            }
            Err(e) => {
                ns.counters.migrate_tx_partitions_active.dec();
                session.abort();
                match e {
                    Error::StaleKey { .. } | Error::Shutdown => {
                        debug!(
                            namespace = %ns.config.name,
                            pid = session.pid,
                            "emigration abandoned: {}", e
                        );
                    }
                    e => {
                        warn!(
                            namespace = %ns.config.name,
                            pid = session.pid,
                            peer = format_args!("{:x}", session.peer),
                            "emigration failed: {}", e
                        );
                    }
                }
            }
        }
    }

    async fn stream_partition(
        &self,
        ns: &Arc<Namespace>,
        session: &Arc<MigrationSession>,
    ) -> Result<()> {
        let counters = &ns.counters;
        let expected_records = self
            .store
            .record_count(session.pid)
            .await
            .unwrap_or_default();

        // Handshake: the receiver may be at capacity or not yet re-planned;
        // that is backpressure, not failure.
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Shutdown);
            }
            session.fence(self.exchange.cluster_key())?;

            let req = StartRequest {
                namespace: ns.config.name.clone(),
                session: session.id,
                pid: session.pid,
                source: self.node_id,
                key: session.planned_key,
                expected_records,
            };
            match self.fabric.send_start(session.peer, req).await {
                Ok(StartResponse::Ok) => break,
                Ok(StartResponse::Eagain) => {
                    tokio::time::sleep(EAGAIN_RETRY).await;
                }
                Err(e) => {
                    warn!(
                        pid = session.pid,
                        peer = format_args!("{:x}", session.peer),
                        "migration start failed, retrying: {}", e
                    );
                    tokio::time::sleep(EAGAIN_RETRY).await;
                }
            }
        }

        // Stream the partition in batches, retransmitting until each one is
        // acknowledged or the key advances.
        let mut cursor: Option<Vec<u8>> = None;
        let mut sequence = 0u64;
        loop {
            session.fence(self.exchange.cluster_key())?;

            let (records, next) = self
                .store
                .read_batch(session.pid, cursor, ns.config.migrate_batch_size)
                .await?;
            sequence += 1;
            let is_final = next.is_none();
            let sent = records.len() as u64;

            let batch = TransferBatch {
                session: session.id,
                namespace: ns.config.name.clone(),
                pid: session.pid,
                key: session.planned_key,
                sequence,
                records,
                is_final,
            };
            let payload = batch.encode()?;

            loop {
                session.fence(self.exchange.cluster_key())?;
                if self.cancel.is_cancelled() {
                    return Err(Error::Shutdown);
                }
                match timeout(
                    ns.config.migrate_retransmit_interval,
                    self.fabric.send_batch(session.peer, payload.clone()),
                )
                .await
                {
                    Ok(Ok(BatchAck { sequence: acked, .. })) if acked == sequence => break,
                    Ok(Ok(_)) => {
                        // Ack for an older retransmit; wait for ours.
                        continue;
                    }
                    Ok(Err(e)) => {
                        session.retransmits.fetch_add(1, Ordering::Relaxed);
                        counters.migrate_record_retransmits.inc();
                        debug!(pid = session.pid, "batch send failed, retransmitting: {}", e);
                        tokio::time::sleep(EAGAIN_RETRY).await;
                    }
                    Err(_) => {
                        session.retransmits.fetch_add(1, Ordering::Relaxed);
                        counters.migrate_record_retransmits.inc();
                    }
                }
            }

            session
                .records_transmitted
                .fetch_add(sent, Ordering::Relaxed);
            counters.migrate_records_transmitted.inc_by(sent);

            if !ns.config.migrate_sleep.is_zero() {
                tokio::time::sleep(ns.config.migrate_sleep).await;
            }

            cursor = next;
            if is_final {
                break;
            }
        }

        // Completion signal; the last fenced side effect of the session.
        session.fence(self.exchange.cluster_key())?;
        let notice = DoneNotice {
            namespace: ns.config.name.clone(),
            session: session.id,
            pid: session.pid,
            key: session.planned_key,
        };
        counters.migrate_signals_active.inc();
        let result = self.fabric.send_done(session.peer, notice).await;
        counters.migrate_signals_active.dec();
        result?;
        counters.migrate_signals_remaining.dec();
        Ok(())
    }

    /// Receive side of the handshake. `Eagain` whenever the sender's key
    /// does not match the live key, this node has not planned the rebalance
    /// yet, or the inbound cap is reached — the sender retries.
    pub fn handle_start(&self, ns: &Namespace, req: &StartRequest) -> Result<StartResponse> {
        if req.key != self.exchange.cluster_key() {
            return Ok(StartResponse::Eagain);
        }
        let slot = ns.partition(req.pid)?;
        let mut p = slot.lock();

        if let Some(existing) = &p.immigration {
            if existing.id == req.session && !existing.state().is_terminal() {
                // Duplicate start from a retransmitting sender.
                return Ok(StartResponse::Ok);
            }
        }
        if !p.awaiting_immigration {
            return Ok(StartResponse::Eagain);
        }
        if !self.try_begin_incoming() {
            return Ok(StartResponse::Eagain);
        }

        let session = Arc::new(MigrationSession::with_id(
            req.session,
            ns.config.name.clone(),
            req.pid,
            req.source,
            Direction::Immigrate,
            req.key,
        ));
        session.try_activate();
        p.immigration = Some(session);
        p.awaiting_immigration = false;
        ns.counters.migrate_rx_partitions_active.inc();

        debug!(
            namespace = %ns.config.name,
            pid = req.pid,
            source = format_args!("{:x}", req.source),
            expected = req.expected_records,
            "immigration admitted"
        );
        Ok(StartResponse::Ok)
    }

    /// Apply one inbound batch. Duplicate batches are re-acknowledged
    /// without applying; stale-key batches are refused before any record is
    /// written as authoritative.
    pub async fn handle_batch(&self, ns: &Namespace, payload: &[u8]) -> Result<BatchAck> {
        let batch = TransferBatch::decode(payload)?;
        let session = self.immigration_session(ns, batch.pid, batch.session)?;

        session.fence(self.exchange.cluster_key())?;

        let ack = BatchAck {
            session: session.id,
            sequence: batch.sequence,
        };

        if batch.sequence <= session.last_sequence.load(Ordering::Acquire) {
            return Ok(ack);
        }

        let mut received = 0u64;
        let mut skipped = 0u64;
        for record in &batch.records {
            if self.store.apply_record(batch.pid, record).await? {
                received += 1;
            } else {
                skipped += 1;
            }
        }
        session.last_sequence.store(batch.sequence, Ordering::Release);
        session.records_received.fetch_add(received, Ordering::Relaxed);
        session.records_skipped.fetch_add(skipped, Ordering::Relaxed);
        ns.counters.migrate_records_received.inc_by(received);
        ns.counters.migrate_records_skipped.inc_by(skipped);

        Ok(ack)
    }

    /// Honor a sender's completion signal: the immigration is done and the
    /// partition may realize its target.
    pub fn handle_done(&self, ns: &Namespace, notice: &DoneNotice) -> Result<()> {
        let session = self.immigration_session(ns, notice.pid, notice.session)?;
        session.fence(self.exchange.cluster_key())?;

        if session.complete() {
            ns.counters.migrate_rx_partitions_active.dec();
            ns.counters.migrate_rx_partitions_remaining.dec();
            self.end_incoming();
            let _ = ns.finalize_partition(notice.pid);
            debug!(
                namespace = %ns.config.name,
                pid = notice.pid,
                records = session.records_received.load(Ordering::Relaxed),
                "immigration complete"
            );
        }
        Ok(())
    }

    /// Judge a peer's appeal: exonerate only when this node is a current
    /// owner of a stable partition under the live key.
    pub fn handle_appeal(&self, ns: &Namespace, req: &AppealRequest) -> AppealVerdict {
        ns.counters.appeals_rx_active.inc();
        let verdict = match ns.partition(req.pid) {
            Ok(slot) => {
                let p = slot.lock();
                let live = self.exchange.cluster_key();
                if req.key == live
                    && p.current.contains(self.node_id)
                    && p.state == PartitionLifeState::Stable
                    && !p.transfers_outstanding()
                {
                    AppealVerdict::Exonerated
                } else {
                    AppealVerdict::Retained
                }
            }
            Err(_) => AppealVerdict::Retained,
        };
        ns.counters.appeals_rx_active.dec();
        verdict
    }

    fn immigration_session(
        &self,
        ns: &Namespace,
        pid: PartitionId,
        id: uuid::Uuid,
    ) -> Result<Arc<MigrationSession>> {
        let slot = ns.partition(pid)?;
        let p = slot.lock();
        match &p.immigration {
            Some(s) if s.id == id => Ok(Arc::clone(s)),
            Some(_) => Err(Error::Precondition(format!(
                "partition {} immigration session mismatch",
                pid
            ))),
            None => Err(Error::Precondition(format!(
                "partition {} has no immigration session",
                pid
            ))),
        }
    }

    fn try_begin_incoming(&self) -> bool {
        let mut cur = self.incoming_active.load(Ordering::Acquire);
        loop {
            if cur >= self.max_incoming {
                return false;
            }
            match self.incoming_active.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    fn end_incoming(&self) {
        self.incoming_active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The node that streams a partition's data: the first current owner still
/// in the succession, master first.
fn donor_of(p: &Partition, succession: &[NodeId]) -> Option<NodeId> {
    if p.current.is_dead() {
        return None;
    }
    let master = p.current.master();
    master
        .filter(|m| succession.contains(m))
        .or_else(|| {
            p.current
                .nodes
                .iter()
                .copied()
                .find(|n| succession.contains(n))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::PartitionAssignment;

    fn partition(current: Vec<NodeId>, master_index: usize) -> Partition {
        let mut p = Partition {
            id: 0,
            current: PartitionAssignment {
                nodes: current,
                master_index,
                missing_replicas: 0,
            },
            target: PartitionAssignment::dead(2),
            state: PartitionLifeState::Stable,
            revived: false,
            awaiting_immigration: false,
            emigrations: Vec::new(),
            immigration: None,
        };
        p.state = Partition::state_of(&p.current);
        p
    }

    #[test]
    fn test_donor_prefers_live_master() {
        let p = partition(vec![3, 1], 0);
        assert_eq!(donor_of(&p, &[1, 2, 3]), Some(3));

        // Master gone: first surviving owner takes over as donor.
        assert_eq!(donor_of(&p, &[1, 2]), Some(1));

        // Nobody survives: nothing can move.
        assert_eq!(donor_of(&p, &[7]), None);
    }

    #[test]
    fn test_donor_of_dead_partition() {
        let p = partition(Vec::new(), 0);
        assert_eq!(donor_of(&p, &[1, 2]), None);
    }
}
