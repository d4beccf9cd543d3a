//! Contracts the migration engine needs from its external collaborators:
//! the inter-node transport (fabric) and the partition storage engine.
//!
//! Both are conventional engineering outside this crate; only the contract
//! is load-bearing here. Fabric calls may block on the network and are
//! confined to the migration worker pool.

use crate::error::Result;
use crate::migrate::transfer::MigrationRecord;
use crate::types::{ClusterKey, NodeId, PartitionId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

/// Opening handshake of an emigration: asks the receiver to accept a
/// session for one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Namespace of the partition.
    pub namespace: SmolStr,
    /// Session id the sender allocated.
    pub session: Uuid,
    /// Partition to be transferred.
    pub pid: PartitionId,
    /// Sending node.
    pub source: NodeId,
    /// Cluster key the sender planned under.
    pub key: ClusterKey,
    /// Records the sender expects to stream, for receiver sizing.
    pub expected_records: u64,
}

/// Receiver's answer to a [`StartRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartResponse {
    /// Session accepted; stream batches.
    Ok,
    /// Receiver is at its inbound cap or has not planned this rebalance
    /// yet. Not an error: retry after a delay.
    Eagain,
}

/// Acknowledgement of one applied (or duplicate-dropped) batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    /// Session being acknowledged.
    pub session: Uuid,
    /// Sequence of the acknowledged batch.
    pub sequence: u64,
}

/// Sender's completion signal for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneNotice {
    /// Namespace of the partition.
    pub namespace: SmolStr,
    /// Session that finished streaming.
    pub session: Uuid,
    /// Partition that finished.
    pub pid: PartitionId,
    /// Cluster key the sender planned under.
    pub key: ClusterKey,
}

/// A replica's appeal to a partition owner: "I may be missing committed
/// writes for this partition; exclude me until you can vouch for me."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppealRequest {
    /// Namespace of the partition.
    pub namespace: SmolStr,
    /// Partition in doubt.
    pub pid: PartitionId,
    /// Appealing node.
    pub from: NodeId,
    /// Cluster key the appeal was raised under.
    pub key: ClusterKey,
}

/// An owner's judgement of an appeal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppealVerdict {
    /// The owner can prove the appellant is complete; clear the flag.
    Exonerated,
    /// Cannot vouch yet; the appeal stands and the partition stays
    /// unavailable to clients.
    Retained,
}

/// Inter-node transport used by the migration engine and the appeal
/// subsystem. Implementations deliver inbound traffic to the peer engine's
/// `handle_*` methods.
#[async_trait::async_trait]
pub trait MigrationFabric: Send + Sync + std::fmt::Debug {
    /// Open a session on the receiver.
    async fn send_start(&self, to: NodeId, req: StartRequest) -> Result<StartResponse>;

    /// Ship one encoded batch; resolves when the receiver acknowledges it.
    async fn send_batch(&self, to: NodeId, payload: Bytes) -> Result<BatchAck>;

    /// Signal session completion to the receiver.
    async fn send_done(&self, to: NodeId, notice: DoneNotice) -> Result<()>;

    /// Press an appeal on a partition owner.
    async fn send_appeal(&self, to: NodeId, req: AppealRequest) -> Result<AppealVerdict>;
}

/// The partition storage engine, as seen by the control plane.
#[async_trait::async_trait]
pub trait PartitionStore: Send + Sync + std::fmt::Debug {
    /// Scan one partition in stable order. `cursor` is `None` to start and
    /// whatever the previous call returned thereafter; a `None` cursor in
    /// the result means the scan is finished.
    async fn read_batch(
        &self,
        pid: PartitionId,
        cursor: Option<Vec<u8>>,
        max_records: usize,
    ) -> Result<(Vec<MigrationRecord>, Option<Vec<u8>>)>;

    /// Apply one record idempotently, keyed by generation and last-update
    /// time. Returns false when the local copy was already as new or newer
    /// (the record is skipped, not an error).
    async fn apply_record(&self, pid: PartitionId, record: &MigrationRecord) -> Result<bool>;

    /// Number of records currently held for a partition.
    async fn record_count(&self, pid: PartitionId) -> Result<u64>;
}
