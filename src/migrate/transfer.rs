//! Record batches shipped between nodes during a migration.
//!
//! Batches are bincode-encoded, lz4-compressed, and carry a CRC-32 of the
//! compressed payload so a corrupt frame is rejected instead of applied.
//! Receivers tolerate duplicate delivery: batches carry a sequence number
//! and records carry the version information idempotent apply keys on.

use crate::error::{Error, Result};
use crate::types::{ClusterKey, PartitionId};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// One record in flight.
///
/// The control plane is agnostic to the storage format; it only needs the
/// version fields the receiver keys idempotent apply on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Record key.
    pub key: Vec<u8>,
    /// Record payload.
    pub value: Vec<u8>,
    /// Write generation.
    pub generation: u32,
    /// Last-update time, the tiebreak across generation wrap.
    pub last_update_time: u64,
}

impl MigrationRecord {
    /// Create a record.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, generation: u32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            generation,
            last_update_time: 0,
        }
    }

    /// Size contributed to a batch, in bytes.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// A batch of records for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferBatch {
    /// Session this batch belongs to.
    pub session: Uuid,
    /// Namespace of the partition.
    pub namespace: SmolStr,
    /// Partition being transferred.
    pub pid: PartitionId,
    /// Cluster key the sending session was planned under.
    pub key: ClusterKey,
    /// Monotonic sequence within the session, starting at 1.
    pub sequence: u64,
    /// Records in this batch.
    pub records: Vec<MigrationRecord>,
    /// Whether this is the last batch of the session.
    pub is_final: bool,
}

impl TransferBatch {
    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch carries no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total record bytes.
    pub fn size(&self) -> usize {
        self.records.iter().map(|r| r.size()).sum()
    }

    /// Encode for the fabric: bincode, lz4, CRC-32 trailer.
    pub fn encode(&self) -> Result<Bytes> {
        let raw = bincode::serialize(self)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);
        let crc = CASTAGNOLI.checksum(&compressed);

        let mut buf = BytesMut::with_capacity(compressed.len() + 4);
        buf.put_slice(&compressed);
        buf.put_u32(crc);
        Ok(buf.freeze())
    }

    /// Decode a fabric payload, verifying the checksum first.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::Serialization("transfer batch truncated".to_string()));
        }
        let (compressed, trailer) = payload.split_at(payload.len() - 4);
        let expect = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if CASTAGNOLI.checksum(compressed) != expect {
            return Err(Error::Serialization(
                "transfer batch checksum mismatch".to_string(),
            ));
        }
        let raw = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(bincode::deserialize(&raw)?)
    }
}
