//! Migration: realizing a new ownership assignment by transferring
//! partition data.
//!
//! Per (partition, key) the lifecycle is `Planned → Active(tx|rx) → Done`,
//! with `Aborted` reachable from either live state whenever the owning key
//! advances. Aborted sessions are discarded without side effects on
//! ownership bookkeeping; a fresh session is planned against the new key if
//! still needed.

mod engine;
mod fabric;
mod session;
mod transfer;

pub use engine::{MigrationEngine, RebalancePlan};
pub use fabric::{
    AppealRequest, AppealVerdict, BatchAck, DoneNotice, MigrationFabric, PartitionStore,
    StartRequest, StartResponse,
};
pub use session::{Direction, MigrationSession, SessionState};
pub use transfer::{MigrationRecord, TransferBatch};
