//! Partition ownership and migration control plane for a distributed,
//! replicated key-value store.
//!
//! For each of a fixed number of partitions per namespace, this crate
//! decides which cluster members own the partition (master or replicas)
//! and drives the asynchronous record transfers that make new ownership
//! real after a membership change. It supports a strong-consistency mode
//! where ownership is fenced by an operator-managed roster, and recovers
//! from crashes, partitions, and operator intervention mid-flight.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Admin surface (info)                 │
//! │  roster / roster-set / racks / recluster / quiesce   │
//! │  revive / cluster-stable / get-sl                    │
//! └─────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │               ClusterCoordinator                     │
//! │   exchange events ──► balance ──► migration plan     │
//! └─────────────────────────────────────────────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Exchange   │   │  Balancer    │   │  Migration   │
//! │ (consumed) │   │  (pure fn)   │   │  Engine      │
//! └────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use shardplane::{ClusterCoordinator, CoordinatorConfig, NamespaceConfig};
//! use shardplane::testing::{MemoryPartitionStore, NullFabric};
//! use shardplane::topology::LocalExchange;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let exchange = Arc::new(LocalExchange::with_succession(vec![0xa1]));
//!     let config = CoordinatorConfig::new(0xa1)
//!         .with_namespace(NamespaceConfig::new("test").with_replication_factor(2));
//!
//!     let coordinator = ClusterCoordinator::new(
//!         config,
//!         exchange,
//!         Arc::new(NullFabric),
//!         Arc::new(MemoryPartitionStore::new()),
//!     )
//!     .await?;
//!
//!     Arc::clone(&coordinator).spawn_run();
//!     let response = coordinator.info("cluster-stable:size=1").await;
//!     println!("cluster-stable => {}", response);
//!     Ok(())
//! }
//! ```
//!
//! # Consistency model
//!
//! Every long-running operation carries the cluster key it was planned
//! under and re-checks it before committing a side effect. A stale key
//! means the operation is abandoned — never rolled back destructively —
//! and replanned against the new view.

pub mod admin;
pub mod appeal;
pub mod balance;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod migrate;
pub mod namespace;
pub mod roster;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export main types for convenience
pub use config::{CoordinatorConfig, NamespaceConfig, DEFAULT_PARTITION_COUNT};
pub use coordinator::ClusterCoordinator;
pub use error::{Error, ParamError, Result};
pub use types::{ClusterKey, NodeId, PartitionId, RackId, RosterNode};

// Re-export topology types
pub use topology::{ClusterView, ExchangeView, LocalExchange, ReformOutcome};

// Re-export balance types
pub use balance::{balance, BalanceInput, BalanceOutput, OwnershipTable, PartitionAssignment};

// Re-export migration types
pub use migrate::{
    Direction, MigrationEngine, MigrationFabric, MigrationRecord, MigrationSession,
    PartitionStore, SessionState, TransferBatch,
};

// Re-export namespace runtime types
pub use namespace::{Namespace, Partition, PartitionLifeState};

// Re-export roster types
pub use roster::{FileRosterStore, QuiesceState, RosterPersistence, RosterRecord};

// Re-export observability types
pub use metrics::{NamespaceCounters, StatsSnapshot};
