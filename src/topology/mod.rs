//! Cluster topology: the consumed membership-exchange contract and the
//! per-namespace topology state every other component reads.
//!
//! The exchange is not owned here. This module defines the contract the
//! control plane needs from it: a totally-ordered cluster key that changes
//! exactly when the succession list changes, and an event stream delivering
//! one notification per key advance, in order, never skipped.

mod exchange;
mod state;

pub use exchange::{ClusterView, ExchangeView, LocalExchange, ReformOutcome};
pub use state::TopologyState;
