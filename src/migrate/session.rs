//! Per-partition migration sessions.
//!
//! A session is the ephemeral record of one transfer: one partition, one
//! peer, one direction, planned under one cluster key. Sessions are owned
//! by their partition slot and replaced atomically; cancellation is a state
//! swap, never a destructive edit. A session planned under key `E1` must
//! never commit a side effect once the live key is `E2 != E1` — every
//! commit point calls [`MigrationSession::fence`] first.

use crate::error::{Error, Result};
use crate::types::{ClusterKey, NodeId, PartitionId};
use smol_str::SmolStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Transfer direction, from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This node streams records out to the peer.
    Emigrate,
    /// This node applies records streamed in from the peer.
    Immigrate,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Emigrate => write!(f, "tx"),
            Direction::Immigrate => write!(f, "rx"),
        }
    }
}

/// Session lifecycle. `Aborted` is reachable from `Planned` and `Active`;
/// both terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Created; waiting for worker and peer capacity.
    Planned = 0,
    /// Streaming or applying records.
    Active = 1,
    /// Transfer complete; ownership bookkeeping may advance.
    Done = 2,
    /// Superseded by a newer cluster key; discarded without side effects.
    Aborted = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Planned,
            1 => SessionState::Active,
            2 => SessionState::Done,
            _ => SessionState::Aborted,
        }
    }

    /// Whether the session can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted)
    }
}

/// One migration session.
#[derive(Debug)]
pub struct MigrationSession {
    /// Unique session id, carried on every wire message.
    pub id: Uuid,
    /// Namespace the partition belongs to.
    pub namespace: SmolStr,
    /// Partition being transferred.
    pub pid: PartitionId,
    /// The other end of the transfer.
    pub peer: NodeId,
    /// Direction from this node's point of view.
    pub direction: Direction,
    /// Cluster key this session was planned under.
    pub planned_key: ClusterKey,

    state: AtomicU8,

    /// Records sent (tx sessions).
    pub records_transmitted: AtomicU64,
    /// Records applied (rx sessions).
    pub records_received: AtomicU64,
    /// Records skipped on apply because a newer copy was present.
    pub records_skipped: AtomicU64,
    /// Batches resent after an ack timeout.
    pub retransmits: AtomicU64,
    /// Highest batch sequence applied (rx sessions), for duplicate drops.
    pub last_sequence: AtomicU64,

    started_at: Instant,
}

impl MigrationSession {
    /// Create a session in `Planned` state.
    pub fn new(
        namespace: SmolStr,
        pid: PartitionId,
        peer: NodeId,
        direction: Direction,
        planned_key: ClusterKey,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), namespace, pid, peer, direction, planned_key)
    }

    /// Create a session carrying a peer-allocated id. Receive-side sessions
    /// reuse the sender's id so both ends account the same transfer.
    pub fn with_id(
        id: Uuid,
        namespace: SmolStr,
        pid: PartitionId,
        peer: NodeId,
        direction: Direction,
        planned_key: ClusterKey,
    ) -> Self {
        Self {
            id,
            namespace,
            pid,
            peer,
            direction,
            planned_key,
            state: AtomicU8::new(SessionState::Planned as u8),
            records_transmitted: AtomicU64::new(0),
            records_received: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Planned → Active`. False if the session was already activated,
    /// completed, or aborted.
    pub fn try_activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Planned as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Active → Done`. False if not active.
    pub fn complete(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Done as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Planned|Active → Aborted`. Returns the state the session was in, or
    /// `None` if it was already terminal.
    pub fn abort(&self) -> Option<SessionState> {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if SessionState::from_u8(cur).is_terminal() {
                return None;
            }
            if self
                .state
                .compare_exchange_weak(
                    cur,
                    SessionState::Aborted as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(SessionState::from_u8(cur));
            }
        }
    }

    /// The cancellation point: verify the live key still matches the key
    /// this session was planned under.
    pub fn fence(&self, live: ClusterKey) -> Result<()> {
        if live == self.planned_key {
            Ok(())
        } else {
            Err(Error::StaleKey {
                planned: self.planned_key,
                live,
            })
        }
    }

    /// Elapsed time since the session was planned.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(direction: Direction) -> MigrationSession {
        MigrationSession::new(SmolStr::new("test"), 7, 2, direction, ClusterKey::new(5))
    }

    #[test]
    fn test_lifecycle() {
        let s = session(Direction::Emigrate);
        assert_eq!(s.state(), SessionState::Planned);

        assert!(s.try_activate());
        assert!(!s.try_activate());
        assert_eq!(s.state(), SessionState::Active);

        assert!(s.complete());
        assert_eq!(s.state(), SessionState::Done);
        assert!(s.state().is_terminal());
        assert!(s.abort().is_none());
    }

    #[test]
    fn test_abort_from_planned_and_active() {
        let s = session(Direction::Immigrate);
        assert_eq!(s.abort(), Some(SessionState::Planned));
        assert_eq!(s.state(), SessionState::Aborted);

        let s = session(Direction::Immigrate);
        s.try_activate();
        assert_eq!(s.abort(), Some(SessionState::Active));
        assert!(!s.complete());
    }

    #[test]
    fn test_fence() {
        let s = session(Direction::Emigrate);
        assert!(s.fence(ClusterKey::new(5)).is_ok());

        let err = s.fence(ClusterKey::new(6)).unwrap_err();
        assert!(matches!(err, Error::StaleKey { .. }));
    }
}
