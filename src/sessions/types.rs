//! Session types.

use crate::protocol::ServerMessage;
use crate::types::{Identity, RecordKey, ScopeKey, Sequence, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Delivery state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Connected and receiving deltas.
    Live,
    /// Outbound queue overflowed; incremental delivery stopped until a full
    /// resync.
    Overflowed,
    /// Transport gone; checkpoint retained for the grace window.
    Stale { since: Instant },
}

impl SessionStatus {
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Live)
    }

    /// Whether a stale session has outlived `grace` at `now`.
    pub fn expired(self, now: Instant, grace: Duration) -> bool {
        match self {
            SessionStatus::Stale { since } => now.saturating_duration_since(since) > grace,
            _ => false,
        }
    }
}

/// Persisted delivery state of one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session: SessionId,
    pub token: String,
    pub identity: Identity,
    pub scopes: BTreeSet<ScopeKey>,
    pub cursors: BTreeMap<RecordKey, Sequence>,
    /// Set when incremental delivery was abandoned; resuming needs a full
    /// snapshot rather than a gap fill.
    pub full_resync: bool,
    pub saved_at: Timestamp,
}

impl Checkpoint {
    /// Whether the checkpoint is older than `grace`.
    pub fn expired(&self, now: Timestamp, grace: Duration) -> bool {
        let age = now.0.saturating_sub(self.saved_at.0).max(0) as u128;
        age > grace.as_micros()
    }
}

/// Outcome of handing one message to a session's queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The session already holds this sequence (or a later one) for the record.
    Duplicate,
    /// Session is stale or overflowed; nothing queued.
    Skipped,
    /// Queue was full; the session is now overflowed.
    Overflowed,
    /// No such session, or its receiver is gone.
    Gone,
}

/// Snapshot of a live session taken for candidate resolution.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub id: SessionId,
    pub identity: Identity,
    pub scopes: Vec<ScopeKey>,
    pub cursor: Option<Sequence>,
}

/// Result of resuming a session by token.
#[derive(Debug)]
pub struct Resumed {
    pub handle: SessionHandle,
    /// False when the session can only be brought back with a full snapshot.
    pub gap_fill: bool,
}

/// Receiving end of a session's outbound queue.
pub struct SessionHandle {
    pub id: SessionId,
    pub token: String,
    pub receiver: crossbeam_channel::Receiver<ServerMessage>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("queued", &self.receiver.len())
            .finish()
    }
}

impl SessionHandle {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> Result<ServerMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<ServerMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ServerMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<ServerMessage> {
        self.receiver.try_iter().collect()
    }
}
