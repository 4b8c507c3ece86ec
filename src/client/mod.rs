//! Client synchronization store.
//!
//! Mirrors the records a session can see, applies broadcast deltas in
//! per-record sequence order and keeps collection views consistent with the
//! `belongs_to` references they are derived from. Local writes are shown
//! immediately and reconciled when the server confirms or rejects them.
//!
//! A record's displayed state is always its last confirmed state with the
//! pending writes on it layered on top, so a rollback is a recomputation
//! rather than an undo log.

mod optimistic;
mod store;

use crate::error::Result;
use crate::protocol::RecordSnapshot;
use crate::types::RecordKey;
use std::time::Duration;

pub use optimistic::{LocalWrite, Rejection};
pub use store::{ApplyResult, ClientStore};

/// Client store configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long an optimistic write waits for confirmation before it is
    /// rolled back.
    /// Default: 10 seconds
    pub ack_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Where a client fetches full snapshots when it cannot patch in place.
pub trait ResyncSource {
    fn fetch(&self, key: &RecordKey) -> Result<RecordSnapshot>;
}
