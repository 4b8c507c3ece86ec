//! Session registry.
//!
//! Sessions are live until their transport goes away, then stale for a
//! bounded grace window during which a reconnect can ask for only the gap.
//! Past the window the session and its checkpoint are discarded.

mod checkpoint;
mod manager;
mod types;

pub use checkpoint::CheckpointStore;
pub use manager::{SessionRegistry, DEFAULT_QUEUE_DEPTH, DEFAULT_RECONNECT_GRACE};
pub use types::{Candidate, Checkpoint, Delivery, Resumed, SessionHandle, SessionStatus};
