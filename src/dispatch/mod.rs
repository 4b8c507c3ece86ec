//! Broadcast dispatcher.
//!
//! For each change event, every live session whose subscribed scopes could
//! contain the record (or that already mirrors it) is asked of the policy
//! evaluator; the session then gets the full diff, the permitted attributes,
//! or nothing at all.

mod dispatcher;

pub use dispatcher::{BroadcastDispatcher, DispatchStats};
