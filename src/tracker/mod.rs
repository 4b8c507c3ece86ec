//! Change tracking on the authoritative store.
//!
//! Every committed mutation yields exactly one event for the mutated record
//! plus one collection event for each owner whose derived collection
//! changed. Sequence numbers are per record, strictly increasing, and
//! assigned under that record's lock before the event is published.

mod changes;

pub use changes::{ChangeTracker, EventSink, Mutation, NullSink, ScopeShift};
