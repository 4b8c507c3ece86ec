//! # Syncmesh
//!
//! Live synchronization between an authoritative record store and the
//! partial mirrors held by connected clients, gated by an access policy.
//!
//! ## Core Concepts
//!
//! - **Records**: Typed attribute maps linked by `belongs_to` references
//! - **Policy**: Pure decisions over (identity, record, operation, attribute)
//! - **Changes**: Per-record sequenced events, fanned out to the sessions
//!   that can see them
//! - **Client store**: A mirror that applies deltas in order and shows local
//!   writes before the server confirms them
//!
//! ## Example
//!
//! ```ignore
//! use syncmesh::{Engine, EngineConfig, PolicyConfig, SchemaRegistry, ScopeKey, SubscribeRequest};
//!
//! let policy = PolicyConfig::new()
//!     .always_allow_connection()
//!     .regulate_all_broadcasts_send_all();
//! let engine = Engine::new(schema, &EngineConfig::with_policy(policy))?;
//!
//! // Connect and subscribe
//! let handle = engine.connect(Identity::user("u1"))?;
//! engine.subscribe(&SubscribeRequest {
//!     scope: ScopeKey::all("Picture"),
//!     session_token: handle.token.clone(),
//!     resume_from_seq: None,
//! })?;
//!
//! // Feed the session's messages into a client mirror
//! let client = ClientStore::new(schema, ClientConfig::default());
//! for message in handle.drain() {
//!     client.apply_message(message)?;
//! }
//! ```

pub mod client;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod scope;
pub mod sessions;
pub mod tracker;
pub mod types;

// Re-exports
pub use client::{ApplyResult, ClientConfig, ClientStore, LocalWrite, Rejection, ResyncSource};
pub use dispatch::{BroadcastDispatcher, DispatchStats};
pub use engine::{Engine, EngineConfig, SessionResync, SubscribeOutcome};
pub use error::{Result, SyncError};
pub use policy::{
    CompiledPolicy, Decision, Operation, PolicyConfig, PolicyEvaluator, Predicate, Rule, RuleClass,
};
pub use protocol::{
    ClientMessage, DeltaMessage, RecordSnapshot, RejectMessage, RejectReason, ServerMessage,
    SubscribeRequest, UnsubscribeRequest, WriteRequest,
};
pub use registry::{AssociationDef, AssociationIndex, RecordStore, SchemaRegistry, TypeDef};
pub use scope::{ScopeFacet, ScopeRegulator};
pub use sessions::{
    CheckpointStore, Delivery, Resumed, SessionHandle, SessionRegistry, SessionStatus,
};
pub use tracker::{ChangeTracker, EventSink, Mutation, ScopeShift};
pub use types::*;
