//! Change detection and per-record sequencing.

use crate::error::Result;
use crate::registry::{Committed, SchemaRegistry};
use crate::registry::CollectionMove;
use crate::types::{
    Attributes, ChangeEvent, ChangeOp, CorrelationId, Record, RecordKey, ScopeKey, Sequence,
    SessionId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Owner collections a record joined or left in one commit.
///
/// Membership that did not change is not listed; the store answers for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeShift {
    pub entered: Vec<ScopeKey>,
    pub left: Vec<ScopeKey>,
}

impl ScopeShift {
    fn of(key: &RecordKey, moves: &[CollectionMove]) -> Self {
        let mut shift = Self::default();
        for owner_move in moves {
            for delta in &owner_move.deltas {
                let scope = ScopeKey::relation(&owner_move.owner.key, delta.name.clone());
                if delta.added.contains(key) {
                    shift.entered.push(scope.clone());
                }
                if delta.removed.contains(key) {
                    shift.left.push(scope);
                }
            }
        }
        shift
    }
}

/// Receives each change event while its record is still locked, so events
/// for one record are published in sequence order.
pub trait EventSink: Send + Sync {
    /// `record` is the state observers should judge the event by: the new
    /// state, or the last state for a destroy. `shift` lists the owner
    /// collections the record moved into or out of.
    fn publish(&self, event: &ChangeEvent, record: &Record, shift: &ScopeShift);
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &ChangeEvent, _record: &Record, _shift: &ScopeShift) {}
}

/// A mutation to commit under a record's lock.
pub struct Mutation {
    pub key: RecordKey,
    pub op: ChangeOp,
    pub origin: Option<SessionId>,
    pub correlation: Option<CorrelationId>,
}

impl Mutation {
    pub fn new(key: RecordKey, op: ChangeOp) -> Self {
        Self {
            key,
            op,
            origin: None,
            correlation: None,
        }
    }

    pub fn from_session(mut self, origin: SessionId, correlation: Option<CorrelationId>) -> Self {
        self.origin = Some(origin);
        self.correlation = correlation;
        self
    }
}

/// Observes committed mutations and turns them into sequenced events.
///
/// Each record key has its own slot; committing to one record never waits
/// on another record's writers.
pub struct ChangeTracker {
    schema: Arc<SchemaRegistry>,
    slots: RwLock<HashMap<RecordKey, Arc<Mutex<Sequence>>>>,
}

impl ChangeTracker {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &RecordKey) -> Arc<Mutex<Sequence>> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(key.clone()).or_default())
    }

    /// Highest sequence assigned to `key` so far (`Seq(0)` if none).
    pub fn last_sequence(&self, key: &RecordKey) -> Sequence {
        self.slots
            .read()
            .get(key)
            .map(|slot| *slot.lock())
            .unwrap_or_default()
    }

    /// Run `f` with the record's lock held, so no event for it is published
    /// until `f` returns.
    pub fn with_sequence<R>(&self, key: &RecordKey, f: impl FnOnce(Sequence) -> R) -> R {
        let slot = self.slot(key);
        let sequence = slot.lock();
        f(*sequence)
    }

    /// Run `mutate` under the record's lock and publish the resulting events.
    ///
    /// Produces one event for the record itself (none for an update that
    /// changed nothing, unless the write carries a correlation id that must
    /// be confirmed), then one collection event per affected owner, each
    /// sequenced under that owner's own lock.
    pub fn commit<F>(&self, mutation: Mutation, sink: &dyn EventSink, mutate: F) -> Result<Vec<ChangeEvent>>
    where
        F: FnOnce() -> Result<Committed>,
    {
        let Mutation {
            key,
            op,
            origin,
            correlation,
        } = mutation;
        let capability = self.schema.capability(&key.record_type)?;
        let mut events = Vec::new();

        let moves = {
            let slot = self.slot(&key);
            let mut sequence = slot.lock();
            let committed = mutate()?;

            let diff = match op {
                ChangeOp::Create => committed.after.clone().unwrap_or_default(),
                ChangeOp::Update => capability.diff(
                    committed.before.as_ref().unwrap_or(&Attributes::new()),
                    committed.after.as_ref().unwrap_or(&Attributes::new()),
                ),
                ChangeOp::Destroy => Attributes::new(),
            };

            if op == ChangeOp::Update && diff.is_empty() && correlation.is_none() {
                debug!(record = %key, "update changed nothing");
            } else {
                *sequence = sequence.next();
                let event = ChangeEvent {
                    key: key.clone(),
                    op,
                    diff,
                    collections: Vec::new(),
                    sequence: *sequence,
                    origin,
                    correlation,
                };
                let shift = ScopeShift::of(&key, &committed.moves);
                sink.publish(&event, &committed.record(&key), &shift);
                events.push(event);
            }
            committed.moves
        };

        for owner_move in moves {
            let slot = self.slot(&owner_move.owner.key);
            let mut sequence = slot.lock();
            *sequence = sequence.next();
            let event = ChangeEvent {
                key: owner_move.owner.key.clone(),
                op: ChangeOp::Update,
                diff: Attributes::new(),
                collections: owner_move.deltas,
                sequence: *sequence,
                origin,
                correlation: None,
            };
            sink.publish(&event, &owner_move.owner, &ScopeShift::default());
            events.push(event);
        }

        Ok(events)
    }
}
