//! Fan-out of change events to subscribed sessions.

use crate::policy::{CompiledPolicy, Decision, Operation, PolicyEvaluator};
use crate::protocol::{DeltaMessage, RecordSnapshot, ServerMessage};
use crate::registry::RecordStore;
use crate::scope::{ScopeFacet, ScopeRegulator};
use crate::sessions::{Candidate, Delivery, SessionRegistry};
use crate::tracker::{EventSink, ScopeShift};
use crate::types::{ChangeEvent, ChangeOp, CollectionDelta, Record, RecordKey, ScopeKey, Sequence};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Counters over everything the dispatcher has handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub denied: u64,
    pub silenced: u64,
    pub duplicates: u64,
    pub overflowed: u64,
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    denied: AtomicU64,
    silenced: AtomicU64,
    duplicates: AtomicU64,
    overflowed: AtomicU64,
    malformed: AtomicU64,
}

/// Resolves target sessions per change and delivers the filtered delta.
///
/// Runs while the tracker holds the changed record's lock, so deliveries for
/// one record reach every session in sequence order.
pub struct BroadcastDispatcher {
    store: Arc<RecordStore>,
    policy: Arc<PolicyEvaluator>,
    scopes: Arc<ScopeRegulator>,
    sessions: Arc<SessionRegistry>,
    counters: Counters,
}

impl BroadcastDispatcher {
    pub fn new(
        store: Arc<RecordStore>,
        policy: Arc<PolicyEvaluator>,
        scopes: Arc<ScopeRegulator>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            store,
            policy,
            scopes,
            sessions,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            silenced: self.counters.silenced.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            overflowed: self.counters.overflowed.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }

    fn traversable(&self, scope: &ScopeKey) -> bool {
        self.scopes
            .is_facet_exposed(&scope.record_type, &scope.name, ScopeFacet::Traverse)
    }

    /// Whether `scope` may be traversed remotely and currently holds `key`.
    pub fn scope_reaches(&self, scope: &ScopeKey, key: &RecordKey) -> bool {
        self.traversable(scope) && self.store.scope_contains(scope, key)
    }

    /// Whether `scope` lists one of `collections` directly, or derives its
    /// members from one of them (`has_many :through`).
    fn scope_covers(&self, scope: &ScopeKey, collections: &[ScopeKey]) -> bool {
        collections.iter().any(|collection| {
            collection == scope
                || (collection.owner == scope.owner
                    && collection.record_type == scope.record_type
                    && self
                        .store
                        .schema()
                        .association(&scope.record_type, &scope.name)
                        .ok()
                        .and_then(|assoc| assoc.through.as_ref())
                        .is_some_and(|through| through.via == collection.name))
        })
    }

    /// Collection deltas whose ids the owner's type exposes.
    fn visible_collections(&self, owner_type: &str, deltas: &[CollectionDelta]) -> Vec<CollectionDelta> {
        deltas
            .iter()
            .filter(|d| self.scopes.is_facet_exposed(owner_type, &d.name, ScopeFacet::Ids))
            .cloned()
            .collect()
    }

    /// Current state of `key` as `decision` lets a session see it.
    pub fn snapshot_for(
        &self,
        key: &RecordKey,
        decision: &Decision,
        sequence: Sequence,
    ) -> RecordSnapshot {
        let Some(record) = self.store.get(key) else {
            return RecordSnapshot::missing(key, sequence);
        };
        if decision.is_deny() {
            return RecordSnapshot::missing(key, sequence);
        }
        let collections: BTreeMap<_, _> = self
            .store
            .collections_of(key)
            .unwrap_or_default()
            .into_iter()
            .filter(|(name, _)| {
                self.scopes
                    .is_facet_exposed(&key.record_type, name, ScopeFacet::Ids)
            })
            .collect();
        RecordSnapshot {
            record_type: key.record_type.clone(),
            record_id: key.id,
            exists: true,
            attrs: decision.filter(&record.attributes),
            collections,
            sequence,
        }
    }

    /// Deliver one event to every session it concerns.
    pub fn dispatch(&self, event: &ChangeEvent, record: &Record, shift: &ScopeShift) {
        if !self.store.schema().contains(&event.key.record_type) || event.sequence == Sequence(0) {
            warn!(record = %event.key, sequence = event.sequence.0, "dropping malformed event");
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let policy = self.policy.snapshot();
        for candidate in self.sessions.candidates(&event.key) {
            self.dispatch_to(&policy, &candidate, event, record, shift);
        }
    }

    fn dispatch_to(
        &self,
        policy: &CompiledPolicy,
        candidate: &Candidate,
        event: &ChangeEvent,
        record: &Record,
        shift: &ScopeShift,
    ) {
        let is_origin = event.origin == Some(candidate.id);
        let scopes: Vec<&ScopeKey> = candidate
            .scopes
            .iter()
            .filter(|scope| self.traversable(scope))
            .collect();
        let reaches_now = scopes
            .iter()
            .any(|scope| self.store.scope_contains(scope, &event.key));
        let reached_before = scopes
            .iter()
            .any(|scope| self.scope_covers(scope, &shift.left));
        if !is_origin && !reaches_now && !reached_before {
            return;
        }

        let decision = policy.evaluate(&candidate.identity, record, Operation::Read, None);
        if decision.is_deny() {
            trace!(session = %candidate.id, record = %event.key, "broadcast denied");
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // A record entering this session's view arrives whole.
        let held = reached_before
            || scopes.iter().any(|scope| {
                !self.scope_covers(scope, &shift.entered) && self.store.scope_contains(scope, &event.key)
            });
        let entering = candidate.cursor.is_none() || !held;
        let message = if entering && reaches_now && event.op == ChangeOp::Update && !is_origin {
            let snapshot = self.snapshot_for(&event.key, &decision, event.sequence);
            if snapshot.attrs.is_empty() && snapshot.collections.is_empty() {
                self.counters.silenced.fetch_add(1, Ordering::Relaxed);
                return;
            }
            ServerMessage::Snapshot(snapshot)
        } else {
            let attrs = decision.filter(&event.diff);
            let collections = self.visible_collections(&event.key.record_type, &event.collections);
            let confirms = is_origin && event.correlation.is_some();
            if event.op != ChangeOp::Destroy && attrs.is_empty() && collections.is_empty() && !confirms {
                trace!(session = %candidate.id, record = %event.key, "nothing visible, silenced");
                self.counters.silenced.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let mut delta = DeltaMessage::from_event(event, attrs, collections);
            if !is_origin {
                delta.correlation_id = None;
            }
            ServerMessage::Change(delta)
        };

        match self
            .sessions
            .deliver(candidate.id, &event.key, event.sequence, message)
        {
            Delivery::Sent => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                if event.op == ChangeOp::Destroy || (!reaches_now && !is_origin) {
                    // Gone, or out of every scope the session follows.
                    if let Err(error) = self.sessions.forget_cursors(candidate.id, &[event.key.clone()]) {
                        debug!(session = %candidate.id, error = %error, "cursor not dropped");
                    }
                }
            }
            Delivery::Duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Overflowed => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Skipped | Delivery::Gone => {
                debug!(session = %candidate.id, record = %event.key, "session went away during dispatch");
            }
        }
    }
}

impl EventSink for BroadcastDispatcher {
    fn publish(&self, event: &ChangeEvent, record: &Record, shift: &ScopeShift) {
        self.dispatch(event, record, shift);
    }
}
