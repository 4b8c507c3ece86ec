//! Client-side mirror of the record graph.

use super::optimistic::{derive, LocalWrite, PendingWrite, Rejection};
use super::{ClientConfig, ResyncSource};
use crate::error::{Result, SyncError};
use crate::protocol::{RecordSnapshot, RejectReason, ServerMessage, WriteRequest};
use crate::registry::{AssociationIndex, AssociationKind, ReferenceChange, SchemaRegistry};
use crate::types::{
    Attributes, ChangeEvent, ChangeOp, CollectionDelta, CorrelationId, Record, RecordId,
    RecordKey, ScopeKey, Sequence,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Outcome of applying one incoming message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyResult {
    Applied,
    /// Sequence at or below the last applied one; nothing changed.
    Duplicate,
    /// The event confirmed a local optimistic write.
    Confirmed(CorrelationId),
    /// A local optimistic write was rolled back.
    Rejected(Rejection),
    /// The event could not be applied in place; these records need a fresh
    /// snapshot.
    ResyncRequired(Vec<RecordKey>),
}

#[derive(Clone, Debug)]
struct Mirror {
    attributes: Attributes,
    /// Known only through an association; attributes not loaded.
    stub: bool,
}

#[derive(Default)]
struct ClientState {
    records: HashMap<RecordKey, Mirror>,
    applied: HashMap<RecordKey, Sequence>,
    views: AssociationIndex,
    /// Authoritative state of records with writes in flight.
    confirmed: HashMap<RecordKey, Option<Attributes>>,
    pending: Vec<PendingWrite>,
    /// Collections of records hidden by a pending destroy.
    stashed_views: HashMap<RecordKey, BTreeMap<String, Vec<RecordKey>>>,
    resync: BTreeSet<RecordKey>,
    next_local: u64,
}

impl ClientState {
    fn displayed(&self, key: &RecordKey) -> Option<Attributes> {
        self.records
            .get(key)
            .filter(|m| !m.stub)
            .map(|m| m.attributes.clone())
    }

    fn base(&self, key: &RecordKey) -> Option<Attributes> {
        match self.confirmed.get(key) {
            Some(base) => base.clone(),
            None => self.displayed(key),
        }
    }

    fn has_pending(&self, key: &RecordKey) -> bool {
        self.pending.iter().any(|w| &w.key == key)
    }

    fn ensure_stub(&mut self, key: &RecordKey) {
        self.records.entry(key.clone()).or_insert_with(|| Mirror {
            attributes: Attributes::new(),
            stub: true,
        });
    }

    fn take_pending(&mut self, correlation: &CorrelationId) -> Option<PendingWrite> {
        let at = self.pending.iter().position(|w| &w.correlation == correlation)?;
        Some(self.pending.remove(at))
    }

    fn relink(&mut self, schema: &SchemaRegistry, key: &RecordKey, changes: Vec<ReferenceChange>) {
        for change in changes {
            if let Some(from) = &change.from {
                for coll in
                    schema.inverse_collections(&from.record_type, &key.record_type, &change.association)
                {
                    self.views.remove(from, &coll.name, key);
                }
            }
            if let Some(to) = &change.to {
                let collections: Vec<(String, AssociationKind)> = schema
                    .inverse_collections(&to.record_type, &key.record_type, &change.association)
                    .map(|c| (c.name.clone(), c.kind))
                    .collect();
                if collections.is_empty() {
                    continue;
                }
                self.ensure_stub(to);
                for (name, kind) in collections {
                    if kind == AssociationKind::HasOne {
                        let displaced: Vec<RecordKey> = self
                            .views
                            .members(to, &name)
                            .iter()
                            .filter(|m| *m != key)
                            .cloned()
                            .collect();
                        for old in &displaced {
                            self.views.remove(to, &name, old);
                        }
                    }
                    self.views.insert(to, &name, key);
                }
            }
        }
    }

    /// Move the displayed state of `key` to `next`, re-resolving its
    /// references so both sides of every association stay in step.
    fn transition(
        &mut self,
        schema: &SchemaRegistry,
        key: &RecordKey,
        next: Option<Attributes>,
    ) -> Result<()> {
        let before = self.displayed(key);
        let changes = schema.reference_changes(&key.record_type, before.as_ref(), next.as_ref())?;
        match next {
            Some(attributes) => {
                self.records.insert(
                    key.clone(),
                    Mirror {
                        attributes,
                        stub: false,
                    },
                );
                if before.is_none() {
                    if let Some(stashed) = self.stashed_views.remove(key) {
                        for (name, members) in stashed {
                            self.views.set(key, &name, members);
                        }
                    }
                }
            }
            None => {
                self.records.remove(key);
                self.views.remove_everywhere(key);
                if let Some(owned) = self.views.remove_owner(key) {
                    if self.has_pending(key) {
                        self.stashed_views.insert(key.clone(), owned);
                    }
                }
            }
        }
        self.relink(schema, key, changes);
        Ok(())
    }

    /// Recompute what is shown for `key` from its confirmed base and the
    /// writes still pending on it.
    fn rederive(&mut self, schema: &SchemaRegistry, key: &RecordKey) -> Result<()> {
        let base = self.base(key);
        let shown = derive(base, self.pending.iter().filter(|w| &w.key == key));
        self.transition(schema, key, shown)?;
        if !self.has_pending(key) {
            self.confirmed.remove(key);
            self.stashed_views.remove(key);
        }
        Ok(())
    }

    /// Replace the authoritative state of `key`.
    fn set_base(
        &mut self,
        schema: &SchemaRegistry,
        key: &RecordKey,
        base: Option<Attributes>,
    ) -> Result<()> {
        if self.confirmed.contains_key(key) {
            self.confirmed.insert(key.clone(), base);
            self.rederive(schema, key)
        } else {
            self.transition(schema, key, base)
        }
    }

    fn apply_collection(&mut self, owner: &RecordKey, delta: &CollectionDelta) {
        for member in &delta.added {
            self.ensure_stub(member);
        }
        self.views.apply_delta(owner, delta);
    }

    /// Flag `key` and every owner listing it for resync.
    fn mark_resync(&mut self, key: &RecordKey) -> Vec<RecordKey> {
        let mut keys = vec![key.clone()];
        keys.extend(self.views.owners_of(key).into_iter().map(|(owner, _)| owner));
        keys.dedup();
        self.resync.extend(keys.iter().cloned());
        keys
    }

    fn rollback(
        &mut self,
        schema: &SchemaRegistry,
        write: PendingWrite,
        reason: RejectReason,
    ) -> Result<Rejection> {
        self.rederive(schema, &write.key)?;
        info!(
            record = %write.key,
            correlation = %write.correlation,
            reason = ?reason,
            "optimistic write rolled back"
        );
        Ok(Rejection {
            correlation: write.correlation,
            key: write.key,
            reason,
        })
    }
}

/// Local mirror of the records a session can see.
///
/// All mutation happens under one lock, so local observers never see a
/// record in both its old and new owner's collection, or in neither.
pub struct ClientStore {
    schema: Arc<SchemaRegistry>,
    config: ClientConfig,
    state: RwLock<ClientState>,
}

impl ClientStore {
    pub fn new(schema: Arc<SchemaRegistry>, config: ClientConfig) -> Self {
        Self {
            schema,
            config,
            state: RwLock::new(ClientState::default()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Apply a broadcast change event.
    pub fn apply(&self, event: &ChangeEvent) -> Result<ApplyResult> {
        let key = &event.key;
        if !self.schema.contains(&key.record_type) {
            return Err(SyncError::MalformedEvent(format!(
                "event for unregistered type {}",
                key.record_type
            )));
        }
        if event.sequence == Sequence(0) {
            return Err(SyncError::MalformedEvent(format!("{} carries sequence 0", key)));
        }

        let mut state = self.state.write();
        let last = state.applied.get(key).copied().unwrap_or_default();
        if event.sequence <= last {
            trace!(record = %key, sequence = event.sequence.0, "duplicate event");
            return Ok(ApplyResult::Duplicate);
        }

        let confirmed = event
            .correlation
            .as_ref()
            .and_then(|c| state.take_pending(c));
        if let Some(write) = &confirmed {
            if &write.key != key {
                // Provisional create answered under the server-assigned id.
                state.rederive(&self.schema, &write.key)?;
            }
        }

        // Creates carry the full record, so they never leave a gap.
        let gap = event.op != ChangeOp::Create && event.sequence.0 > last.0 + 1;
        let unknown_base = event.op == ChangeOp::Update
            && !event.diff.is_empty()
            && state.base(key).is_none();
        if gap || unknown_base {
            if state.confirmed.contains_key(key) {
                state.rederive(&self.schema, key)?;
            }
            let keys = state.mark_resync(key);
            let absorbed = SyncError::SequenceGap {
                key: key.clone(),
                expected: last.next(),
                got: event.sequence,
            };
            warn!(error = %absorbed, "cannot apply in place, resync required");
            return Ok(ApplyResult::ResyncRequired(keys));
        }

        match event.op {
            ChangeOp::Create => state.set_base(&self.schema, key, Some(event.diff.clone()))?,
            ChangeOp::Destroy => state.set_base(&self.schema, key, None)?,
            ChangeOp::Update => match state.base(key) {
                Some(mut attributes) if !event.diff.is_empty() => {
                    attributes.extend(event.diff.clone());
                    state.set_base(&self.schema, key, Some(attributes))?;
                }
                Some(_) => {}
                None => {
                    if !event.collections.is_empty() {
                        state.ensure_stub(key);
                    }
                }
            },
        }
        for delta in &event.collections {
            state.apply_collection(key, delta);
        }
        if state.confirmed.contains_key(key) {
            state.rederive(&self.schema, key)?;
        }
        state.applied.insert(key.clone(), event.sequence);
        state.resync.remove(key);

        Ok(match confirmed {
            Some(write) => {
                debug!(record = %key, correlation = %write.correlation, "write confirmed");
                ApplyResult::Confirmed(write.correlation)
            }
            None => ApplyResult::Applied,
        })
    }

    /// Apply any server message.
    pub fn apply_message(&self, message: ServerMessage) -> Result<ApplyResult> {
        match message {
            ServerMessage::Change(delta) => self.apply(&delta.into_event()?),
            ServerMessage::Snapshot(snapshot) => self.load_snapshot(snapshot),
            ServerMessage::Reject(reject) => {
                match self.reject(&reject.correlation_id, reject.reason_kind)? {
                    Some(rejection) => Ok(ApplyResult::Rejected(rejection)),
                    None => Ok(ApplyResult::Duplicate),
                }
            }
        }
    }

    /// Replace one record with its full current state.
    pub fn load_snapshot(&self, snapshot: RecordSnapshot) -> Result<ApplyResult> {
        let key = snapshot.key();
        if !self.schema.contains(&key.record_type) {
            return Err(SyncError::MalformedEvent(format!(
                "snapshot for unregistered type {}",
                key.record_type
            )));
        }

        let mut state = self.state.write();
        let last = state.applied.get(&key).copied().unwrap_or_default();
        let is_stub = state.records.get(&key).is_some_and(|m| m.stub);
        if snapshot.sequence < last
            || (snapshot.sequence == last && !state.resync.contains(&key) && !is_stub)
        {
            return Ok(ApplyResult::Duplicate);
        }

        let base = snapshot.exists.then(|| snapshot.attrs.clone());
        state.set_base(&self.schema, &key, base)?;
        if snapshot.exists {
            for (name, members) in snapshot.collections {
                let derived = self
                    .schema
                    .association(&key.record_type, &name)
                    .map(|a| a.through.is_some())
                    .unwrap_or(true);
                if derived {
                    continue;
                }
                for member in &members {
                    state.ensure_stub(member);
                }
                state.views.set(&key, &name, members);
            }
        }
        state.applied.insert(key.clone(), snapshot.sequence.max(last));
        state.resync.remove(&key);
        trace!(record = %key, sequence = snapshot.sequence.0, exists = snapshot.exists, "snapshot loaded");
        Ok(ApplyResult::Applied)
    }

    /// Apply a local write immediately and return the request to send.
    pub fn write(&self, write: LocalWrite) -> Result<WriteRequest> {
        self.schema.type_def(&write.record_type)?;
        if write.op != ChangeOp::Destroy {
            self.schema.validate(&write.record_type, &write.attrs)?;
        }

        let mut state = self.state.write();
        let key = match (write.op, write.record_id) {
            (_, Some(id)) => RecordKey {
                record_type: write.record_type.clone(),
                id,
            },
            (ChangeOp::Create, None) => {
                state.next_local += 1;
                RecordKey {
                    record_type: write.record_type.clone(),
                    id: RecordId::provisional(state.next_local),
                }
            }
            (op, None) => {
                return Err(SyncError::InvalidOperation(format!(
                    "{} of {} needs a record id",
                    op, write.record_type
                )))
            }
        };

        let current = state.displayed(&key);
        match write.op {
            ChangeOp::Create if current.is_some() => return Err(SyncError::RecordExists(key)),
            ChangeOp::Update | ChangeOp::Destroy if current.is_none() => {
                return Err(SyncError::RecordNotFound(key))
            }
            _ => {}
        }

        let correlation = match write.correlation {
            Some(correlation) => correlation,
            None => {
                state.next_local += 1;
                CorrelationId::new(format!("local-{}", state.next_local))
            }
        };
        if state.pending.iter().any(|w| w.correlation == correlation) {
            return Err(SyncError::InvalidOperation(format!(
                "correlation {} already pending",
                correlation
            )));
        }

        let pending = PendingWrite {
            correlation: correlation.clone(),
            key: key.clone(),
            op: write.op,
            attrs: write.attrs.clone(),
            issued: Instant::now(),
        };
        // Surface malformed references before anything is shown.
        let next = pending.apply_to(current.clone());
        self.schema
            .reference_changes(&key.record_type, current.as_ref(), next.as_ref())?;

        if !state.confirmed.contains_key(&key) {
            let base = state.displayed(&key);
            state.confirmed.insert(key.clone(), base);
        }
        state.pending.push(pending);
        state.rederive(&self.schema, &key)?;
        debug!(record = %key, correlation = %correlation, op = %write.op, "optimistic write applied");

        Ok(WriteRequest {
            record_type: key.record_type.clone(),
            record_id: (!key.id.is_provisional()).then_some(key.id),
            change_op: write.op,
            attrs: write.attrs,
            correlation_id: correlation,
        })
    }

    /// Roll back a write the server refused. `Ok(None)` if no such write is
    /// pending.
    pub fn reject(&self, correlation: &CorrelationId, reason: RejectReason) -> Result<Option<Rejection>> {
        let mut state = self.state.write();
        let Some(write) = state.take_pending(correlation) else {
            debug!(correlation = %correlation, "rejection for unknown write");
            return Ok(None);
        };
        state.rollback(&self.schema, write, reason).map(Some)
    }

    /// Roll back every write unanswered for longer than the acknowledgment
    /// timeout.
    pub fn expire_pending(&self, now: Instant) -> Result<Vec<Rejection>> {
        let mut state = self.state.write();
        let timeout = self.config.ack_timeout;
        let expired: Vec<CorrelationId> = state
            .pending
            .iter()
            .filter(|w| now.saturating_duration_since(w.issued) >= timeout)
            .map(|w| w.correlation.clone())
            .collect();
        let mut rejections = Vec::new();
        for correlation in expired {
            if let Some(write) = state.take_pending(&correlation) {
                rejections.push(state.rollback(&self.schema, write, RejectReason::Timeout)?);
            }
        }
        Ok(rejections)
    }

    /// Disconnect: every in-flight write is abandoned and rolled back.
    pub fn discard_pending(&self) -> Result<Vec<Rejection>> {
        let mut state = self.state.write();
        let mut rejections = Vec::new();
        while let Some(write) = state.pending.pop() {
            rejections.push(state.rollback(&self.schema, write, RejectReason::Disconnected)?);
        }
        rejections.reverse();
        Ok(rejections)
    }

    /// Fetch fresh snapshots for every record flagged for resync.
    pub fn resync(&self, source: &dyn ResyncSource) -> Result<usize> {
        let keys: Vec<RecordKey> = self.state.read().resync.iter().cloned().collect();
        let mut loaded = 0;
        for key in keys {
            let snapshot = source.fetch(&key)?;
            if snapshot.key() != key {
                return Err(SyncError::MalformedEvent(format!(
                    "asked for {}, got {}",
                    key,
                    snapshot.key()
                )));
            }
            self.load_snapshot(snapshot)?;
            loaded += 1;
        }
        if loaded > 0 {
            debug!(records = loaded, "resync complete");
        }
        Ok(loaded)
    }

    /// Drop records not reachable from any of `scopes`. Records with
    /// writes in flight are kept.
    pub fn evict_unreachable(&self, scopes: &[ScopeKey]) -> usize {
        let mut state = self.state.write();
        let mut keep: HashSet<RecordKey> = state.confirmed.keys().cloned().collect();

        for scope in scopes {
            let Some(owner) = scope.owner_key() else {
                keep.extend(
                    state
                        .records
                        .keys()
                        .filter(|k| k.record_type == scope.record_type)
                        .cloned(),
                );
                continue;
            };
            let Ok(assoc) = self.schema.association(&owner.record_type, &scope.name) else {
                continue;
            };
            if let Some(through) = &assoc.through {
                let joins = state.views.members(&owner, &through.via);
                keep.extend(joins.iter().cloned());
                if let Ok(members) = self.schema.through_members(assoc, joins, |k| {
                    state.records.get(k).filter(|m| !m.stub).map(|m| &m.attributes)
                }) {
                    keep.extend(members);
                }
            }
            keep.extend(state.views.members(&owner, &scope.name).iter().cloned());
            keep.insert(owner);
        }

        let evict: Vec<RecordKey> = state
            .records
            .keys()
            .filter(|k| !keep.contains(*k))
            .cloned()
            .collect();
        for key in &evict {
            state.records.remove(key);
            state.applied.remove(key);
            state.resync.remove(key);
            state.views.remove_owner(key);
            state.views.remove_everywhere(key);
        }
        if !evict.is_empty() {
            debug!(records = evict.len(), "evicted unreachable records");
        }
        evict.len()
    }

    /// A loaded record (stubs are not returned).
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.state
            .read()
            .displayed(key)
            .map(|attributes| Record::new(key.clone(), attributes))
    }

    pub fn is_stub(&self, key: &RecordKey) -> bool {
        self.state.read().records.get(key).is_some_and(|m| m.stub)
    }

    /// Members of a collection on `owner` as currently mirrored.
    pub fn collection(&self, owner: &RecordKey, name: &str) -> Result<Vec<RecordKey>> {
        let assoc = self.schema.association(&owner.record_type, name)?;
        let state = self.state.read();
        match &assoc.through {
            Some(through) => {
                let joins = state.views.members(owner, &through.via);
                self.schema.through_members(assoc, joins, |k| {
                    state.records.get(k).filter(|m| !m.stub).map(|m| &m.attributes)
                })
            }
            None => Ok(state.views.members(owner, name).to_vec()),
        }
    }

    pub fn applied_sequence(&self, key: &RecordKey) -> Sequence {
        self.state
            .read()
            .applied
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Last applied sequence of every record, for a resuming subscribe.
    pub fn cursors(&self) -> BTreeMap<RecordKey, Sequence> {
        self.state
            .read()
            .applied
            .iter()
            .map(|(k, s)| (k.clone(), *s))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn needs_resync(&self) -> Vec<RecordKey> {
        self.state.read().resync.iter().cloned().collect()
    }

    /// Loaded records and stubs.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AssociationDef, TypeDef};
    use serde_json::json;
    use std::time::Duration;

    fn attrs(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new()
                .with(
                    TypeDef::new("Picture")
                        .attributes(["name", "imageable_id", "imageable_type"])
                        .association(AssociationDef::belongs_to_polymorphic("imageable")),
                )
                .with(TypeDef::new("Employee").association(
                    AssociationDef::has_many("pictures", "Picture").inverse_of("imageable"),
                ))
                .with(TypeDef::new("Product").association(
                    AssociationDef::has_many("pictures", "Picture").inverse_of("imageable"),
                )),
        )
    }

    fn client() -> ClientStore {
        ClientStore::new(schema(), ClientConfig::default())
    }

    fn event(key: &RecordKey, op: ChangeOp, seq: u64, diff: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            key: key.clone(),
            op,
            diff: attrs(diff),
            collections: Vec::new(),
            sequence: Sequence(seq),
            origin: None,
            correlation: None,
        }
    }

    fn seeded() -> (ClientStore, RecordKey, RecordKey, RecordKey, RecordKey) {
        let client = client();
        let emp = RecordKey::new("Employee", 1);
        let prod = RecordKey::new("Product", 2);
        let p11 = RecordKey::new("Picture", 11);
        let p12 = RecordKey::new("Picture", 12);
        client.apply(&event(&emp, ChangeOp::Create, 1, json!({"name": "e"}))).unwrap();
        client.apply(&event(&prod, ChangeOp::Create, 1, json!({"name": "p"}))).unwrap();
        for p in [&p11, &p12] {
            client
                .apply(&event(p, ChangeOp::Create, 1, json!({"imageable_id": 1, "imageable_type": "Employee"})))
                .unwrap();
        }
        (client, emp, prod, p11, p12)
    }

    #[test]
    fn test_create_links_into_owner_view() {
        let (client, emp, _, p11, p12) = seeded();
        assert_eq!(client.collection(&emp, "pictures").unwrap(), vec![p11, p12]);
    }

    #[test]
    fn test_reassignment_moves_between_views() {
        let (client, emp, prod, p11, p12) = seeded();
        let result = client
            .apply(&event(&p12, ChangeOp::Update, 2, json!({"imageable_id": 2, "imageable_type": "Product"})))
            .unwrap();
        assert_eq!(result, ApplyResult::Applied);
        assert_eq!(client.collection(&emp, "pictures").unwrap(), vec![p11]);
        assert_eq!(client.collection(&prod, "pictures").unwrap(), vec![p12]);
    }

    #[test]
    fn test_type_only_change_is_a_reassignment() {
        let client = client();
        let emp = RecordKey::new("Employee", 1);
        let prod = RecordKey::new("Product", 1);
        let pic = RecordKey::new("Picture", 5);
        client
            .apply(&event(&pic, ChangeOp::Create, 1, json!({"imageable_id": 1, "imageable_type": "Employee"})))
            .unwrap();
        assert!(client.is_stub(&emp));

        client
            .apply(&event(&pic, ChangeOp::Update, 2, json!({"imageable_type": "Product"})))
            .unwrap();
        assert!(client.collection(&emp, "pictures").unwrap().is_empty());
        assert_eq!(client.collection(&prod, "pictures").unwrap(), vec![pic]);
    }

    #[test]
    fn test_replay_is_noop() {
        let (client, emp, _, _, p12) = seeded();
        let moved = event(&p12, ChangeOp::Update, 2, json!({"imageable_id": 2, "imageable_type": "Product"}));
        client.apply(&moved).unwrap();
        let back = event(&p12, ChangeOp::Update, 3, json!({"imageable_id": 1, "imageable_type": "Employee"}));
        client.apply(&back).unwrap();

        assert_eq!(client.apply(&moved).unwrap(), ApplyResult::Duplicate);
        assert_eq!(client.collection(&emp, "pictures").unwrap().len(), 2);
        assert_eq!(client.applied_sequence(&p12), Sequence(3));
    }

    #[test]
    fn test_gap_requests_resync() {
        let (client, emp, _, _, p12) = seeded();
        let result = client
            .apply(&event(&p12, ChangeOp::Update, 4, json!({"name": "x"})))
            .unwrap();
        assert_eq!(result, ApplyResult::ResyncRequired(vec![p12.clone(), emp]));
        assert_eq!(client.get(&p12).unwrap().get("name"), None);
        assert_eq!(client.applied_sequence(&p12), Sequence(1));

        struct Fixed;
        impl ResyncSource for Fixed {
            fn fetch(&self, key: &RecordKey) -> Result<RecordSnapshot> {
                let mut snapshot = RecordSnapshot::missing(key, Sequence(4));
                if key.record_type == "Picture" {
                    snapshot.exists = true;
                    snapshot.attrs = serde_json::from_value(
                        json!({"name": "x", "imageable_id": 1, "imageable_type": "Employee"}),
                    )
                    .unwrap();
                } else {
                    snapshot.exists = true;
                    snapshot.sequence = Sequence(3);
                }
                Ok(snapshot)
            }
        }
        assert_eq!(client.resync(&Fixed).unwrap(), 2);
        assert_eq!(client.get(&p12).unwrap().get("name"), Some(&json!("x")));
        assert_eq!(client.applied_sequence(&p12), Sequence(4));
        assert!(client.needs_resync().is_empty());
    }

    #[test]
    fn test_destroy_cascades_out_of_views() {
        let (client, emp, _, p11, p12) = seeded();
        client.apply(&event(&p12, ChangeOp::Destroy, 2, json!({}))).unwrap();
        assert_eq!(client.get(&p12), None);
        assert_eq!(client.collection(&emp, "pictures").unwrap(), vec![p11]);
    }

    #[test]
    fn test_optimistic_create_rolled_back() {
        let (client, emp, _, p11, p12) = seeded();
        let request = client
            .write(LocalWrite::create(
                "Picture",
                attrs(json!({"name": "new", "imageable_id": 1, "imageable_type": "Employee"})),
            ))
            .unwrap();
        assert_eq!(request.record_id, None);
        assert_eq!(client.collection(&emp, "pictures").unwrap().len(), 3);
        assert_eq!(client.pending_count(), 1);

        let rejection = client
            .reject(&request.correlation_id, RejectReason::PolicyDenied)
            .unwrap()
            .unwrap();
        assert!(rejection.key.id.is_provisional());
        assert_eq!(client.get(&rejection.key), None);
        assert_eq!(client.collection(&emp, "pictures").unwrap(), vec![p11, p12]);
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_optimistic_reassignment_rolled_back() {
        let (client, emp, prod, p11, p12) = seeded();
        let request = client
            .write(LocalWrite::update(&p12, attrs(json!({"imageable_id": 2, "imageable_type": "Product"}))))
            .unwrap();
        assert_eq!(client.collection(&prod, "pictures").unwrap(), vec![p12.clone()]);

        client.reject(&request.correlation_id, RejectReason::Validation).unwrap();
        assert_eq!(client.collection(&emp, "pictures").unwrap(), vec![p11, p12.clone()]);
        assert!(client.collection(&prod, "pictures").unwrap().is_empty());
        assert_eq!(client.get(&p12).unwrap().get("imageable_type"), Some(&json!("Employee")));
    }

    #[test]
    fn test_confirmation_replaces_speculative_state() {
        let (client, emp, _, _, _) = seeded();
        let request = client
            .write(LocalWrite::create(
                "Picture",
                attrs(json!({"name": "new", "imageable_id": 1, "imageable_type": "Employee"})),
            ))
            .unwrap();

        let server_key = RecordKey::new("Picture", 13);
        let mut confirmation = event(
            &server_key,
            ChangeOp::Create,
            1,
            json!({"name": "new", "imageable_id": 1, "imageable_type": "Employee"}),
        );
        confirmation.correlation = Some(request.correlation_id.clone());
        assert_eq!(
            client.apply(&confirmation).unwrap(),
            ApplyResult::Confirmed(request.correlation_id)
        );
        let pictures = client.collection(&emp, "pictures").unwrap();
        assert_eq!(pictures.len(), 3);
        assert_eq!(pictures[2], server_key);
        assert!(pictures.iter().all(|k| !k.id.is_provisional()));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_broadcast_during_pending_write_is_kept() {
        let (client, _, _, _, p12) = seeded();
        let request = client
            .write(LocalWrite::update(&p12, attrs(json!({"name": "mine"}))))
            .unwrap();
        client
            .apply(&event(&p12, ChangeOp::Update, 2, json!({"name": "theirs", "imageable_id": 1})))
            .unwrap();
        assert_eq!(client.get(&p12).unwrap().get("name"), Some(&json!("mine")));

        client.reject(&request.correlation_id, RejectReason::PolicyDenied).unwrap();
        assert_eq!(client.get(&p12).unwrap().get("name"), Some(&json!("theirs")));
    }

    #[test]
    fn test_timeout_and_disconnect_roll_back() {
        let (client, _, _, _, p12) = seeded();
        client
            .write(LocalWrite::update(&p12, attrs(json!({"name": "a"}))))
            .unwrap();
        assert!(client.expire_pending(Instant::now()).unwrap().is_empty());
        let expired = client
            .expire_pending(Instant::now() + Duration::from_secs(11))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reason, RejectReason::Timeout);

        client.write(LocalWrite::destroy(&p12)).unwrap();
        assert_eq!(client.get(&p12), None);
        let discarded = client.discard_pending().unwrap();
        assert_eq!(discarded[0].reason, RejectReason::Disconnected);
        assert!(client.get(&p12).is_some());
    }

    #[test]
    fn test_write_validation() {
        let (client, _, _, _, p12) = seeded();
        assert!(matches!(
            client.write(LocalWrite::update(&p12, attrs(json!({"bogus": 1})))),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            client.write(LocalWrite::update(&RecordKey::new("Picture", 99), Attributes::new())),
            Err(SyncError::RecordNotFound(_))
        ));
        assert!(matches!(
            client.write(LocalWrite::create(
                "Picture",
                attrs(json!({"imageable_id": 1, "imageable_type": "Nope"}))
            )),
            Err(SyncError::MalformedEvent(_))
        ));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_evict_unreachable() {
        let (client, emp, prod, _, p12) = seeded();
        client
            .apply(&event(&p12, ChangeOp::Update, 2, json!({"imageable_id": 2, "imageable_type": "Product"})))
            .unwrap();
        let evicted = client.evict_unreachable(&[ScopeKey::relation(&emp, "pictures")]);
        assert_eq!(evicted, 2);
        assert!(client.get(&prod).is_none());
        assert!(client.get(&p12).is_none());
        assert_eq!(client.collection(&emp, "pictures").unwrap().len(), 1);
    }
}
