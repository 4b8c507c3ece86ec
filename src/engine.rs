//! The server-side engine tying registry, policy, tracker, dispatcher and
//! sessions together.

use crate::client::ResyncSource;
use crate::dispatch::{BroadcastDispatcher, DispatchStats};
use crate::error::{Result, SyncError};
use crate::policy::{Decision, Operation, PolicyConfig, PolicyEvaluator};
use crate::protocol::{
    ClientMessage, RecordSnapshot, RejectMessage, ServerMessage, SubscribeRequest,
    UnsubscribeRequest, WriteRequest,
};
use crate::registry::{RecordStore, SchemaRegistry};
use crate::scope::{ScopeFacet, ScopeRegulator};
use crate::sessions::{
    CheckpointStore, Delivery, Resumed, SessionHandle, SessionRegistry, DEFAULT_QUEUE_DEPTH,
    DEFAULT_RECONNECT_GRACE,
};
use crate::tracker::{ChangeTracker, Mutation};
use crate::types::{
    Attributes, ChangeEvent, ChangeOp, Identity, Record, RecordKey, ScopeKey, Sequence,
    SessionId,
};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine configuration, built once and passed by reference.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Required. `Engine::new` fails without it.
    pub policy: Option<PolicyConfig>,

    /// Max queued messages per session before it is marked for full resync.
    /// Default: 1000
    pub queue_depth: usize,

    /// How long a disconnected session keeps its checkpoint.
    /// Default: 30 seconds
    pub reconnect_grace: Duration,

    /// Where stale-session checkpoints are persisted (None = memory only).
    pub checkpoint_dir: Option<PathBuf>,

    /// Scope regulator cache entries.
    /// Default: 256
    pub scope_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            checkpoint_dir: None,
            scope_cache_size: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_policy(policy: PolicyConfig) -> Self {
        Self {
            policy: Some(policy),
            ..Default::default()
        }
    }
}

/// What a subscribe request produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub session: SessionId,
    pub scope: ScopeKey,
    /// Full snapshot rather than gap fill.
    pub full: bool,
    /// Snapshots queued for the session.
    pub snapshots: usize,
}

/// The authoritative side of synchronization.
pub struct Engine {
    store: Arc<RecordStore>,
    policy: Arc<PolicyEvaluator>,
    scopes: Arc<ScopeRegulator>,
    sessions: Arc<SessionRegistry>,
    tracker: ChangeTracker,
    dispatcher: BroadcastDispatcher,
}

impl Engine {
    /// Build an engine. A missing or empty policy is a fatal
    /// [`SyncError::ConfigurationMissing`].
    pub fn new(schema: SchemaRegistry, config: &EngineConfig) -> Result<Self> {
        let policy_config = config.policy.as_ref().ok_or_else(|| {
            SyncError::ConfigurationMissing("no policy configured".to_string())
        })?;
        let policy = Arc::new(PolicyEvaluator::new(policy_config)?);
        schema.check()?;

        let schema = Arc::new(schema);
        let store = Arc::new(RecordStore::new(Arc::clone(&schema)));
        let scopes = Arc::new(ScopeRegulator::new(
            Arc::clone(&policy),
            config.scope_cache_size,
        ));
        let mut sessions = SessionRegistry::new(config.queue_depth, config.reconnect_grace);
        if let Some(dir) = &config.checkpoint_dir {
            sessions = sessions.with_checkpoints(CheckpointStore::open(dir)?)?;
        }
        let sessions = Arc::new(sessions);
        let dispatcher = BroadcastDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&policy),
            Arc::clone(&scopes),
            Arc::clone(&sessions),
        );

        info!(
            types = schema.type_names().count(),
            epoch = policy.epoch(),
            "engine started"
        );

        Ok(Self {
            store,
            policy,
            scopes,
            sessions,
            tracker: ChangeTracker::new(schema),
            dispatcher,
        })
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn policy(&self) -> &PolicyEvaluator {
        &self.policy
    }

    pub fn scopes(&self) -> &ScopeRegulator {
        &self.scopes
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn last_sequence(&self, key: &RecordKey) -> Sequence {
        self.tracker.last_sequence(key)
    }

    /// Install a new policy epoch.
    pub fn reload_policy(&self, config: &PolicyConfig) -> Result<u64> {
        self.policy.reload(config)
    }

    // --- Sessions ---

    /// Open a session if the connection rules admit `identity`.
    pub fn connect(&self, identity: Identity) -> Result<SessionHandle> {
        if self.policy.admit(&identity).is_deny() {
            debug!(user = ?identity.user, "connection refused");
            return Err(SyncError::PolicyDenied {
                reason: "connection refused".to_string(),
                correlation: None,
            });
        }
        Ok(self.sessions.open(identity))
    }

    /// Transport closed. Delivery stops; the session can resume within the
    /// grace window.
    pub fn disconnect(&self, session: SessionId) -> Result<()> {
        self.sessions.mark_stale(session, Instant::now())
    }

    /// Resume by token, or open a fresh session that must be fully
    /// resynced (`gap_fill == false`).
    pub fn reconnect(&self, token: &str, identity: Identity) -> Result<Resumed> {
        if let Some(resumed) = self.sessions.resume(token, Instant::now())? {
            let stored = self.sessions.identity(resumed.handle.id)?;
            if self.policy.admit(&stored).is_deny() {
                self.sessions.prune(resumed.handle.id)?;
                return Err(SyncError::PolicyDenied {
                    reason: "connection refused".to_string(),
                    correlation: None,
                });
            }
            return Ok(resumed);
        }
        Ok(Resumed {
            handle: self.connect(identity)?,
            gap_fill: false,
        })
    }

    /// Prune sessions whose grace window has run out.
    pub fn sweep(&self) -> Result<Vec<SessionId>> {
        self.sessions.sweep(Instant::now())
    }

    fn session_for(&self, token: &str) -> Result<SessionId> {
        self.sessions
            .session_for_token(token)
            .ok_or_else(|| SyncError::InvalidOperation("unknown session token".to_string()))
    }

    fn check_scope(&self, scope: &ScopeKey) -> Result<()> {
        match scope.owner {
            Some(_) => {
                self.store.schema().association(&scope.record_type, &scope.name)?;
            }
            None => {
                self.store.schema().type_def(&scope.record_type)?;
            }
        }
        if !self
            .scopes
            .is_facet_exposed(&scope.record_type, &scope.name, ScopeFacet::Traverse)
        {
            return Err(SyncError::ScopeNotExposed(scope.clone()));
        }
        Ok(())
    }

    /// Queue the current state of `key` for a session, under the record's
    /// lock so no delta for it can slip in between. `None` when the record
    /// is hidden from the session and `skip_denied` is set.
    fn queue_snapshot(
        &self,
        session: SessionId,
        identity: &Identity,
        key: &RecordKey,
        skip_denied: bool,
    ) -> Result<Option<Delivery>> {
        self.tracker.with_sequence(key, |sequence| {
            let decision = match self.store.get(key) {
                Some(record) => self.policy.evaluate(identity, &record, Operation::Read, None),
                None => Decision::Deny,
            };
            if decision.is_deny() && skip_denied {
                return Ok(None);
            }
            let snapshot = self.dispatcher.snapshot_for(key, &decision, sequence);
            let delivery = self.sessions.send(session, ServerMessage::Snapshot(snapshot));
            if delivery == Delivery::Sent {
                self.sessions.record_delivery(session, key, sequence)?;
            }
            Ok(Some(delivery))
        })
    }

    /// Subscribe a session to a scope.
    ///
    /// With `resume_from_seq` and a session that has not lost deltas, only
    /// records whose sequence moved past what the client holds are sent.
    /// Otherwise every record in the scope is sent as a snapshot.
    pub fn subscribe(&self, request: &SubscribeRequest) -> Result<SubscribeOutcome> {
        let session = self.session_for(&request.session_token)?;
        self.check_scope(&request.scope)?;
        self.sessions.subscribe(session, request.scope.clone())?;
        let identity = self.sessions.identity(session)?;

        let full = request.resume_from_seq.is_none() || self.sessions.needs_full_resync(session)?;
        let in_scope = self.store.keys_in_scope(&request.scope)?;
        let keys: Vec<&RecordKey> = match (&request.resume_from_seq, full) {
            (Some(held), false) => {
                let candidates: BTreeSet<&RecordKey> = in_scope.iter().chain(held.keys()).collect();
                candidates
                    .into_iter()
                    .filter(|key| {
                        let client_has = held.get(*key).copied().unwrap_or_default();
                        self.tracker.last_sequence(key) > client_has
                    })
                    .collect()
            }
            _ => in_scope.iter().collect(),
        };

        let mut snapshots = 0;
        for key in keys {
            match self.queue_snapshot(session, &identity, key, full)? {
                Some(Delivery::Sent) => snapshots += 1,
                Some(delivery) => {
                    // The session must reconnect and start over.
                    warn!(session = %session, ?delivery, "snapshot not queued, subscribe incomplete");
                    return Err(SyncError::InvalidOperation(format!(
                        "session {} cannot take snapshots",
                        session
                    )));
                }
                None => {}
            }
        }
        if full {
            self.sessions.resynced(session)?;
        }

        info!(session = %session, scope = %request.scope, full, snapshots, "subscribed");
        Ok(SubscribeOutcome {
            session,
            scope: request.scope.clone(),
            full,
            snapshots,
        })
    }

    /// Drop a scope, and the cursors of records no remaining scope reaches.
    pub fn unsubscribe(&self, request: &UnsubscribeRequest) -> Result<bool> {
        let session = self.session_for(&request.session_token)?;
        if !self.sessions.unsubscribe(session, &request.scope)? {
            return Ok(false);
        }
        let scopes = self.sessions.scopes(session)?;
        let unreached: Vec<RecordKey> = self
            .sessions
            .cursor_keys(session)?
            .into_iter()
            .filter(|key| !scopes.iter().any(|scope| self.dispatcher.scope_reaches(scope, key)))
            .collect();
        self.sessions.forget_cursors(session, &unreached)?;
        Ok(true)
    }

    /// Current state of one record as `session` may see it. The session's
    /// cursor moves to the snapshot's sequence.
    pub fn snapshot(&self, session: SessionId, key: &RecordKey) -> Result<RecordSnapshot> {
        let identity = self.sessions.identity(session)?;
        self.tracker.with_sequence(key, |sequence| {
            let decision = match self.store.get(key) {
                Some(record) => self.policy.evaluate(&identity, &record, Operation::Read, None),
                None => Decision::Deny,
            };
            self.sessions.record_delivery(session, key, sequence)?;
            Ok(self.dispatcher.snapshot_for(key, &decision, sequence))
        })
    }

    /// Snapshots for one session, for [`crate::client::ClientStore::resync`].
    pub fn resync_source(&self, session: SessionId) -> SessionResync<'_> {
        SessionResync {
            engine: self,
            session,
        }
    }

    // --- Remote queries ---

    /// Number of records in a scope; needs the `count` facet.
    pub fn count(&self, scope: &ScopeKey) -> Result<usize> {
        if !self
            .scopes
            .is_facet_exposed(&scope.record_type, &scope.name, ScopeFacet::Count)
        {
            return Err(SyncError::ScopeNotExposed(scope.clone()));
        }
        Ok(self.members(scope)?.len())
    }

    /// Keys in a scope that `session` may see; needs the `ids` facet.
    pub fn ids(&self, session: SessionId, scope: &ScopeKey) -> Result<Vec<RecordKey>> {
        if !self
            .scopes
            .is_facet_exposed(&scope.record_type, &scope.name, ScopeFacet::Ids)
        {
            return Err(SyncError::ScopeNotExposed(scope.clone()));
        }
        let identity = self.sessions.identity(session)?;
        Ok(self
            .members(scope)?
            .into_iter()
            .filter(|key| {
                self.store.get(key).is_some_and(|record| {
                    !self
                        .policy
                        .evaluate(&identity, &record, Operation::Read, None)
                        .is_deny()
                })
            })
            .collect())
    }

    fn members(&self, scope: &ScopeKey) -> Result<Vec<RecordKey>> {
        match scope.owner_key() {
            Some(owner) => self.store.collection(&owner, &scope.name),
            None => self.store.keys_in_scope(scope),
        }
    }

    // --- Writes ---

    /// Handle any client message. Refused writes are answered with a
    /// `reject` message and are not errors here.
    pub fn handle_message(&self, session: SessionId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Subscribe(request) => self.subscribe(&request).map(|_| ()),
            ClientMessage::Unsubscribe(request) => self.unsubscribe(&request).map(|_| ()),
            ClientMessage::Write(request) => match self.handle_write(session, request) {
                Ok(_) => Ok(()),
                Err(e) if e.reject_reason().is_some() => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Apply a session-originated write, subject to change permission.
    ///
    /// On refusal the originator is sent a `reject` carrying the write's
    /// correlation id, and the error is returned.
    pub fn handle_write(&self, session: SessionId, request: WriteRequest) -> Result<Vec<ChangeEvent>> {
        let correlation = request.correlation_id.clone();
        let result = self.try_write(session, request);
        if let Err(error) = &result {
            if let Some(reason_kind) = error.reject_reason() {
                warn!(session = %session, correlation = %correlation, error = %error, "write rejected");
                let delivery = self.sessions.send(
                    session,
                    ServerMessage::Reject(RejectMessage {
                        correlation_id: correlation,
                        reason_kind,
                        detail: Some(error.to_string()),
                    }),
                );
                if delivery != Delivery::Sent {
                    debug!(session = %session, ?delivery, "reject not queued");
                }
            }
        }
        result
    }

    fn try_write(&self, session: SessionId, request: WriteRequest) -> Result<Vec<ChangeEvent>> {
        let identity = self.sessions.identity(session)?;
        let schema = self.store.schema();
        schema.type_def(&request.record_type)?;
        let op = request.change_op;
        let key = match (op, request.key()) {
            (_, Some(key)) => key,
            (ChangeOp::Create, None) => self.store.allocate_key(&request.record_type)?,
            (op, None) => {
                return Err(SyncError::Validation(format!(
                    "{} of {} needs a record id",
                    op, request.record_type
                )))
            }
        };
        if op != ChangeOp::Destroy {
            schema.validate(&request.record_type, &request.attrs)?;
        }

        // Judge the state before and the state the write would produce.
        let subjects = match op {
            ChangeOp::Create => vec![Record::new(key.clone(), request.attrs.clone())],
            ChangeOp::Update => {
                let current = self
                    .store
                    .get(&key)
                    .ok_or_else(|| SyncError::RecordNotFound(key.clone()))?;
                let mut proposed = current.clone();
                proposed.attributes.extend(request.attrs.clone());
                vec![current, proposed]
            }
            ChangeOp::Destroy => vec![self
                .store
                .get(&key)
                .ok_or_else(|| SyncError::RecordNotFound(key.clone()))?],
        };
        // Writing never reaches past what the session may read.
        let policy = self.policy.snapshot();
        for subject in &subjects {
            let decision = policy
                .evaluate(&identity, subject, Operation::Read, None)
                .narrow(&policy.evaluate(&identity, subject, Operation::from(op), None));
            let refused = decision.is_deny()
                || request.attrs.keys().any(|attribute| !decision.allows(attribute));
            if refused {
                return Err(SyncError::PolicyDenied {
                    reason: format!("{} of {} not permitted", op, key),
                    correlation: Some(request.correlation_id.clone()),
                });
            }
        }

        let mutation = Mutation::new(key, op).from_session(session, Some(request.correlation_id));
        self.commit(mutation, request.attrs)
    }

    fn commit(&self, mutation: Mutation, attrs: Attributes) -> Result<Vec<ChangeEvent>> {
        let key = mutation.key.clone();
        match mutation.op {
            ChangeOp::Create => self
                .tracker
                .commit(mutation, &self.dispatcher, || self.store.create(&key, attrs)),
            ChangeOp::Update => self
                .tracker
                .commit(mutation, &self.dispatcher, || self.store.update(&key, attrs)),
            ChangeOp::Destroy => {
                let mut seen = HashSet::new();
                self.destroy_cascade(mutation, &mut seen)
            }
        }
    }

    /// Destroy dependents first, each as its own event, then the record.
    fn destroy_cascade(
        &self,
        mutation: Mutation,
        seen: &mut HashSet<RecordKey>,
    ) -> Result<Vec<ChangeEvent>> {
        let key = mutation.key.clone();
        seen.insert(key.clone());
        let mut events = Vec::new();
        for dependent in self.store.dependents(&key)? {
            if seen.contains(&dependent) || !self.store.exists(&dependent) {
                continue;
            }
            let mut cascade = Mutation::new(dependent, ChangeOp::Destroy);
            cascade.origin = mutation.origin;
            events.extend(self.destroy_cascade(cascade, seen)?);
        }
        events.extend(
            self.tracker
                .commit(mutation, &self.dispatcher, || self.store.destroy(&key))?,
        );
        Ok(events)
    }

    // --- Internal writes (no session, no change permission) ---

    /// Create a record with the next free id.
    pub fn create(&self, record_type: &str, attrs: Attributes) -> Result<RecordKey> {
        let key = self.store.allocate_key(record_type)?;
        self.create_at(&key, attrs)?;
        Ok(key)
    }

    /// Create a record under a chosen key.
    pub fn create_at(&self, key: &RecordKey, attrs: Attributes) -> Result<Vec<ChangeEvent>> {
        self.store.schema().validate(&key.record_type, &attrs)?;
        self.commit(Mutation::new(key.clone(), ChangeOp::Create), attrs)
    }

    pub fn update(&self, key: &RecordKey, attrs: Attributes) -> Result<Vec<ChangeEvent>> {
        self.store.schema().validate(&key.record_type, &attrs)?;
        self.commit(Mutation::new(key.clone(), ChangeOp::Update), attrs)
    }

    pub fn destroy(&self, key: &RecordKey) -> Result<Vec<ChangeEvent>> {
        self.commit(Mutation::new(key.clone(), ChangeOp::Destroy), Attributes::new())
    }
}

/// Serves a client's resync requests from the engine on behalf of one
/// session.
pub struct SessionResync<'a> {
    engine: &'a Engine,
    session: SessionId,
}

impl ResyncSource for SessionResync<'_> {
    fn fetch(&self, key: &RecordKey) -> Result<RecordSnapshot> {
        self.engine.snapshot(self.session, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Predicate;
    use crate::protocol::RejectReason;
    use crate::registry::{AssociationDef, TypeDef};
    use crate::types::CorrelationId;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn schema() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                TypeDef::new("Picture")
                    .association(AssociationDef::belongs_to_polymorphic("imageable")),
            )
            .with(
                TypeDef::new("Employee").association(
                    AssociationDef::has_many("pictures", "Picture")
                        .inverse_of("imageable")
                        .dependent_destroy(),
                ),
            )
    }

    fn policy() -> PolicyConfig {
        PolicyConfig::new()
            .always_allow_connection()
            .regulate_all_broadcasts_send_all()
            .allow_change_to(["Picture"], [ChangeOp::Create, ChangeOp::Update])
            .regulate_scope("Employee", ["pictures"], Decision::AllowFull)
            .regulate_scope("Picture", ["all"], Decision::partial(["count"]))
    }

    fn engine() -> Engine {
        Engine::new(schema(), &EngineConfig::with_policy(policy())).unwrap()
    }

    #[test]
    fn test_missing_policy_is_fatal() {
        assert!(matches!(
            Engine::new(schema(), &EngineConfig::default()),
            Err(SyncError::ConfigurationMissing(_))
        ));
        assert!(matches!(
            Engine::new(schema(), &EngineConfig::with_policy(PolicyConfig::new())),
            Err(SyncError::ConfigurationMissing(_))
        ));
    }

    #[test]
    fn test_subscribe_sends_scope_snapshot() {
        let engine = engine();
        let emp = engine.create("Employee", attrs(json!({"name": "e"}))).unwrap();
        let pic = engine
            .create("Picture", attrs(json!({"imageable_id": emp.id.0, "imageable_type": "Employee"})))
            .unwrap();

        let handle = engine.connect(Identity::user("u")).unwrap();
        let outcome = engine
            .subscribe(&SubscribeRequest {
                scope: ScopeKey::relation(&emp, "pictures"),
                session_token: handle.token.clone(),
                resume_from_seq: None,
            })
            .unwrap();
        assert!(outcome.full);
        assert_eq!(outcome.snapshots, 2);
        assert_eq!(engine.sessions().cursor(handle.id, &pic), Some(Sequence(1)));
        assert_eq!(handle.drain().len(), 2);
    }

    #[test]
    fn test_unexposed_scope_refused() {
        let engine = engine();
        let handle = engine.connect(Identity::anonymous()).unwrap();
        let result = engine.subscribe(&SubscribeRequest {
            scope: ScopeKey::all("Picture"),
            session_token: handle.token.clone(),
            resume_from_seq: None,
        });
        assert!(matches!(result, Err(SyncError::ScopeNotExposed(_))));
    }

    #[test]
    fn test_count_and_ids_facets() {
        let engine = engine();
        engine.create("Picture", Attributes::new()).unwrap();
        engine.create("Picture", Attributes::new()).unwrap();
        let handle = engine.connect(Identity::anonymous()).unwrap();

        assert_eq!(engine.count(&ScopeKey::all("Picture")).unwrap(), 2);
        assert!(matches!(
            engine.ids(handle.id, &ScopeKey::all("Picture")),
            Err(SyncError::ScopeNotExposed(_))
        ));
    }

    #[test]
    fn test_denied_write_is_rejected_to_originator() {
        let engine = engine();
        let handle = engine.connect(Identity::user("u")).unwrap();
        let result = engine.handle_write(
            handle.id,
            WriteRequest {
                record_type: "Employee".into(),
                record_id: None,
                change_op: ChangeOp::Create,
                attrs: attrs(json!({"name": "x"})),
                correlation_id: CorrelationId::new("c1"),
            },
        );
        assert!(matches!(result, Err(SyncError::PolicyDenied { .. })));
        assert!(engine.store().is_empty());
        match handle.try_recv().unwrap() {
            ServerMessage::Reject(reject) => {
                assert_eq!(reject.correlation_id, CorrelationId::new("c1"));
                assert_eq!(reject.reason_kind, RejectReason::PolicyDenied);
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_write_needs_read_access() {
        let policy = PolicyConfig::new()
            .always_allow_connection()
            .regulate_broadcast(Predicate::record_types(["Employee"]), Decision::AllowFull)
            .allow_change_to(["Picture"], [ChangeOp::Create]);
        let engine = Engine::new(schema(), &EngineConfig::with_policy(policy)).unwrap();
        let handle = engine.connect(Identity::user("u")).unwrap();

        let result = engine.handle_write(
            handle.id,
            WriteRequest {
                record_type: "Picture".into(),
                record_id: None,
                change_op: ChangeOp::Create,
                attrs: attrs(json!({"name": "x"})),
                correlation_id: CorrelationId::new("c1"),
            },
        );
        assert!(matches!(result, Err(SyncError::PolicyDenied { .. })));
        assert!(engine.store().is_empty());
        // Refused outright, so the writer is never left waiting.
        assert!(matches!(handle.try_recv().unwrap(), ServerMessage::Reject(_)));
    }

    #[test]
    fn test_unsubscribe_forgets_cursors_of_unreached_records() {
        let engine = engine();
        let emp = engine.create("Employee", Attributes::new()).unwrap();
        let pic = engine
            .create("Picture", attrs(json!({"imageable_id": emp.id.0, "imageable_type": "Employee"})))
            .unwrap();
        let handle = engine.connect(Identity::user("u")).unwrap();
        let scope = ScopeKey::relation(&emp, "pictures");
        engine
            .subscribe(&SubscribeRequest {
                scope: scope.clone(),
                session_token: handle.token.clone(),
                resume_from_seq: None,
            })
            .unwrap();
        handle.drain();

        assert!(engine
            .unsubscribe(&UnsubscribeRequest {
                scope,
                session_token: handle.token.clone(),
            })
            .unwrap());
        assert_eq!(engine.sessions().cursor(handle.id, &pic), None);
        assert_eq!(engine.sessions().cursor(handle.id, &emp), None);

        engine.update(&pic, attrs(json!({"name": "after"}))).unwrap();
        assert!(handle.drain().is_empty());
    }

    #[test]
    fn test_dependent_destroy_cascades() {
        let engine = engine();
        let emp = engine.create("Employee", Attributes::new()).unwrap();
        for _ in 0..2 {
            engine
                .create("Picture", attrs(json!({"imageable_id": emp.id.0, "imageable_type": "Employee"})))
                .unwrap();
        }
        let events = engine.destroy(&emp).unwrap();
        assert!(engine.store().is_empty());
        let destroys: Vec<_> = events
            .iter()
            .filter(|e| e.op == ChangeOp::Destroy)
            .map(|e| e.key.clone())
            .collect();
        assert_eq!(destroys.len(), 3);
        assert_eq!(destroys.last(), Some(&emp));
    }
}
