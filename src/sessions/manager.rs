//! Session registry: live and stale sessions, their scopes and delivery
//! cursors.

use super::checkpoint::CheckpointStore;
use super::types::{Candidate, Checkpoint, Delivery, Resumed, SessionHandle, SessionStatus};
use crate::error::{Result, SyncError};
use crate::protocol::ServerMessage;
use crate::types::{Identity, RecordKey, ScopeKey, Sequence, SessionId, Timestamp};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default bound on each session's outbound queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;

/// Default reconnect grace window.
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(30);

struct Session {
    id: SessionId,
    token: String,
    identity: Identity,
    status: SessionStatus,
    full_resync: bool,
    scopes: BTreeSet<ScopeKey>,
    cursors: BTreeMap<RecordKey, Sequence>,
    sender: Option<Sender<ServerMessage>>,
}

impl Session {
    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            session: self.id,
            token: self.token.clone(),
            identity: self.identity.clone(),
            scopes: self.scopes.clone(),
            cursors: self.cursors.clone(),
            full_resync: self.full_resync,
            saved_at: Timestamp::now(),
        }
    }

    /// Queue a message. A full queue stops incremental delivery.
    fn try_send(&mut self, message: ServerMessage) -> Delivery {
        let Some(sender) = &self.sender else {
            return Delivery::Gone;
        };
        match sender.try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.id, "outbound queue full, session needs full resync");
                self.status = SessionStatus::Overflowed;
                self.full_resync = true;
                Delivery::Overflowed
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(session = %self.id, "receiver dropped");
                self.sender = None;
                self.status = SessionStatus::Stale {
                    since: Instant::now(),
                };
                Delivery::Gone
            }
        }
    }
}

/// Tracks every session from connection until its grace window runs out.
///
/// Each session sits behind its own mutex; the map lock is only held to
/// find or insert sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    tokens: RwLock<HashMap<String, SessionId>>,
    next_id: AtomicU64,
    queue_depth: usize,
    grace: Duration,
    checkpoints: Option<CheckpointStore>,
}

impl SessionRegistry {
    pub fn new(queue_depth: usize, grace: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            grace,
            checkpoints: None,
        }
    }

    /// Persist checkpoints of stale sessions to `store`.
    ///
    /// Session ids continue after the highest one found on disk.
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Result<Self> {
        let highest = store
            .list()?
            .iter()
            .map(|c| c.session.0)
            .max()
            .unwrap_or(0);
        self.next_id = AtomicU64::new(highest + 1);
        self.checkpoints = Some(store);
        Ok(self)
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn session(&self, id: SessionId) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(SyncError::SessionNotFound(id))
    }

    fn issue_token(id: SessionId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.0.to_le_bytes());
        hasher.update(Timestamp::now().0.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    fn insert(&self, session: Session) -> SessionHandle {
        let (sender, receiver) = bounded(self.queue_depth);
        let handle = SessionHandle {
            id: session.id,
            token: session.token.clone(),
            receiver,
        };
        let mut session = session;
        session.sender = Some(sender);

        self.tokens.write().insert(session.token.clone(), session.id);
        self.sessions
            .write()
            .insert(session.id, Arc::new(Mutex::new(session)));
        handle
    }

    /// Register a new live session.
    pub fn open(&self, identity: Identity) -> SessionHandle {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let token = Self::issue_token(id);
        info!(session = %id, user = ?identity.user, "session opened");
        self.insert(Session {
            id,
            token,
            identity,
            status: SessionStatus::Live,
            full_resync: false,
            scopes: BTreeSet::new(),
            cursors: BTreeMap::new(),
            sender: None,
        })
    }

    pub fn session_for_token(&self, token: &str) -> Option<SessionId> {
        self.tokens.read().get(token).copied()
    }

    pub fn identity(&self, id: SessionId) -> Result<Identity> {
        Ok(self.session(id)?.lock().identity.clone())
    }

    pub fn status(&self, id: SessionId) -> Result<SessionStatus> {
        Ok(self.session(id)?.lock().status)
    }

    pub fn is_live(&self, id: SessionId) -> bool {
        self.session(id)
            .map(|s| s.lock().status.is_live())
            .unwrap_or(false)
    }

    /// Add a scope. Returns false if it was already subscribed.
    pub fn subscribe(&self, id: SessionId, scope: ScopeKey) -> Result<bool> {
        let session = self.session(id)?;
        let added = session.lock().scopes.insert(scope.clone());
        if added {
            debug!(session = %id, scope = %scope, "subscribed");
        }
        Ok(added)
    }

    /// Drop a scope. Cursors stay; they are only meaningful for records the
    /// client still mirrors.
    pub fn unsubscribe(&self, id: SessionId, scope: &ScopeKey) -> Result<bool> {
        let session = self.session(id)?;
        let removed = session.lock().scopes.remove(scope);
        if removed {
            debug!(session = %id, scope = %scope, "unsubscribed");
        }
        Ok(removed)
    }

    pub fn scopes(&self, id: SessionId) -> Result<BTreeSet<ScopeKey>> {
        Ok(self.session(id)?.lock().scopes.clone())
    }

    /// Transport gone: stop delivery, keep the checkpoint for the grace
    /// window.
    pub fn mark_stale(&self, id: SessionId, now: Instant) -> Result<()> {
        let session = self.session(id)?;
        let checkpoint = {
            let mut session = session.lock();
            if matches!(session.status, SessionStatus::Stale { .. }) {
                return Ok(());
            }
            session.sender = None;
            session.status = SessionStatus::Stale { since: now };
            session.checkpoint()
        };
        info!(session = %id, "session stale");
        if let Some(store) = &self.checkpoints {
            store.save(&checkpoint)?;
        }
        Ok(())
    }

    /// Bring a session back by token.
    ///
    /// Inside the grace window the session resumes with its scopes and
    /// cursors (gap fill, unless it overflowed). A checkpoint found on disk
    /// is restored the same way. Anything else is `Ok(None)`: the caller must
    /// open a fresh session and send full snapshots.
    pub fn resume(&self, token: &str, now: Instant) -> Result<Option<Resumed>> {
        if let Some(id) = self.session_for_token(token) {
            let session = self.session(id)?;
            let mut guard = session.lock();
            if guard.status.expired(now, self.grace) {
                drop(guard);
                self.prune(id)?;
                return Ok(None);
            }
            let (sender, receiver) = bounded(self.queue_depth);
            guard.sender = Some(sender);
            guard.status = SessionStatus::Live;
            let gap_fill = !guard.full_resync;
            info!(session = %id, gap_fill, "session resumed");
            return Ok(Some(Resumed {
                handle: SessionHandle {
                    id,
                    token: guard.token.clone(),
                    receiver,
                },
                gap_fill,
            }));
        }

        let Some(store) = &self.checkpoints else {
            return Ok(None);
        };
        let Some(checkpoint) = store.list()?.into_iter().find(|c| c.token == token) else {
            return Ok(None);
        };
        if checkpoint.expired(Timestamp::now(), self.grace) {
            store.purge(checkpoint.session)?;
            return Ok(None);
        }
        let gap_fill = !checkpoint.full_resync;
        info!(session = %checkpoint.session, gap_fill, "session restored from checkpoint");
        let handle = self.insert(Session {
            id: checkpoint.session,
            token: checkpoint.token,
            identity: checkpoint.identity,
            status: SessionStatus::Live,
            full_resync: checkpoint.full_resync,
            scopes: checkpoint.scopes,
            cursors: checkpoint.cursors,
            sender: None,
        });
        Ok(Some(Resumed { handle, gap_fill }))
    }

    /// Forget a session entirely, including its checkpoint.
    pub fn prune(&self, id: SessionId) -> Result<()> {
        let removed = self.sessions.write().remove(&id);
        if let Some(session) = removed {
            let token = session.lock().token.clone();
            self.tokens.write().remove(&token);
            info!(session = %id, "session pruned");
        }
        if let Some(store) = &self.checkpoints {
            store.purge(id)?;
        }
        Ok(())
    }

    /// Prune every session stale for longer than the grace window.
    pub fn sweep(&self, now: Instant) -> Result<Vec<SessionId>> {
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.lock().status.expired(now, self.grace))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.prune(*id)?;
        }
        if let Some(store) = &self.checkpoints {
            for id in store.purge_expired(Timestamp::now(), self.grace)? {
                debug!(session = %id, "expired checkpoint purged");
            }
        }
        Ok(expired)
    }

    /// Live sessions, with what the dispatcher needs to decide whether
    /// `key` concerns them.
    pub fn candidates(&self, key: &RecordKey) -> Vec<Candidate> {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions
            .iter()
            .filter_map(|session| {
                let session = session.lock();
                if !session.status.is_live() {
                    return None;
                }
                Some(Candidate {
                    id: session.id,
                    identity: session.identity.clone(),
                    scopes: session.scopes.iter().cloned().collect(),
                    cursor: session.cursors.get(key).copied(),
                })
            })
            .collect()
    }

    /// Queue a sequenced message for `key`, advancing the cursor.
    ///
    /// Anything at or below the session's cursor is a duplicate and is not
    /// queued, so a session never sees a record's sequence go backwards.
    pub fn deliver(
        &self,
        id: SessionId,
        key: &RecordKey,
        sequence: Sequence,
        message: ServerMessage,
    ) -> Delivery {
        let Ok(session) = self.session(id) else {
            return Delivery::Gone;
        };
        let (delivery, dropped) = {
            let mut session = session.lock();
            if !session.status.is_live() {
                return Delivery::Skipped;
            }
            if session.cursors.get(key).is_some_and(|c| *c >= sequence) {
                return Delivery::Duplicate;
            }
            let had_receiver = session.sender.is_some();
            let delivery = session.try_send(message);
            if delivery == Delivery::Sent {
                session.cursors.insert(key.clone(), sequence);
            }
            let dropped = (had_receiver && delivery == Delivery::Gone).then(|| session.checkpoint());
            (delivery, dropped)
        };
        self.save_dropped(dropped);
        delivery
    }

    /// Queue a message that carries no record sequence (rejections).
    pub fn send(&self, id: SessionId, message: ServerMessage) -> Delivery {
        let Ok(session) = self.session(id) else {
            return Delivery::Gone;
        };
        let (delivery, dropped) = {
            let mut session = session.lock();
            if !session.status.is_live() {
                return Delivery::Skipped;
            }
            let had_receiver = session.sender.is_some();
            let delivery = session.try_send(message);
            let dropped = (had_receiver && delivery == Delivery::Gone).then(|| session.checkpoint());
            (delivery, dropped)
        };
        self.save_dropped(dropped);
        delivery
    }

    /// Persist a session whose receiver went away mid-send, as
    /// [`SessionRegistry::mark_stale`] would.
    fn save_dropped(&self, checkpoint: Option<Checkpoint>) {
        let (Some(checkpoint), Some(store)) = (checkpoint, &self.checkpoints) else {
            return;
        };
        if let Err(error) = store.save(&checkpoint) {
            warn!(session = %checkpoint.session, error = %error, "checkpoint save failed");
        }
    }

    /// Record that the session holds `key` at `sequence` without queueing
    /// anything. Never moves a cursor backwards.
    pub fn record_delivery(&self, id: SessionId, key: &RecordKey, sequence: Sequence) -> Result<()> {
        let session = self.session(id)?;
        let mut session = session.lock();
        let cursor = session.cursors.entry(key.clone()).or_default();
        if sequence > *cursor {
            *cursor = sequence;
        }
        Ok(())
    }

    pub fn cursor(&self, id: SessionId, key: &RecordKey) -> Option<Sequence> {
        self.session(id)
            .ok()
            .and_then(|s| s.lock().cursors.get(key).copied())
    }

    /// Records the session holds a cursor for.
    pub fn cursor_keys(&self, id: SessionId) -> Result<Vec<RecordKey>> {
        Ok(self.session(id)?.lock().cursors.keys().cloned().collect())
    }

    /// Stop tracking records the session no longer follows. A later delivery
    /// of one of them starts over with a snapshot.
    pub fn forget_cursors(&self, id: SessionId, keys: &[RecordKey]) -> Result<usize> {
        let session = self.session(id)?;
        let mut session = session.lock();
        let forgotten = keys
            .iter()
            .filter(|key| session.cursors.remove(*key).is_some())
            .count();
        if forgotten > 0 {
            debug!(session = %id, forgotten, "cursors dropped");
        }
        Ok(forgotten)
    }

    /// Whether the session has to be rebuilt from full snapshots.
    pub fn needs_full_resync(&self, id: SessionId) -> Result<bool> {
        Ok(self.session(id)?.lock().full_resync)
    }

    /// Full snapshot delivered; incremental delivery may continue.
    pub fn resynced(&self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        let mut session = session.lock();
        session.full_resync = false;
        if session.status == SessionStatus::Overflowed && session.sender.is_some() {
            session.status = SessionStatus::Live;
        }
        Ok(())
    }

    /// Current delivery state of a session.
    pub fn checkpoint(&self, id: SessionId) -> Result<Checkpoint> {
        Ok(self.session(id)?.lock().checkpoint())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH, DEFAULT_RECONNECT_GRACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RejectMessage, RejectReason};
    use crate::types::CorrelationId;

    fn reject(n: u32) -> ServerMessage {
        ServerMessage::Reject(RejectMessage {
            correlation_id: CorrelationId::new(format!("c{}", n)),
            reason_kind: RejectReason::PolicyDenied,
            detail: None,
        })
    }

    #[test]
    fn test_open_subscribe_unsubscribe() {
        let registry = SessionRegistry::default();
        let handle = registry.open(Identity::user("u1"));
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.session_for_token(&handle.token), Some(handle.id));

        let scope = ScopeKey::all("Picture");
        assert!(registry.subscribe(handle.id, scope.clone()).unwrap());
        assert!(!registry.subscribe(handle.id, scope.clone()).unwrap());
        assert_eq!(registry.candidates(&RecordKey::new("Picture", 1))[0].scopes, vec![scope.clone()]);
        assert!(registry.unsubscribe(handle.id, &scope).unwrap());
        assert!(registry.scopes(handle.id).unwrap().is_empty());
    }

    #[test]
    fn test_deliver_respects_cursor() {
        let registry = SessionRegistry::default();
        let handle = registry.open(Identity::anonymous());
        let key = RecordKey::new("Picture", 1);

        assert_eq!(registry.deliver(handle.id, &key, Sequence(2), reject(1)), Delivery::Sent);
        assert_eq!(registry.deliver(handle.id, &key, Sequence(2), reject(2)), Delivery::Duplicate);
        assert_eq!(registry.deliver(handle.id, &key, Sequence(1), reject(3)), Delivery::Duplicate);
        assert_eq!(registry.deliver(handle.id, &key, Sequence(3), reject(4)), Delivery::Sent);
        assert_eq!(registry.cursor(handle.id, &key), Some(Sequence(3)));
        assert_eq!(handle.drain().len(), 2);

        registry.record_delivery(handle.id, &key, Sequence(1)).unwrap();
        assert_eq!(registry.cursor(handle.id, &key), Some(Sequence(3)));
    }

    #[test]
    fn test_overflow_stops_delivery() {
        let registry = SessionRegistry::new(2, DEFAULT_RECONNECT_GRACE);
        let handle = registry.open(Identity::anonymous());
        let key = RecordKey::new("Picture", 1);

        for i in 1..=5u64 {
            registry.deliver(handle.id, &key, Sequence(i), reject(i as u32));
        }
        assert_eq!(registry.status(handle.id).unwrap(), SessionStatus::Overflowed);
        assert!(registry.needs_full_resync(handle.id).unwrap());
        assert_eq!(handle.drain().len(), 2);
        assert_eq!(registry.cursor(handle.id, &key), Some(Sequence(2)));
        assert!(registry.candidates(&key).is_empty());

        registry.resynced(handle.id).unwrap();
        assert!(registry.is_live(handle.id));
    }

    #[test]
    fn test_stale_resume_within_grace() {
        let registry = SessionRegistry::new(16, Duration::from_secs(30));
        let handle = registry.open(Identity::user("u1"));
        let key = RecordKey::new("Picture", 1);
        registry.record_delivery(handle.id, &key, Sequence(4)).unwrap();

        let t0 = Instant::now();
        registry.mark_stale(handle.id, t0).unwrap();
        assert!(!registry.is_live(handle.id));
        assert_eq!(registry.send(handle.id, reject(1)), Delivery::Skipped);

        let resumed = registry
            .resume(&handle.token, t0 + Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert!(resumed.gap_fill);
        assert_eq!(resumed.handle.id, handle.id);
        assert_eq!(registry.cursor(handle.id, &key), Some(Sequence(4)));
        assert!(registry.is_live(handle.id));
    }

    #[test]
    fn test_resume_after_grace_fails() {
        let registry = SessionRegistry::new(16, Duration::from_secs(30));
        let handle = registry.open(Identity::user("u1"));
        let t0 = Instant::now();
        registry.mark_stale(handle.id, t0).unwrap();

        let resumed = registry
            .resume(&handle.token, t0 + Duration::from_secs(31))
            .unwrap();
        assert!(resumed.is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_sweep_prunes_expired() {
        let registry = SessionRegistry::new(16, Duration::from_secs(5));
        let stale = registry.open(Identity::anonymous());
        let live = registry.open(Identity::anonymous());
        let t0 = Instant::now();
        registry.mark_stale(stale.id, t0).unwrap();

        assert!(registry.sweep(t0 + Duration::from_secs(1)).unwrap().is_empty());
        assert_eq!(registry.sweep(t0 + Duration::from_secs(6)).unwrap(), vec![stale.id]);
        assert_eq!(registry.session_count(), 1);
        assert!(registry.is_live(live.id));
    }

    #[test]
    fn test_dropped_receiver_marks_stale() {
        let registry = SessionRegistry::default();
        let handle = registry.open(Identity::anonymous());
        let id = handle.id;
        drop(handle);
        assert_eq!(registry.send(id, reject(1)), Delivery::Gone);
        assert!(matches!(registry.status(id).unwrap(), SessionStatus::Stale { .. }));
    }

    #[test]
    fn test_dropped_receiver_saves_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::default()
            .with_checkpoints(CheckpointStore::open(dir.path()).unwrap())
            .unwrap();
        let handle = registry.open(Identity::user("u1"));
        let id = handle.id;
        let key = RecordKey::new("Picture", 1);
        registry.subscribe(id, ScopeKey::all("Picture")).unwrap();
        assert_eq!(registry.deliver(id, &key, Sequence(1), reject(1)), Delivery::Sent);
        drop(handle);

        assert_eq!(registry.deliver(id, &key, Sequence(2), reject(2)), Delivery::Gone);
        let saved = registry.checkpoints.as_ref().unwrap().load(id).unwrap().unwrap();
        assert_eq!(saved.cursors.get(&key), Some(&Sequence(1)));
        assert!(saved.scopes.contains(&ScopeKey::all("Picture")));
    }

    #[test]
    fn test_forget_cursors() {
        let registry = SessionRegistry::default();
        let handle = registry.open(Identity::anonymous());
        let (kept, dropped) = (RecordKey::new("Picture", 1), RecordKey::new("Picture", 2));
        registry.record_delivery(handle.id, &kept, Sequence(1)).unwrap();
        registry.record_delivery(handle.id, &dropped, Sequence(4)).unwrap();

        assert_eq!(registry.forget_cursors(handle.id, &[dropped.clone()]).unwrap(), 1);
        assert_eq!(registry.cursor_keys(handle.id).unwrap(), vec![kept]);
        assert_eq!(registry.cursor(handle.id, &dropped), None);
        // Without a cursor the next delivery is not a duplicate.
        assert_eq!(registry.deliver(handle.id, &dropped, Sequence(3), reject(1)), Delivery::Sent);
    }
}
