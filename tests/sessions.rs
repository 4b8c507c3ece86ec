//! Session lifecycle across disconnects, overflow and restarts.

use std::thread;
use std::time::Duration;
use syncmesh::{
    Attributes, CheckpointStore, Decision, Engine, EngineConfig, Identity, PolicyConfig,
    RecordKey, SchemaRegistry, ScopeKey, ServerMessage, SessionStatus, SubscribeRequest, TypeDef,
};
use serde_json::json;
use tempfile::TempDir;

fn attrs(value: serde_json::Value) -> Attributes {
    serde_json::from_value(value).unwrap()
}

fn config() -> EngineConfig {
    EngineConfig::with_policy(
        PolicyConfig::new()
            .always_allow_connection()
            .regulate_all_broadcasts_send_all()
            .regulate_scope("Picture", ["all"], Decision::AllowFull),
    )
}

fn engine(config: &EngineConfig) -> Engine {
    Engine::new(SchemaRegistry::new().with(TypeDef::new("Picture")), config).unwrap()
}

fn subscribe_all(engine: &Engine, token: &str) -> usize {
    engine
        .subscribe(&SubscribeRequest {
            scope: ScopeKey::all("Picture"),
            session_token: token.to_string(),
            resume_from_seq: None,
        })
        .unwrap()
        .snapshots
}

#[test]
fn test_checkpoint_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        checkpoint_dir: Some(dir.path().join("sessions")),
        ..config()
    };

    let (id, token) = {
        let engine = engine(&config);
        engine
            .create_at(&RecordKey::new("Picture", 1), attrs(json!({"name": "p"})))
            .unwrap();
        let handle = engine.connect(Identity::user("u1")).unwrap();
        subscribe_all(&engine, &handle.token);
        engine.disconnect(handle.id).unwrap();
        (handle.id, handle.token.clone())
    };

    let engine = engine(&config);
    let resumed = engine.reconnect(&token, Identity::anonymous()).unwrap();
    assert!(resumed.gap_fill);
    assert_eq!(resumed.handle.id, id);
    // The stored identity wins over the one presented on reconnect.
    assert_eq!(engine.sessions().identity(id).unwrap(), Identity::user("u1"));
    assert!(engine
        .sessions()
        .scopes(id)
        .unwrap()
        .contains(&ScopeKey::all("Picture")));
    assert!(engine
        .sessions()
        .cursor(id, &RecordKey::new("Picture", 1))
        .is_some());

    let fresh = engine.connect(Identity::user("u2")).unwrap();
    assert!(fresh.id > id);
}

#[test]
fn test_dropped_transport_checkpoint_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        checkpoint_dir: Some(dir.path().join("sessions")),
        ..config()
    };

    let (id, token) = {
        let engine = engine(&config);
        let handle = engine.connect(Identity::user("u1")).unwrap();
        subscribe_all(&engine, &handle.token);
        let (id, token) = (handle.id, handle.token.clone());
        // The transport goes away without a disconnect; the next delivery notices.
        drop(handle);
        engine
            .create_at(&RecordKey::new("Picture", 1), attrs(json!({"name": "p"})))
            .unwrap();
        assert!(matches!(
            engine.sessions().status(id).unwrap(),
            SessionStatus::Stale { .. }
        ));
        (id, token)
    };

    let engine = engine(&config);
    let resumed = engine.reconnect(&token, Identity::user("u1")).unwrap();
    assert!(resumed.gap_fill);
    assert_eq!(resumed.handle.id, id);
    assert!(engine
        .sessions()
        .scopes(id)
        .unwrap()
        .contains(&ScopeKey::all("Picture")));
}

#[test]
fn test_checkpoint_directory_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..config()
    };
    let _first = engine(&config);
    assert!(Engine::new(SchemaRegistry::new().with(TypeDef::new("Picture")), &config).is_err());
    assert!(CheckpointStore::open(dir.path()).is_err());
}

#[test]
fn test_resume_after_grace_starts_over() {
    let config = EngineConfig {
        reconnect_grace: Duration::from_millis(20),
        ..config()
    };
    let engine = engine(&config);
    let handle = engine.connect(Identity::user("u1")).unwrap();
    engine.disconnect(handle.id).unwrap();
    assert!(matches!(
        engine.sessions().status(handle.id).unwrap(),
        SessionStatus::Stale { .. }
    ));

    thread::sleep(Duration::from_millis(40));
    let resumed = engine.reconnect(&handle.token, Identity::user("u1")).unwrap();
    assert!(!resumed.gap_fill);
    assert_ne!(resumed.handle.id, handle.id);
    assert!(engine.sessions().status(handle.id).is_err());
}

#[test]
fn test_sweep_prunes_expired_sessions() {
    let config = EngineConfig {
        reconnect_grace: Duration::from_millis(10),
        ..config()
    };
    let engine = engine(&config);
    let stale = engine.connect(Identity::user("u1")).unwrap();
    let live = engine.connect(Identity::user("u2")).unwrap();
    engine.disconnect(stale.id).unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(engine.sweep().unwrap(), vec![stale.id]);
    assert_eq!(engine.sessions().session_count(), 1);
    assert!(engine.sessions().is_live(live.id));
}

#[test]
fn test_overflowed_session_reconnects_with_full_snapshot() {
    let config = EngineConfig {
        queue_depth: 2,
        ..config()
    };
    let engine = engine(&config);
    let handle = engine.connect(Identity::user("u1")).unwrap();
    subscribe_all(&engine, &handle.token);

    for id in 1..=3 {
        engine
            .create_at(&RecordKey::new("Picture", id), attrs(json!({"n": id})))
            .unwrap();
    }
    assert_eq!(
        engine.sessions().status(handle.id).unwrap(),
        SessionStatus::Overflowed
    );
    assert_eq!(engine.dispatch_stats().overflowed, 1);
    engine.destroy(&RecordKey::new("Picture", 3)).unwrap();

    engine.disconnect(handle.id).unwrap();
    let resumed = engine.reconnect(&handle.token, Identity::user("u1")).unwrap();
    assert!(!resumed.gap_fill);
    assert_eq!(resumed.handle.id, handle.id);

    // Cursors cannot be trusted after overflow, so the held map is ignored.
    let outcome = engine
        .subscribe(&SubscribeRequest {
            scope: ScopeKey::all("Picture"),
            session_token: resumed.handle.token.clone(),
            resume_from_seq: Some(Default::default()),
        })
        .unwrap();
    assert!(outcome.full);
    assert_eq!(outcome.snapshots, 2);
    let snapshots = resumed
        .handle
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::Snapshot(_)))
        .count();
    assert_eq!(snapshots, 2);
    assert!(!engine.sessions().needs_full_resync(handle.id).unwrap());
    assert!(engine.sessions().is_live(handle.id));
}
