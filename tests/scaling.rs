//! Scaling tests with concurrent writers and populated collections.
//!
//! Measures:
//! - Population of a few thousand records across many owners
//! - Subscribing to one owner's collection
//! - Concurrent updates fanned out to several sessions

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use syncmesh::{
    AssociationDef, Attributes, ClientConfig, ClientStore, Decision, Engine, EngineConfig,
    Identity, PolicyConfig, RecordKey, SchemaRegistry, ScopeKey, Sequence, ServerMessage,
    SessionHandle, SubscribeRequest, TypeDef,
};

const OWNERS: u64 = 50;
const PICTURES_PER_OWNER: u64 = 100;
const WRITERS: u64 = 4;
const UPDATES_PER_WRITER: u64 = 50;

fn attrs(value: serde_json::Value) -> Attributes {
    serde_json::from_value(value).unwrap()
}

fn engine() -> Engine {
    let schema = SchemaRegistry::new()
        .with(TypeDef::new("Picture").association(AssociationDef::belongs_to_polymorphic("imageable")))
        .with(
            TypeDef::new("Employee")
                .association(AssociationDef::has_many("pictures", "Picture").inverse_of("imageable")),
        );
    let policy = PolicyConfig::new()
        .always_allow_connection()
        .regulate_all_broadcasts_send_all()
        .regulate_scope("Picture", ["all"], Decision::AllowFull)
        .regulate_scope("Employee", ["pictures"], Decision::AllowFull);
    Engine::new(schema, &EngineConfig::with_policy(policy)).unwrap()
}

fn subscribe(engine: &Engine, handle: &SessionHandle, scope: ScopeKey) -> usize {
    engine
        .subscribe(&SubscribeRequest {
            scope,
            session_token: handle.token.clone(),
            resume_from_seq: None,
        })
        .unwrap()
        .snapshots
}

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn report_with_count(&self, count: u64) {
        let ms = self.start.elapsed().as_secs_f64() * 1000.0;
        println!("  {} took {:.2}ms ({} items)", self.name, ms, count);
    }
}

#[test]
fn test_scaling_populated_collections() {
    println!("\n=== {} owners x {} pictures ===", OWNERS, PICTURES_PER_OWNER);
    let engine = engine();

    let timer = Timer::new("Populate");
    for owner in 1..=OWNERS {
        engine
            .create_at(&RecordKey::new("Employee", owner), Attributes::new())
            .unwrap();
    }
    for id in 1..=OWNERS * PICTURES_PER_OWNER {
        let owner = (id - 1) % OWNERS + 1;
        engine
            .create_at(
                &RecordKey::new("Picture", id),
                attrs(json!({"imageable_id": owner, "imageable_type": "Employee"})),
            )
            .unwrap();
    }
    timer.report_with_count(OWNERS * PICTURES_PER_OWNER);

    let handle = engine.connect(Identity::user("u1")).unwrap();
    let first = RecordKey::new("Employee", 1);
    let timer = Timer::new("Subscribe");
    let snapshots = subscribe(&engine, &handle, ScopeKey::relation(&first, "pictures"));
    timer.report_with_count(snapshots as u64);
    assert_eq!(snapshots as u64, PICTURES_PER_OWNER);
    handle.drain();

    // Move every picture of owner 2 over to owner 1.
    let timer = Timer::new("Reassign");
    for id in (2..=OWNERS * PICTURES_PER_OWNER).step_by(OWNERS as usize) {
        engine
            .update(&RecordKey::new("Picture", id), attrs(json!({"imageable_id": 1})))
            .unwrap();
    }
    timer.report_with_count(PICTURES_PER_OWNER);

    let entered = handle
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::Snapshot(_)))
        .count();
    assert_eq!(entered as u64, PICTURES_PER_OWNER);
    assert_eq!(
        engine
            .store()
            .keys_in_scope(&ScopeKey::relation(&first, "pictures"))
            .unwrap()
            .len() as u64,
        2 * PICTURES_PER_OWNER
    );
    let second = RecordKey::new("Employee", 2);
    assert!(engine
        .store()
        .keys_in_scope(&ScopeKey::relation(&second, "pictures"))
        .unwrap()
        .is_empty());
}

#[test]
fn test_concurrent_writers_keep_per_record_order() {
    let engine = Arc::new(engine());
    let keys: Vec<RecordKey> = (1..=3).map(|id| RecordKey::new("Picture", id)).collect();
    for key in &keys {
        engine.create_at(key, attrs(json!({"name": "seed"}))).unwrap();
    }

    let handles: Vec<SessionHandle> = (0..3)
        .map(|i| {
            let handle = engine.connect(Identity::user(format!("u{}", i))).unwrap();
            subscribe(&engine, &handle, ScopeKey::all("Picture"));
            handle
        })
        .collect();

    let timer = Timer::new("Concurrent updates");
    thread::scope(|s| {
        for writer in 0..WRITERS {
            let engine = Arc::clone(&engine);
            let keys = keys.clone();
            s.spawn(move || {
                for i in 0..UPDATES_PER_WRITER {
                    let key = &keys[(i % keys.len() as u64) as usize];
                    let value = format!("w{}-{}", writer, i);
                    engine.update(key, attrs(json!({"name": value}))).unwrap();
                }
            });
        }
    });
    timer.report_with_count(WRITERS * UPDATES_PER_WRITER);

    let total: u64 = keys.iter().map(|k| engine.last_sequence(k).0).sum();
    assert_eq!(total, keys.len() as u64 + WRITERS * UPDATES_PER_WRITER);

    for handle in &handles {
        let messages = handle.drain();
        let client = ClientStore::new(Arc::clone(engine.store().schema()), ClientConfig::default());
        let mut last: HashMap<RecordKey, Sequence> = HashMap::new();
        for message in messages {
            let position = match &message {
                ServerMessage::Change(delta) => (delta.key(), delta.sequence),
                ServerMessage::Snapshot(snapshot) => (snapshot.key(), snapshot.sequence),
                ServerMessage::Reject(_) => continue,
            };
            if let Some(previous) = last.insert(position.0, position.1) {
                assert!(position.1 > previous);
            }
            client.apply_message(message).unwrap();
        }
        for key in &keys {
            assert_eq!(client.get(key), engine.store().get(key));
            assert_eq!(last[key], engine.last_sequence(key));
        }
    }
}
