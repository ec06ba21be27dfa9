mod common;
use common::*;

use std::time::Duration;

use bson::doc;
use runnel_oplog::Namespace;
use runnel_stream::{OperationType, StreamError, StreamOptions, Target, WatchScope};

fn users() -> WatchScope {
    WatchScope::Collection(Namespace::collection("app", "users"))
}

// ── Invalidation ────────────────────────────────────────────────

#[test]
fn drop_emits_drop_then_invalidate_then_cursor_is_gone() {
    let f = fixture(&["shard0"]);
    f.cluster.insert(USERS, doc! { "_id": 1 }).unwrap();
    let id = open(&f, StreamOptions::new(users()));
    f.cluster.insert(USERS, doc! { "_id": 2 }).unwrap();
    f.cluster.drop_collection(USERS).unwrap();
    f.cluster.insert(USERS, doc! { "_id": 3 }).unwrap();

    let batch = f.manager.get_more(id, None, Some(Duration::ZERO)).unwrap();
    let kinds: Vec<_> = batch.events.iter().map(|e| e.operation_type).collect();
    assert_eq!(
        kinds,
        vec![OperationType::Insert, OperationType::Drop, OperationType::Invalidate]
    );
    assert!(batch.invalidated);
    assert_eq!(batch.post_batch_resume_token, batch.events[2].token);
    assert_eq!(f.manager.cursor_count(), 0);
    assert!(matches!(
        f.manager.get_more(id, None, Some(Duration::ZERO)),
        Err(StreamError::CursorNotFound(_))
    ));
}

#[test]
fn rename_invalidates_the_source_only() {
    let f = fixture(&["shard0"]);
    f.cluster.create(USERS).unwrap();
    let source = open(&f, StreamOptions::new(users()));
    let database = open(&f, StreamOptions::new(WatchScope::Database("app".into())));
    f.cluster.rename(USERS, "app.people").unwrap();
    f.cluster.insert("app.people", doc! { "_id": 1 }).unwrap();

    let events = drain(&f.manager, source);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].operation_type, OperationType::Rename);
    assert_eq!(events[0].to, Some(Namespace::collection("app", "people")));
    assert_eq!(events[1].operation_type, OperationType::Invalidate);

    let events = drain(&f.manager, database);
    let kinds: Vec<_> = events.iter().map(|e| e.operation_type).collect();
    assert_eq!(kinds, vec![OperationType::Rename, OperationType::Insert]);
    assert_eq!(f.manager.cursor_count(), 1);
}

#[test]
fn drop_database_invalidates_collection_streams_only() {
    let f = fixture(&["shard0", "shard1"]);
    f.cluster.create(USERS).unwrap();
    f.cluster.create(ORDERS).unwrap();
    let coll = open(&f, StreamOptions::new(users()));
    let db = open(&f, StreamOptions::new(WatchScope::Database("app".into())));
    let cluster = open(&f, StreamOptions::new(WatchScope::Cluster));
    f.cluster.drop_database("app").unwrap();
    f.cluster.insert(USERS, doc! { "_id": 1 }).unwrap();

    let events = drain(&f.manager, coll);
    let kinds: Vec<_> = events.iter().map(|e| e.operation_type).collect();
    assert_eq!(kinds, vec![OperationType::Drop, OperationType::Invalidate]);

    for id in [db, cluster] {
        let events = drain(&f.manager, id);
        let kinds: Vec<_> = events.iter().map(|e| e.operation_type).collect();
        assert_eq!(
            kinds,
            vec![
                OperationType::Drop,
                OperationType::Drop,
                OperationType::DropDatabase,
                OperationType::Insert
            ]
        );
    }
    assert_eq!(f.manager.cursor_count(), 2);
}

#[test]
fn expanded_events_include_create() {
    let f = fixture(&["shard0"]);
    let id = open(&f, StreamOptions::new(WatchScope::Database("app".into())).expanded_events());
    f.cluster.insert(USERS, doc! { "_id": 1 }).unwrap();
    let kinds: Vec<_> = drain(&f.manager, id).iter().map(|e| e.operation_type).collect();
    assert_eq!(kinds, vec![OperationType::Create, OperationType::Insert]);
}

// ── Document keys across sharding ───────────────────────────────

#[test]
fn document_key_gains_shard_key_once_sharded() {
    let f = fixture(&["shard0", "shard1"]);
    let id = open(&f, StreamOptions::new(users()));
    f.cluster.insert(USERS, doc! { "_id": 1, "region": "eu" }).unwrap();
    f.cluster.shard_collection(USERS, doc! { "region": 1 }).unwrap();
    f.cluster.insert(USERS, doc! { "_id": 2, "region": "us" }).unwrap();
    f.cluster
        .update(USERS, doc! { "_id": 2, "region": "us" }, doc! { "$set": { "seen": true } })
        .unwrap();

    let events = drain(&f.manager, id);
    assert_eq!(
        keys(&events),
        vec![
            doc! { "_id": 1 },
            doc! { "region": "us", "_id": 2 },
            doc! { "region": "us", "_id": 2 },
        ]
    );
    let update = events[2].update_description.as_ref().unwrap();
    assert_eq!(update.updated_fields, doc! { "seen": true });
}

// ── Topology ────────────────────────────────────────────────────

#[test]
fn shard_membership_changes_are_followed() {
    let f = fixture(&["shard0"]);
    let watching = open(&f, StreamOptions::new(WatchScope::Cluster).topology_events());
    let quiet = open(&f, StreamOptions::new(WatchScope::Cluster));
    f.cluster.add_shard("shard1").unwrap();
    f.cluster.shard_collection(USERS, doc! { "x": 1 }).unwrap();
    for i in 0..20 {
        f.cluster.insert(USERS, doc! { "_id": i, "x": i }).unwrap();
    }
    f.cluster.remove_shard("shard1").unwrap();
    f.cluster.insert(USERS, doc! { "_id": 100, "x": 100 }).unwrap();

    let events = drain(&f.manager, watching);
    assert_eq!(events.first().map(|e| e.operation_type), Some(OperationType::ShardAdded));
    assert_eq!(events[0].extra, Some(doc! { "shard": "shard1" }));
    assert!(events[0].is_control());
    let removed = events
        .iter()
        .position(|e| e.operation_type == OperationType::ShardRemoved)
        .unwrap();
    assert_eq!(removed, 21);
    assert_eq!(events.len(), 23);
    assert!(events.windows(2).all(|w| w[0].token < w[1].token));

    let plain = drain(&f.manager, quiet);
    assert_eq!(plain.len(), 21);
    assert!(plain.iter().all(|e| e.operation_type == OperationType::Insert));

    let status = f.manager.status(watching).unwrap();
    assert_eq!(status.shards, vec!["shard0".to_string()]);
}

#[test]
fn lookalike_documents_never_become_control_events() {
    let f = fixture(&["shard0"]);
    let options = StreamOptions::new(WatchScope::Cluster)
        .topology_events()
        .filter(doc! { "operationType": { "$in": ["shardAdded", "shardRemoved"] } });
    let id = open(&f, options);
    f.cluster
        .insert(USERS, doc! { "_id": 1, "operationType": "shardAdded", "shard": "rogue" })
        .unwrap();
    f.cluster
        .update(USERS, doc! { "_id": 1 }, doc! { "$set": { "operationType": "shardRemoved" } })
        .unwrap();
    assert!(drain(&f.manager, id).is_empty());

    f.cluster.add_shard("shard1").unwrap();
    let events = drain(&f.manager, id);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_control());
}

#[test]
fn direct_shard_stream_reads_one_shard() {
    let f = fixture(&["shard0", "shard1"]);
    f.cluster.shard_collection(USERS, doc! { "x": 1 }).unwrap();
    let id = open(&f, StreamOptions::new(users()).target(Target::Shard("shard1".into())));
    for i in 0..30 {
        f.cluster.insert(USERS, doc! { "_id": i, "x": i }).unwrap();
    }
    let events = drain(&f.manager, id);
    assert!(!events.is_empty() && events.len() < 30);
    assert_eq!(f.manager.status(id).unwrap().shards, vec!["shard1".to_string()]);

    f.cluster.add_shard("shard2").unwrap();
    assert!(matches!(
        f.manager.get_next(id, Some(Duration::ZERO)),
        Err(StreamError::TopologyChange(_))
    ));
    assert_eq!(f.manager.cursor_count(), 0);
}

#[test]
fn direct_shard_topology_error_survives_a_partial_batch() {
    let f = fixture(&["shard0"]);
    let id = open(&f, StreamOptions::new(users()).target(Target::Shard("shard0".into())));
    f.cluster.insert(USERS, doc! { "_id": 1 }).unwrap();
    f.cluster.add_shard("shard1").unwrap();
    f.cluster.insert(USERS, doc! { "_id": 2 }).unwrap();

    let batch = f.manager.get_more(id, Some(10), Some(Duration::ZERO)).unwrap();
    assert_eq!(keys(&batch.events), vec![doc! { "_id": 1 }]);

    assert!(matches!(
        f.manager.get_more(id, Some(10), Some(Duration::ZERO)),
        Err(StreamError::TopologyChange(_))
    ));
    assert_eq!(f.manager.cursor_count(), 0);
}
