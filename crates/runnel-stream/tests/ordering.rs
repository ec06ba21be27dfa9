mod common;
use common::*;

use std::cmp::Ordering;

use bson::{Document, doc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use runnel_oplog::{Namespace, TxnOp};
use runnel_stream::{
    ChangeEvent, CursorManager, OperationType, Provenance, ResumeToken, StreamConfig, StreamOptions, WatchScope,
    compare_encoded,
};

fn tokens(events: &[ChangeEvent]) -> Vec<ResumeToken> {
    events.iter().map(|e| e.token.clone()).collect()
}

// ── Cross-shard ordering ────────────────────────────────────────

#[test]
fn random_workload_arrives_in_token_order() {
    for seed in 0..5 {
        let f = sharded_fixture();
        let id = open(&f, StreamOptions::new(WatchScope::Cluster));
        let mut rng = StdRng::seed_from_u64(seed);
        let expected = random_workload(&f.cluster, &mut rng, 200);

        let events = drain(&f.manager, id);
        assert_eq!(events.len(), expected, "seed {seed}");
        for pair in events.windows(2) {
            assert!(pair[0].token < pair[1].token, "seed {seed}: {:?} !< {:?}", pair[0].token, pair[1].token);
            assert!(pair[0].cluster_time <= pair[1].cluster_time);
            assert_eq!(
                compare_encoded(&pair[0].token.encode(), &pair[1].token.encode()),
                Ordering::Less
            );
        }
    }
}

#[test]
fn every_shard_contributes() {
    let f = sharded_fixture();
    let id = open(&f, StreamOptions::new(WatchScope::Collection(Namespace::collection("app", "users"))));
    for i in 0..60 {
        f.cluster.insert(USERS, doc! { "_id": i, "x": i }).unwrap();
    }
    let events = drain(&f.manager, id);
    assert_eq!(events.len(), 60);
    let mut shards: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.provenance {
            Provenance::Oplog { shard } => Some(shard.clone()),
            Provenance::Control(_) => None,
        })
        .collect();
    shards.sort();
    shards.dedup();
    assert_eq!(shards, vec!["shard0", "shard1", "shard2"]);
}

#[test]
fn batch_size_does_not_change_the_stream() {
    let f = sharded_fixture();
    let big = open(&f, StreamOptions::new(WatchScope::Cluster));
    let small = open(&f, StreamOptions::new(WatchScope::Cluster));
    let mut rng = StdRng::seed_from_u64(42);
    random_workload(&f.cluster, &mut rng, 100);

    let all = drain_batches(&f.manager, big, 1000);
    let chunked = drain_batches(&f.manager, small, 3);
    assert_eq!(tokens(&all), tokens(&chunked));
}

// ── Transactions ────────────────────────────────────────────────

#[test]
fn transaction_statements_keep_statement_order() {
    let f = sharded_fixture();
    let id = open(&f, StreamOptions::new(WatchScope::Cluster));
    let lsid = doc! { "id": "session-7" };
    let ops: Vec<TxnOp> = (0..8)
        .map(|i| TxnOp::Insert {
            ns: USERS.into(),
            doc: doc! { "_id": i, "x": i },
        })
        .collect();
    let ts = f.cluster.transaction(lsid.clone(), 3, ops).unwrap();

    let events = drain(&f.manager, id);
    assert_eq!(events.len(), 8);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.cluster_time, ts);
        assert_eq!(event.document_key.as_ref().and_then(|k| k.get_i32("_id").ok()), Some(i as i32));
        let txn = event.txn.as_ref().unwrap();
        assert_eq!(txn.lsid, lsid);
        assert_eq!(txn.txn_number, 3);
        assert_eq!(txn.event_index, i as u64);
    }
}

#[test]
fn filtered_transaction_keeps_matching_statements() {
    let f = fixture(&["shard0"]);
    f.cluster.create(USERS).unwrap();
    f.cluster.create(ORDERS).unwrap();
    let id = open(&f, StreamOptions::new(WatchScope::Collection(Namespace::collection("app", "orders"))));
    let ops = vec![
        TxnOp::Insert {
            ns: USERS.into(),
            doc: doc! { "_id": 1 },
        },
        TxnOp::Insert {
            ns: ORDERS.into(),
            doc: doc! { "_id": 10 },
        },
        TxnOp::Delete {
            ns: USERS.into(),
            key: doc! { "_id": 1 },
        },
        TxnOp::Update {
            ns: ORDERS.into(),
            key: doc! { "_id": 10 },
            update: doc! { "$set": { "paid": true } },
        },
    ];
    f.cluster.transaction(doc! { "id": "s" }, 1, ops).unwrap();

    let events = drain(&f.manager, id);
    let kinds: Vec<_> = events.iter().map(|e| e.operation_type).collect();
    assert_eq!(kinds, vec![OperationType::Insert, OperationType::Update]);
    let indexes: Vec<_> = events.iter().map(|e| e.txn.as_ref().unwrap().event_index).collect();
    assert_eq!(indexes, vec![1, 3]);
}

// ── Pushdown ────────────────────────────────────────────────────

fn filters() -> Vec<Document> {
    vec![
        doc! {},
        doc! { "operationType": "insert" },
        doc! { "operationType": { "$in": ["update", "delete"] } },
        doc! { "ns.coll": "orders" },
        doc! { "ns": { "db": "app", "coll": "users" } },
        doc! { "documentKey._id": 5 },
        doc! { "fullDocument.x": { "$gt": 10 } },
        doc! { "updateDescription.updatedFields.n": { "$exists": true } },
        doc! { "$nor": [{ "operationType": "insert" }] },
        doc! { "$or": [{ "ns.coll": { "$regex": "^ord" } }, { "documentKey._id": { "$lt": 3 } }] },
        doc! { "txnNumber": { "$exists": true } },
        doc! { "fullDocument.x": 7 },
        doc! { "fullDocument.name": { "$exists": false } },
        doc! { "fullDocument": { "_id": 0, "x": 0, "name": "zero" } },
        doc! { "to": { "db": "app", "coll": "archive" } },
        doc! { "to.coll": { "$ne": "archive" } },
        doc! { "ns.coll": { "$in": ["orders", "archive"] } },
        doc! { "ns": { "$in": [{ "db": "app", "coll": "users" }, { "db": "shop" }] } },
        doc! { "updateDescription.updatedFields.n": { "$lt": 50 } },
    ]
}

#[test]
fn pushdown_does_not_change_results() {
    let f = sharded_fixture();
    let off = CursorManager::new(
        f.cluster.topology(),
        StreamConfig {
            pushdown_enabled: false,
            ..StreamConfig::default()
        },
    )
    .unwrap();

    let mut cursors = Vec::new();
    for filter in filters() {
        let options = StreamOptions::new(WatchScope::Cluster).filter(filter.clone());
        let on_id = f.manager.open_stream(options.clone()).unwrap();
        let off_id = off.open_stream(options).unwrap();
        cursors.push((filter, on_id, off_id));
    }

    let mut rng = StdRng::seed_from_u64(7);
    random_workload(&f.cluster, &mut rng, 150);
    f.cluster.replace(USERS, doc! { "_id": 0, "x": 0, "name": "zero" }).unwrap();
    f.cluster.insert(ORDERS, doc! { "_id": -1 }).unwrap();
    f.cluster.rename(ORDERS, "app.archive").unwrap();
    f.cluster.insert("app.archive", doc! { "_id": -2 }).unwrap();
    f.cluster.insert("shop.carts", doc! { "_id": 1 }).unwrap();
    f.cluster.drop_database("shop").unwrap();

    for (filter, on_id, off_id) in cursors {
        let with = drain(&f.manager, on_id);
        let without = drain(&off, off_id);
        assert_eq!(tokens(&with), tokens(&without), "filter {filter}");
        assert_eq!(with, without, "filter {filter}");
    }
}

#[test]
fn residual_filter_alone_is_exact() {
    let f = fixture_with(
        &["shard0"],
        StreamConfig {
            pushdown_enabled: false,
            ..StreamConfig::default()
        },
    );
    let options = StreamOptions::new(WatchScope::Cluster).filter(doc! { "operationType": "delete" });
    let id = open(&f, options);
    f.cluster.insert(USERS, doc! { "_id": 1 }).unwrap();
    f.cluster.delete(USERS, doc! { "_id": 1 }).unwrap();
    let events = drain(&f.manager, id);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation_type, OperationType::Delete);
}
