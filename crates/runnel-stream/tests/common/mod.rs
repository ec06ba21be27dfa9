#![allow(dead_code)]

use std::time::Duration;

use bson::doc;
use rand::Rng;
use rand::rngs::StdRng;
use runnel_oplog::{MemoryCluster, TxnOp};
use runnel_stream::{ChangeEvent, CursorId, CursorManager, StreamConfig, StreamItem, StreamOptions};

pub const USERS: &str = "app.users";
pub const ORDERS: &str = "app.orders";

pub struct Fixture {
    pub cluster: MemoryCluster,
    pub manager: CursorManager,
}

pub fn fixture(shards: &[&str]) -> Fixture {
    fixture_with(shards, StreamConfig::default())
}

pub fn fixture_with(shards: &[&str], config: StreamConfig) -> Fixture {
    let cluster = MemoryCluster::new(shards);
    let manager = CursorManager::new(cluster.topology(), config).unwrap();
    Fixture { cluster, manager }
}

/// Three shards with `app.users` sharded on `x`.
pub fn sharded_fixture() -> Fixture {
    let f = fixture(&["shard0", "shard1", "shard2"]);
    f.cluster.shard_collection(USERS, doc! { "x": 1 }).unwrap();
    f
}

pub fn open(f: &Fixture, options: StreamOptions) -> CursorId {
    f.manager.open_stream(options).unwrap()
}

/// Every event already written, fetched in batches of `batch_size`. Stops at
/// the first empty batch or at an invalidate.
pub fn drain_batches(manager: &CursorManager, id: CursorId, batch_size: usize) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    loop {
        let batch = manager.get_more(id, Some(batch_size), Some(Duration::ZERO)).unwrap();
        let done = batch.events.is_empty() || batch.invalidated;
        out.extend(batch.events);
        if done {
            return out;
        }
    }
}

pub fn drain(manager: &CursorManager, id: CursorId) -> Vec<ChangeEvent> {
    drain_batches(manager, id, 1000)
}

pub fn next_event(manager: &CursorManager, id: CursorId) -> ChangeEvent {
    match manager.get_next(id, Some(Duration::from_secs(5))).unwrap() {
        StreamItem::Event(event) | StreamItem::Invalidated(event) => event,
        StreamItem::Heartbeat(token) => panic!("expected an event, got heartbeat {token:?}"),
    }
}

pub fn keys(events: &[ChangeEvent]) -> Vec<bson::Document> {
    events.iter().filter_map(|e| e.document_key.clone()).collect()
}

/// Apply `n` random writes to `app.users` and `app.orders`, including
/// multi-shard transactions. Returns how many change events they produce.
pub fn random_workload(cluster: &MemoryCluster, rng: &mut StdRng, n: usize) -> usize {
    let mut events = 0;
    let mut live: Vec<i32> = Vec::new();
    let mut next_id = 0;
    for txn_number in 0..n {
        match rng.gen_range(0..10) {
            0..=3 => {
                cluster.insert(USERS, doc! { "_id": next_id, "x": next_id }).unwrap();
                live.push(next_id);
                next_id += 1;
                events += 1;
            }
            4 | 5 if !live.is_empty() => {
                let id = live[rng.gen_range(0..live.len())];
                cluster
                    .update(USERS, doc! { "_id": id, "x": id }, doc! { "$set": { "n": rng.gen_range(0..100i32) } })
                    .unwrap();
                events += 1;
            }
            6 if !live.is_empty() => {
                let id = live.swap_remove(rng.gen_range(0..live.len()));
                cluster.delete(USERS, doc! { "_id": id, "x": id }).unwrap();
                events += 1;
            }
            7 | 8 => {
                let statements = rng.gen_range(1..5);
                let mut ops = Vec::new();
                for _ in 0..statements {
                    ops.push(TxnOp::Insert {
                        ns: USERS.into(),
                        doc: doc! { "_id": next_id, "x": next_id },
                    });
                    live.push(next_id);
                    next_id += 1;
                }
                cluster
                    .transaction(doc! { "id": "session-1" }, txn_number as i64, ops)
                    .unwrap();
                events += statements;
            }
            _ => {
                cluster.insert(ORDERS, doc! { "_id": txn_number as i64 }).unwrap();
                events += 1;
            }
        }
    }
    events
}
