use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use bson::{Bson, Document, doc};
use imbl::OrdMap;

use crate::entry::Namespace;
use crate::time::LogicalTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lifetime {
    created: LogicalTime,
    dropped: Option<LogicalTime>,
}

impl Lifetime {
    fn alive_at(&self, ts: LogicalTime) -> bool {
        self.created <= ts && self.dropped.is_none_or(|d| ts < d)
    }
}

#[derive(Debug, Clone, Default)]
struct History {
    lifetimes: Vec<Lifetime>,
    /// Shard key patterns in the order they took effect; `None` marks a
    /// return to unsharded.
    shard_keys: Vec<(LogicalTime, Option<Document>)>,
}

type CatalogMap = OrdMap<Namespace, History>;

/// Time-versioned collection metadata: when each collection existed and
/// which shard key it had at any point in history.
///
/// Readers work off a lock-free snapshot; writers serialize on a mutex and
/// publish a new snapshot.
pub struct Catalog {
    state: ArcSwap<CatalogMap>,
    write_lock: Mutex<()>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::new(Arc::new(OrdMap::new())),
            write_lock: Mutex::new(()),
        }
    }

    fn update(&self, ns: &Namespace, f: impl FnOnce(&mut History)) {
        let _guard = self.write_lock.lock().unwrap();
        let mut map = (**self.state.load()).clone();
        let mut history = map.get(ns).cloned().unwrap_or_default();
        f(&mut history);
        map.insert(ns.clone(), history);
        self.state.store(Arc::new(map));
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Record that `ns` came into existence at `at`. No-op if it already exists.
    pub fn record_create(&self, ns: &Namespace, at: LogicalTime) {
        self.update(ns, |h| {
            if h.lifetimes.last().is_none_or(|l| l.dropped.is_some()) {
                h.lifetimes.push(Lifetime {
                    created: at,
                    dropped: None,
                });
                // A recreated collection starts unsharded.
                if !h.shard_keys.is_empty() {
                    h.shard_keys.push((at, None));
                }
            }
        });
    }

    pub fn record_drop(&self, ns: &Namespace, at: LogicalTime) {
        self.update(ns, |h| {
            if let Some(last) = h.lifetimes.last_mut() {
                if last.dropped.is_none() {
                    last.dropped = Some(at);
                }
            }
        });
    }

    pub fn record_shard_key(&self, ns: &Namespace, key: Document, at: LogicalTime) {
        self.update(ns, |h| h.shard_keys.push((at, Some(key))));
    }

    // ── Reads ───────────────────────────────────────────────────

    pub fn exists_at(&self, ns: &Namespace, ts: LogicalTime) -> bool {
        self.state
            .load()
            .get(ns)
            .is_some_and(|h| h.lifetimes.iter().any(|l| l.alive_at(ts)))
    }

    fn shard_key_at(&self, ns: &Namespace, ts: LogicalTime) -> Option<Document> {
        self.state.load().get(ns).and_then(|h| {
            h.shard_keys
                .iter()
                .rev()
                .find(|(since, _)| *since <= ts)
                .and_then(|(_, key)| key.clone())
        })
    }

    /// Shard key pattern in effect at `ts`, defaulting to `{_id: 1}`.
    pub fn key_pattern_at(&self, ns: &Namespace, ts: LogicalTime) -> Document {
        self.shard_key_at(ns, ts).unwrap_or_else(id_key_pattern)
    }

    pub fn is_sharded_at(&self, ns: &Namespace, ts: LogicalTime) -> bool {
        self.shard_key_at(ns, ts).is_some()
    }

    /// Project the document key of `doc` under the shard key in effect at
    /// `ts`: shard key fields in pattern order, then `_id` if not already
    /// part of the key. Missing shard key fields are omitted.
    pub fn document_key_at(&self, ns: &Namespace, ts: LogicalTime, doc: &Document) -> Option<Document> {
        let id = doc.get("_id")?;
        Some(project_key(&self.key_pattern_at(ns, ts), doc, id))
    }

    /// Collections of `db` that were alive immediately before `ts`, sorted
    /// by name.
    pub fn collections_alive_before(&self, db: &str, ts: LogicalTime) -> Vec<String> {
        let before = ts.prev();
        self.state
            .load()
            .iter()
            .filter(|(ns, _)| ns.db == db)
            .filter(|(_, h)| h.lifetimes.iter().any(|l| l.alive_at(before)))
            .filter_map(|(ns, _)| ns.coll.clone())
            .collect()
    }

    pub fn collections_alive_at(&self, db: &str, ts: LogicalTime) -> Vec<String> {
        self.collections_alive_before(db, ts.next())
    }
}

fn id_key_pattern() -> Document {
    doc! { "_id": 1 }
}

pub(crate) fn project_key(pattern: &Document, doc: &Document, id: &Bson) -> Document {
    let mut key = Document::new();
    for field in pattern.keys() {
        if let Some(value) = lookup(doc, field) {
            key.insert(field.clone(), value.clone());
        }
    }
    if !key.contains_key("_id") {
        key.insert("_id", id.clone());
    }
    key
}

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => doc.get(path),
        Some((head, rest)) => match doc.get(head)? {
            Bson::Document(sub) => lookup(sub, rest),
            _ => None,
        },
    }
}
