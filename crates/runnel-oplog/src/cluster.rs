use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bson::{Bson, Document, doc};
use tracing::debug;

use crate::catalog::project_key;
use crate::entry::{Namespace, OpKind, RawLogEntry};
use crate::error::OplogError;
use crate::memory::MemoryOplog;
use crate::time::LogicalTime;
use crate::topology::{MemoryTopology, Topology, TopologyChange, TopologyChangeKind};

/// One statement of a multi-document transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Insert { ns: String, doc: Document },
    Update { ns: String, key: Document, update: Document },
    Replace { ns: String, doc: Document },
    Delete { ns: String, key: Document },
}

impl TxnOp {
    fn ns(&self) -> Namespace {
        match self {
            TxnOp::Insert { ns, .. }
            | TxnOp::Update { ns, .. }
            | TxnOp::Replace { ns, .. }
            | TxnOp::Delete { ns, .. } => Namespace::parse(ns),
        }
    }
}

/// Write driver for an in-memory sharded cluster.
///
/// Every write goes through the cluster clock, lands in the oplog of the
/// shard that owns it, updates the catalog and wakes waiting readers. It does
/// not store documents: updates and deletes are described by the caller's
/// document key.
pub struct MemoryCluster {
    topology: Arc<MemoryTopology>,
}

impl MemoryCluster {
    pub fn new(shards: &[&str]) -> Self {
        Self {
            topology: Arc::new(MemoryTopology::new(shards)),
        }
    }

    pub fn topology(&self) -> Arc<MemoryTopology> {
        Arc::clone(&self.topology)
    }

    pub fn cluster_time(&self) -> LogicalTime {
        self.topology.cluster_time()
    }

    pub fn oplog(&self, shard: &str) -> Result<Arc<MemoryOplog>, OplogError> {
        self.topology.oplog(shard)
    }

    fn write<R>(&self, f: impl FnOnce(LogicalTime) -> Result<R, OplogError>) -> Result<R, OplogError> {
        let result = self.topology.clock.advance(f);
        self.topology.notifier.notify_all();
        result
    }

    fn append(&self, shard: &str, entry: RawLogEntry) -> Result<(), OplogError> {
        self.topology.oplog(shard)?.append(entry)
    }

    /// Owning shard for a document key: hashed shard key for sharded
    /// collections, the primary shard otherwise.
    fn route(&self, ns: &Namespace, key: &Document, ts: LogicalTime) -> Result<String, OplogError> {
        let catalog = self.topology.catalog();
        if !catalog.is_sharded_at(ns, ts) {
            return Ok(self.topology.primary_shard().to_string());
        }
        let pattern = catalog.key_pattern_at(ns, ts);
        let mut hasher = DefaultHasher::new();
        for field in pattern.keys() {
            field.hash(&mut hasher);
            key.get(field).map(|v| v.to_string()).hash(&mut hasher);
        }
        let shards = self.topology.shards_at(ts);
        if shards.is_empty() {
            return Err(OplogError::Storage("no shards available".into()));
        }
        let idx = (hasher.finish() % shards.len() as u64) as usize;
        Ok(shards[idx].clone())
    }

    fn key_for(&self, ns: &Namespace, doc: &Document, ts: LogicalTime) -> Result<Document, OplogError> {
        let id = doc
            .get("_id")
            .ok_or_else(|| OplogError::Storage(format!("document for {ns} has no _id")))?;
        let pattern = self.topology.catalog().key_pattern_at(ns, ts);
        Ok(project_key(&pattern, doc, id))
    }

    fn collection_ns(ns: &str) -> Result<Namespace, OplogError> {
        let parsed = Namespace::parse(ns);
        if parsed.coll.is_none() {
            return Err(OplogError::UnknownNamespace(ns.to_string()));
        }
        Ok(parsed)
    }

    fn require_exists(&self, ns: &Namespace) -> Result<(), OplogError> {
        if self.topology.catalog().exists_at(ns, self.cluster_time()) {
            Ok(())
        } else {
            Err(OplogError::UnknownNamespace(ns.full_name()))
        }
    }

    /// Create `ns` if it does not exist yet, the way a first insert does.
    fn ensure_collection(&self, ns: &Namespace) -> Result<(), OplogError> {
        if self.topology.catalog().exists_at(ns, self.cluster_time()) {
            return Ok(());
        }
        self.create(&ns.full_name()).map(|_| ())
    }

    // ── Document writes ─────────────────────────────────────────

    pub fn insert(&self, ns: &str, doc: Document) -> Result<LogicalTime, OplogError> {
        let ns = Self::collection_ns(ns)?;
        self.ensure_collection(&ns)?;
        self.write(|ts| {
            let key = self.key_for(&ns, &doc, ts)?;
            let shard = self.route(&ns, &key, ts)?;
            self.append(&shard, RawLogEntry::new(ts, ns, OpKind::Insert, doc).with_key(key))?;
            Ok(ts)
        })
    }

    /// Apply a `$set`/`$unset` delta to the document identified by `key`.
    pub fn update(&self, ns: &str, key: Document, update: Document) -> Result<LogicalTime, OplogError> {
        let ns = Self::collection_ns(ns)?;
        self.require_exists(&ns)?;
        self.write(|ts| {
            let key = self.key_for(&ns, &key, ts)?;
            let shard = self.route(&ns, &key, ts)?;
            self.append(&shard, RawLogEntry::new(ts, ns, OpKind::Update, update).with_key(key))?;
            Ok(ts)
        })
    }

    pub fn replace(&self, ns: &str, doc: Document) -> Result<LogicalTime, OplogError> {
        let ns = Self::collection_ns(ns)?;
        self.require_exists(&ns)?;
        self.write(|ts| {
            let key = self.key_for(&ns, &doc, ts)?;
            let shard = self.route(&ns, &key, ts)?;
            self.append(&shard, RawLogEntry::new(ts, ns, OpKind::Update, doc).with_key(key))?;
            Ok(ts)
        })
    }

    pub fn delete(&self, ns: &str, key: Document) -> Result<LogicalTime, OplogError> {
        let ns = Self::collection_ns(ns)?;
        self.require_exists(&ns)?;
        self.write(|ts| {
            let key = self.key_for(&ns, &key, ts)?;
            let shard = self.route(&ns, &key, ts)?;
            self.append(&shard, RawLogEntry::new(ts, ns, OpKind::Delete, key))?;
            Ok(ts)
        })
    }

    /// Commit a multi-document transaction. Every participating shard logs
    /// one commit entry, all stamped with the same cluster time.
    pub fn transaction(&self, lsid: Document, txn_number: i64, ops: Vec<TxnOp>) -> Result<LogicalTime, OplogError> {
        for op in &ops {
            let ns = op.ns();
            if ns.coll.is_none() {
                return Err(OplogError::UnknownNamespace(ns.full_name()));
            }
            match op {
                TxnOp::Insert { .. } => self.ensure_collection(&ns)?,
                _ => self.require_exists(&ns)?,
            }
        }
        self.write(|ts| {
            let mut per_shard: BTreeMap<String, (Vec<Bson>, Vec<i32>)> = BTreeMap::new();
            for (stmt_id, op) in ops.into_iter().enumerate() {
                let ns = op.ns();
                let (shard, statement) = match op {
                    TxnOp::Insert { doc, .. } => {
                        let key = self.key_for(&ns, &doc, ts)?;
                        let shard = self.route(&ns, &key, ts)?;
                        (shard, doc! { "op": "i", "ns": ns.full_name(), "o": doc, "o2": key })
                    }
                    TxnOp::Update { key, update, .. } => {
                        let key = self.key_for(&ns, &key, ts)?;
                        let shard = self.route(&ns, &key, ts)?;
                        (shard, doc! { "op": "u", "ns": ns.full_name(), "o": update, "o2": key })
                    }
                    TxnOp::Replace { doc, .. } => {
                        let key = self.key_for(&ns, &doc, ts)?;
                        let shard = self.route(&ns, &key, ts)?;
                        (shard, doc! { "op": "u", "ns": ns.full_name(), "o": doc, "o2": key })
                    }
                    TxnOp::Delete { key, .. } => {
                        let key = self.key_for(&ns, &key, ts)?;
                        let shard = self.route(&ns, &key, ts)?;
                        (shard, doc! { "op": "d", "ns": ns.full_name(), "o": key })
                    }
                };
                let slot = per_shard.entry(shard).or_default();
                slot.0.push(Bson::Document(statement));
                slot.1.push(stmt_id as i32);
            }
            for (shard, (statements, stmt_ids)) in per_shard {
                let entry = RawLogEntry::new(
                    ts,
                    Namespace::collection("admin", "$cmd"),
                    OpKind::CommitTxn,
                    doc! { "applyOps": statements },
                )
                .with_txn(lsid.clone(), txn_number, stmt_ids);
                self.append(&shard, entry)?;
            }
            Ok(ts)
        })
    }

    // ── DDL ─────────────────────────────────────────────────────

    pub fn create(&self, ns: &str) -> Result<LogicalTime, OplogError> {
        let ns = Self::collection_ns(ns)?;
        if self.topology.catalog().exists_at(&ns, self.cluster_time()) {
            return Err(OplogError::Storage(format!("namespace exists: {ns}")));
        }
        let coll = ns.coll.clone().unwrap_or_default();
        self.write(|ts| {
            let primary = self.topology.primary_shard().to_string();
            self.append(&primary, RawLogEntry::new(ts, ns.clone(), OpKind::Ddl, doc! { "create": coll }))?;
            self.topology.catalog().record_create(&ns, ts);
            debug!(ns = %ns, %ts, "collection created");
            Ok(ts)
        })
    }

    pub fn drop_collection(&self, ns: &str) -> Result<LogicalTime, OplogError> {
        let ns = Self::collection_ns(ns)?;
        self.require_exists(&ns)?;
        let coll = ns.coll.clone().unwrap_or_default();
        self.write(|ts| {
            let primary = self.topology.primary_shard().to_string();
            self.append(&primary, RawLogEntry::new(ts, ns.clone(), OpKind::Ddl, doc! { "drop": coll }))?;
            self.topology.catalog().record_drop(&ns, ts);
            debug!(ns = %ns, %ts, "collection dropped");
            Ok(ts)
        })
    }

    /// Rename within one database. Sharded collections cannot be renamed.
    pub fn rename(&self, from: &str, to: &str) -> Result<LogicalTime, OplogError> {
        let from = Self::collection_ns(from)?;
        let to = Self::collection_ns(to)?;
        self.require_exists(&from)?;
        let catalog = self.topology.catalog();
        let now = self.cluster_time();
        if from.db != to.db || catalog.is_sharded_at(&from, now) || catalog.exists_at(&to, now) {
            return Err(OplogError::Storage(format!("cannot rename {from} to {to}")));
        }
        self.write(|ts| {
            let primary = self.topology.primary_shard().to_string();
            let description = doc! { "renameCollection": from.full_name(), "to": to.full_name() };
            self.append(&primary, RawLogEntry::new(ts, from.clone(), OpKind::Ddl, description))?;
            catalog.record_drop(&from, ts);
            catalog.record_create(&to, ts);
            Ok(ts)
        })
    }

    pub fn drop_database(&self, db: &str) -> Result<LogicalTime, OplogError> {
        let catalog = self.topology.catalog();
        self.write(|ts| {
            let primary = self.topology.primary_shard().to_string();
            let entry = RawLogEntry::new(ts, Namespace::database(db), OpKind::Ddl, doc! { "dropDatabase": 1 });
            self.append(&primary, entry)?;
            for coll in catalog.collections_alive_before(db, ts) {
                catalog.record_drop(&Namespace::collection(db, coll), ts);
            }
            Ok(ts)
        })
    }

    pub fn shard_collection(&self, ns: &str, key: Document) -> Result<LogicalTime, OplogError> {
        let ns = Self::collection_ns(ns)?;
        self.ensure_collection(&ns)?;
        if self.topology.catalog().is_sharded_at(&ns, self.cluster_time()) {
            return Err(OplogError::Storage(format!("already sharded: {ns}")));
        }
        self.write(|ts| {
            self.topology.catalog().record_shard_key(&ns, key.clone(), ts);
            self.topology.record_change(TopologyChange {
                at: ts,
                kind: TopologyChangeKind::CollectionSharded { ns: ns.clone(), key },
            });
            Ok(ts)
        })
    }

    // ── Shard membership and faults ─────────────────────────────

    pub fn add_shard(&self, shard: &str) -> Result<LogicalTime, OplogError> {
        self.write(|ts| self.topology.add_shard_at(shard, ts).map(|_| ts))
    }

    pub fn remove_shard(&self, shard: &str) -> Result<LogicalTime, OplogError> {
        self.write(|ts| self.topology.remove_shard_at(shard, ts).map(|_| ts))
    }

    pub fn set_shard_available(&self, shard: &str, available: bool) -> Result<(), OplogError> {
        self.topology.oplog(shard)?.set_available(available);
        Ok(())
    }

    pub fn truncate_oplog(&self, shard: &str, through: LogicalTime) -> Result<(), OplogError> {
        self.topology.oplog(shard)?.truncate_through(through);
        Ok(())
    }
}
