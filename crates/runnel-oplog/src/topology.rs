use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use bson::Document;
use imbl::Vector;
use tracing::info;

use crate::catalog::Catalog;
use crate::entry::Namespace;
use crate::error::OplogError;
use crate::memory::MemoryOplog;
use crate::notify::{ClusterClock, Notifier};
use crate::source::OplogSource;
use crate::time::LogicalTime;

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyChangeKind {
    ShardAdded { shard: String },
    ShardRemoved { shard: String },
    CollectionSharded { ns: Namespace, key: Document },
}

/// A change to the shard set or to collection placement metadata, stamped
/// with the cluster time at which it took effect.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyChange {
    pub at: LogicalTime,
    pub kind: TopologyChangeKind,
}

/// The sharding layer as seen by a change stream: which shards exist when,
/// how to read each one, and what changed since a given time.
pub trait Topology: Send + Sync {
    /// Shards that were part of the cluster at `ts`, sorted by id.
    fn shards_at(&self, ts: LogicalTime) -> Vec<String>;

    fn source(&self, shard: &str) -> Result<Arc<dyn OplogSource>, OplogError>;

    /// Changes stamped after `after`, plus a time through which the returned
    /// list is known to be complete.
    fn changes_after(&self, after: LogicalTime) -> Result<(Vec<TopologyChange>, LogicalTime), OplogError>;

    fn catalog(&self) -> Arc<Catalog>;

    /// Signalled whenever any shard or the topology itself changes.
    fn notifier(&self) -> Arc<Notifier>;

    fn cluster_time(&self) -> LogicalTime;
}

struct ShardRecord {
    oplog: Arc<MemoryOplog>,
    added: LogicalTime,
    removed: Option<LogicalTime>,
}

/// In-memory shard registry backing [`crate::MemoryCluster`].
pub struct MemoryTopology {
    pub(crate) clock: Arc<ClusterClock>,
    pub(crate) notifier: Arc<Notifier>,
    catalog: Arc<Catalog>,
    primary: String,
    shards: RwLock<BTreeMap<String, ShardRecord>>,
    changes: ArcSwap<Vector<TopologyChange>>,
}

impl MemoryTopology {
    /// Start with `shards` present from the beginning of time. The first one
    /// is the primary shard, which owns unsharded collections and DDL.
    pub fn new(shards: &[&str]) -> Self {
        let clock = Arc::new(ClusterClock::new());
        let notifier = Arc::new(Notifier::new());
        let mut records = BTreeMap::new();
        for shard in shards {
            records.insert(
                shard.to_string(),
                ShardRecord {
                    oplog: Arc::new(MemoryOplog::new(*shard, Arc::clone(&clock), Arc::clone(&notifier))),
                    added: LogicalTime::ZERO,
                    removed: None,
                },
            );
        }
        Self {
            clock,
            notifier,
            catalog: Arc::new(Catalog::new()),
            primary: shards.first().map(|s| s.to_string()).unwrap_or_default(),
            shards: RwLock::new(records),
            changes: ArcSwap::new(Arc::new(Vector::new())),
        }
    }

    pub fn primary_shard(&self) -> &str {
        &self.primary
    }

    pub fn oplog(&self, shard: &str) -> Result<Arc<MemoryOplog>, OplogError> {
        self.shards
            .read()
            .unwrap()
            .get(shard)
            .map(|r| Arc::clone(&r.oplog))
            .ok_or_else(|| OplogError::UnknownShard(shard.to_string()))
    }

    pub(crate) fn add_shard_at(&self, shard: &str, at: LogicalTime) -> Result<(), OplogError> {
        let mut shards = self.shards.write().unwrap();
        if shards.get(shard).is_some_and(|r| r.removed.is_none()) {
            return Err(OplogError::Storage(format!("shard already present: {shard}")));
        }
        let oplog = Arc::new(MemoryOplog::new(shard, Arc::clone(&self.clock), Arc::clone(&self.notifier)));
        shards.insert(
            shard.to_string(),
            ShardRecord {
                oplog,
                added: at,
                removed: None,
            },
        );
        drop(shards);
        info!(shard, %at, "shard added");
        self.record_change(TopologyChange {
            at,
            kind: TopologyChangeKind::ShardAdded {
                shard: shard.to_string(),
            },
        });
        Ok(())
    }

    pub(crate) fn remove_shard_at(&self, shard: &str, at: LogicalTime) -> Result<(), OplogError> {
        if shard == self.primary {
            return Err(OplogError::Storage(format!("cannot remove primary shard {shard}")));
        }
        let mut shards = self.shards.write().unwrap();
        let record = shards
            .get_mut(shard)
            .filter(|r| r.removed.is_none())
            .ok_or_else(|| OplogError::UnknownShard(shard.to_string()))?;
        record.removed = Some(at);
        drop(shards);
        info!(shard, %at, "shard removed");
        self.record_change(TopologyChange {
            at,
            kind: TopologyChangeKind::ShardRemoved {
                shard: shard.to_string(),
            },
        });
        Ok(())
    }

    pub(crate) fn record_change(&self, change: TopologyChange) {
        let mut changes = (**self.changes.load()).clone();
        changes.push_back(change);
        self.changes.store(Arc::new(changes));
    }
}

impl Topology for MemoryTopology {
    fn shards_at(&self, ts: LogicalTime) -> Vec<String> {
        self.shards
            .read()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.added <= ts && r.removed.is_none_or(|removed| ts < removed))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn source(&self, shard: &str) -> Result<Arc<dyn OplogSource>, OplogError> {
        let oplog: Arc<dyn OplogSource> = self.oplog(shard)?;
        Ok(oplog)
    }

    fn changes_after(&self, after: LogicalTime) -> Result<(Vec<TopologyChange>, LogicalTime), OplogError> {
        let frontier = self.clock.now();
        let changes = self.changes.load();
        let list = changes
            .iter()
            .filter(|c| c.at > after && c.at <= frontier)
            .cloned()
            .collect();
        Ok((list, frontier))
    }

    fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog)
    }

    fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    fn cluster_time(&self) -> LogicalTime {
        self.clock.now()
    }
}
