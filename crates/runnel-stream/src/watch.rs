use bson::Document;
use runnel_oplog::{LogicalTime, Namespace};
use runnel_query::Collation;
use serde::{Deserialize, Serialize};

use crate::token::ResumeToken;

/// What a stream watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchScope {
    Collection(Namespace),
    Database(String),
    /// Every non-internal database.
    Cluster,
}

impl WatchScope {
    pub fn contains(&self, ns: &Namespace) -> bool {
        match self {
            WatchScope::Collection(watched) => watched == ns,
            WatchScope::Database(db) => &ns.db == db,
            WatchScope::Cluster => !ns.is_internal(),
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, WatchScope::Cluster)
    }

    pub fn watched_collection(&self) -> Option<&Namespace> {
        match self {
            WatchScope::Collection(ns) => Some(ns),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StartPosition {
    /// Only changes after the current cluster time.
    Now,
    /// Changes at or after the given time.
    AtClusterTime(LogicalTime),
    /// Changes strictly after the token. Invalidate tokens are rejected.
    ResumeAfter(ResumeToken),
    /// Like `ResumeAfter`, but accepts an invalidate token and starts a new
    /// stream after it.
    StartAfter(ResumeToken),
}

/// Which oplogs a stream reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// Merge every shard in the cluster.
    Router,
    /// Read one shard directly, without merging.
    Shard(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub scope: WatchScope,
    #[serde(default)]
    pub filter: Document,
    #[serde(default)]
    pub collation: Option<Collation>,
    pub start: StartPosition,
    #[serde(default)]
    pub show_expanded_events: bool,
    #[serde(default)]
    pub allow_topology_events: bool,
    pub target: Target,
}

impl StreamOptions {
    pub fn new(scope: WatchScope) -> Self {
        Self {
            scope,
            filter: Document::new(),
            collation: None,
            start: StartPosition::Now,
            show_expanded_events: false,
            allow_topology_events: false,
            target: Target::Router,
        }
    }

    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = filter;
        self
    }

    pub fn start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn expanded_events(mut self) -> Self {
        self.show_expanded_events = true;
        self
    }

    pub fn topology_events(mut self) -> Self {
        self.allow_topology_events = true;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}
