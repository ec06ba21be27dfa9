use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bson::doc;
use runnel_oplog::{CancelToken, LogicalTime, Topology, TopologyChange, TopologyChangeKind};
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::event::{ChangeEvent, ControlMarker, OperationType, Provenance};
use crate::normalize::Normalizer;
use crate::rewrite::CompiledFilter;
use crate::shard_cursor::{PullResult, ShardCursor, StartPoint};
use crate::token::ResumeToken;
use crate::wake::{Wake, WakeScheduler};
use crate::watch::{StreamOptions, Target, WatchScope};

#[derive(Debug, Clone, PartialEq)]
pub enum MergeItem {
    Event(ChangeEvent),
    Invalidate(ChangeEvent),
    /// No event before the deadline; every event after this token is still
    /// to come.
    Heartbeat(ResumeToken),
}

struct ShardSlot {
    cursor: ShardCursor,
    buffered: Option<PullResult>,
    /// Set once the shard has left the cluster. The slot goes away when its
    /// cursor reports progress past this time.
    draining_until: Option<LogicalTime>,
}

enum ControlItem {
    Change(TopologyChange),
    Heartbeat(LogicalTime),
}

/// Topology changes, read like one more shard.
struct ControlFeed {
    position: LogicalTime,
    pending: VecDeque<TopologyChange>,
    buffered: Option<ControlItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Shard(String),
    Control,
}

/// Merges per-shard cursors into one stream ordered by resume token.
///
/// An item is released only when every shard has either buffered a later
/// item or reported a heartbeat at or past it, so no shard can still hold
/// something earlier.
pub struct MergeCoordinator {
    topology: Arc<dyn Topology>,
    filter: Arc<CompiledFilter>,
    normalizer: Arc<Normalizer>,
    scope: WatchScope,
    show_expanded_events: bool,
    allow_topology_events: bool,
    direct_shard: Option<String>,
    read_limit: usize,
    slots: BTreeMap<String, ShardSlot>,
    control: ControlFeed,
    skip_through: Option<ResumeToken>,
    frontier: LogicalTime,
    last_token: Option<ResumeToken>,
    scheduler: WakeScheduler,
    finished: bool,
}

impl MergeCoordinator {
    pub fn open(
        topology: Arc<dyn Topology>,
        options: &StreamOptions,
        filter: Arc<CompiledFilter>,
        start: StartPoint,
        config: &StreamConfig,
    ) -> Result<Self, StreamError> {
        let normalizer = Arc::new(Normalizer::new(
            topology.catalog(),
            options.scope.clone(),
            options.show_expanded_events,
        ));
        let direct_shard = match &options.target {
            Target::Router => None,
            Target::Shard(shard) => Some(shard.clone()),
        };
        let shards = match &direct_shard {
            Some(shard) => vec![shard.clone()],
            None => topology.shards_at(start.after),
        };
        let scheduler = WakeScheduler::new(topology.notifier(), config.retry.clone());

        let mut merge = Self {
            topology,
            filter,
            normalizer,
            scope: options.scope.clone(),
            show_expanded_events: options.show_expanded_events,
            allow_topology_events: options.allow_topology_events,
            direct_shard,
            read_limit: config.read_batch_limit,
            slots: BTreeMap::new(),
            control: ControlFeed {
                position: start.after,
                pending: VecDeque::new(),
                buffered: None,
            },
            skip_through: start.skip_through.clone(),
            frontier: start.after,
            last_token: start.skip_through.clone(),
            scheduler,
            finished: false,
        };
        for shard in shards {
            merge.open_shard(&shard, start.clone())?;
        }
        debug!(shards = merge.slots.len(), after = %start.after, "merge opened");
        Ok(merge)
    }

    fn open_shard(&mut self, shard: &str, start: StartPoint) -> Result<(), StreamError> {
        let source = self.topology.source(shard)?;
        let earliest = source.earliest_retained();
        if start.after < earliest {
            return Err(StreamError::InvalidResumeToken(format!(
                "history on {shard} starts after {earliest}, requested {}",
                start.after
            )));
        }
        let cursor = ShardCursor::new(
            source,
            Arc::clone(&self.filter),
            Arc::clone(&self.normalizer),
            self.scope.clone(),
            start,
            self.read_limit,
        );
        self.slots.insert(
            shard.to_string(),
            ShardSlot {
                cursor,
                buffered: None,
                draining_until: None,
            },
        );
        Ok(())
    }

    pub fn shards(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// Position to resume from after everything delivered so far.
    pub fn resume_token(&self) -> ResumeToken {
        let frontier = ResumeToken::frontier(self.frontier);
        match &self.last_token {
            Some(last) if *last > frontier => last.clone(),
            _ => frontier,
        }
    }

    /// Next item, waiting up to `deadline` for one.
    pub fn advance(&mut self, deadline: Instant, cancel: &CancelToken) -> Result<MergeItem, StreamError> {
        if self.finished {
            return Err(StreamError::Invalidated("stream already invalidated".into()));
        }
        let scheduler = self.scheduler.clone();
        match scheduler.wait(deadline, cancel, || self.step())? {
            Wake::Ready(item) => Ok(item),
            Wake::TimedOut => Ok(MergeItem::Heartbeat(self.resume_token())),
        }
    }

    pub fn close(&mut self) {
        for slot in self.slots.values_mut() {
            slot.cursor.close();
        }
        self.slots.clear();
    }

    /// Make progress without blocking. Returns `None` once the earliest
    /// outstanding item is a heartbeat, meaning more data is needed.
    pub fn step(&mut self) -> Result<Option<MergeItem>, StreamError> {
        loop {
            self.refill()?;

            let Some((key, source)) = self.minimum() else {
                return Ok(None);
            };
            match source {
                Source::Control => match self.control.buffered.take() {
                    Some(ControlItem::Change(change)) => match self.apply(change.clone()) {
                        Ok(Some(event)) => {
                            self.last_token = Some(event.token.clone());
                            return Ok(Some(MergeItem::Event(event)));
                        }
                        Ok(None) => self.note_progress(key),
                        Err(err) => {
                            // Kept buffered so every later step fails the same way.
                            self.control.buffered = Some(ControlItem::Change(change));
                            return Err(err);
                        }
                    },
                    Some(ControlItem::Heartbeat(ts)) => {
                        self.control.buffered = Some(ControlItem::Heartbeat(ts));
                        self.reach_frontier(ts);
                        return Ok(None);
                    }
                    None => return Ok(None),
                },
                Source::Shard(shard) => {
                    let Some(slot) = self.slots.get_mut(&shard) else {
                        continue;
                    };
                    match slot.buffered.take() {
                        Some(PullResult::Event(event)) => {
                            self.last_token = Some(event.token.clone());
                            return Ok(Some(MergeItem::Event(event)));
                        }
                        Some(PullResult::Invalidate(event)) => {
                            self.last_token = Some(event.token.clone());
                            self.finished = true;
                            self.close();
                            return Ok(Some(MergeItem::Invalidate(event)));
                        }
                        Some(PullResult::Heartbeat(ts)) => {
                            slot.buffered = Some(PullResult::Heartbeat(ts));
                            self.reach_frontier(ts);
                            return Ok(None);
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Fill every empty buffer.
    fn refill(&mut self) -> Result<(), StreamError> {
        if self.control.buffered.is_none() {
            if self.control.pending.is_empty() {
                let (changes, frontier) = self.topology.changes_after(self.control.position)?;
                self.control.pending.extend(changes);
                self.control.position = self.control.position.max(frontier);
            }
            self.control.buffered = Some(match self.control.pending.pop_front() {
                Some(change) => ControlItem::Change(change),
                None => ControlItem::Heartbeat(self.control.position),
            });
        }

        let mut drained = Vec::new();
        for (shard, slot) in self.slots.iter_mut() {
            if slot.buffered.is_none() {
                slot.buffered = Some(slot.cursor.try_pull()?);
            }
            if let (Some(until), Some(PullResult::Heartbeat(ts))) = (slot.draining_until, &slot.buffered) {
                if *ts >= until {
                    drained.push(shard.clone());
                }
            }
        }
        for shard in drained {
            info!(shard = %shard, "removed shard drained");
            self.slots.remove(&shard);
        }
        Ok(())
    }

    /// The earliest buffered item across shards and the control feed.
    fn minimum(&self) -> Option<(ResumeToken, Source)> {
        let control = self.control.buffered.as_ref().map(|item| {
            let key = match item {
                ControlItem::Change(change) => ResumeToken::control(change.at),
                ControlItem::Heartbeat(ts) => ResumeToken::frontier(*ts),
            };
            (key, Source::Control)
        });
        let shards = self.slots.iter().filter_map(|(shard, slot)| {
            let key = match slot.buffered.as_ref()? {
                PullResult::Event(event) | PullResult::Invalidate(event) => event.token.clone(),
                PullResult::Heartbeat(ts) => ResumeToken::frontier(*ts),
            };
            Some((key, Source::Shard(shard.clone())))
        });
        control.into_iter().chain(shards).min_by(|a, b| a.0.cmp(&b.0))
    }

    /// Every outstanding item is past `ts`. Heartbeats are dropped so the
    /// next step polls those shards again.
    fn reach_frontier(&mut self, ts: LogicalTime) {
        self.frontier = self.frontier.max(ts);
        for slot in self.slots.values_mut() {
            if matches!(slot.buffered, Some(PullResult::Heartbeat(_))) {
                slot.buffered = None;
            }
        }
        if matches!(self.control.buffered, Some(ControlItem::Heartbeat(_))) {
            self.control.buffered = None;
        }
    }

    fn note_progress(&mut self, key: ResumeToken) {
        if self.last_token.as_ref().is_none_or(|last| *last < key) {
            self.last_token = Some(key);
        }
    }

    /// Apply a topology change to the merge set, returning the event to
    /// deliver if the stream may see it.
    fn apply(&mut self, change: TopologyChange) -> Result<Option<ChangeEvent>, StreamError> {
        let at = change.at;
        let token = ResumeToken::control(at);
        let mut event = ChangeEvent::new(
            OperationType::ShardAdded,
            at,
            token.clone(),
            Provenance::Control(ControlMarker::new()),
        );
        let visible = match change.kind {
            TopologyChangeKind::ShardAdded { shard } => {
                if let Some(direct) = &self.direct_shard {
                    return Err(StreamError::TopologyChange(format!(
                        "shard {shard} joined while streaming directly from {direct}"
                    )));
                }
                if !self.slots.contains_key(&shard) {
                    info!(shard = %shard, %at, "opening cursor on added shard");
                    self.open_shard(
                        &shard,
                        StartPoint {
                            after: at,
                            skip_through: self.skip_through.clone(),
                        },
                    )?;
                }
                event.extra = Some(doc! { "shard": shard });
                self.scope.is_cluster() && self.allow_topology_events
            }
            TopologyChangeKind::ShardRemoved { shard } => {
                if let Some(direct) = &self.direct_shard {
                    return Err(StreamError::TopologyChange(format!(
                        "shard {shard} left while streaming directly from {direct}"
                    )));
                }
                if let Some(slot) = self.slots.get_mut(&shard) {
                    info!(shard = %shard, %at, "draining removed shard");
                    slot.draining_until = Some(at);
                }
                event.operation_type = OperationType::ShardRemoved;
                event.extra = Some(doc! { "shard": shard });
                self.scope.is_cluster() && self.allow_topology_events
            }
            TopologyChangeKind::CollectionSharded { ns, key } => {
                let visible = self.show_expanded_events && self.scope.contains(&ns);
                event.operation_type = OperationType::ShardCollection;
                event.ns = Some(ns);
                event.extra = Some(doc! { "shardKey": key });
                visible
            }
        };

        let skipped = self.skip_through.as_ref().is_some_and(|skip| token <= *skip);
        if visible && !skipped && self.filter.admits_event(&event) {
            Ok(Some(event))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Document;
    use runnel_oplog::{MemoryCluster, Namespace};
    use runnel_query::{Expression, parse_filter};
    use std::time::Duration;

    use crate::rewrite::compile;

    fn open(cluster: &MemoryCluster, options: StreamOptions, after: LogicalTime) -> MergeCoordinator {
        let filter = compile(&parse_filter(&options.filter).unwrap(), &options.scope, None, true);
        MergeCoordinator::open(
            cluster.topology(),
            &options,
            Arc::new(filter),
            StartPoint::after(after),
            &StreamConfig::default(),
        )
        .unwrap()
    }

    fn drain(merge: &mut MergeCoordinator) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        while let Some(item) = merge.step().unwrap() {
            match item {
                MergeItem::Event(e) | MergeItem::Invalidate(e) => out.push(e),
                MergeItem::Heartbeat(_) => break,
            }
        }
        out
    }

    fn sharded_cluster() -> MemoryCluster {
        let cluster = MemoryCluster::new(&["shard0", "shard1"]);
        cluster.shard_collection("app.users", bson::doc! { "x": 1 }).unwrap();
        cluster
    }

    #[test]
    fn events_from_all_shards_arrive_in_token_order() {
        let cluster = sharded_cluster();
        let start = cluster.cluster_time();
        for i in 0..20 {
            cluster.insert("app.users", bson::doc! { "_id": i, "x": i }).unwrap();
        }
        let mut merge = open(&cluster, StreamOptions::new(WatchScope::Cluster), start);
        let events = drain(&mut merge);
        assert_eq!(events.len(), 20);
        assert!(events.windows(2).all(|w| w[0].token < w[1].token));
        let shards: std::collections::BTreeSet<String> = events
            .iter()
            .filter_map(|e| match &e.provenance {
                Provenance::Oplog { shard } => Some(shard.clone()),
                Provenance::Control(_) => None,
            })
            .collect();
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn heartbeat_token_reaches_cluster_time() {
        let cluster = sharded_cluster();
        let start = cluster.cluster_time();
        cluster.insert("other.things", bson::doc! { "_id": 1 }).unwrap();
        let now = cluster.cluster_time();
        let scope = WatchScope::Collection(Namespace::collection("app", "users"));
        let mut merge = open(&cluster, StreamOptions::new(scope), start);
        let item = merge
            .advance(Instant::now() + Duration::from_millis(20), &CancelToken::new())
            .unwrap();
        assert_eq!(item, MergeItem::Heartbeat(ResumeToken::frontier(now)));
    }

    #[test]
    fn added_shard_joins_the_merge() {
        let cluster = MemoryCluster::new(&["shard0"]);
        let start = cluster.cluster_time();
        let options = StreamOptions::new(WatchScope::Cluster).topology_events();
        let mut merge = open(&cluster, options, start);

        cluster.add_shard("shard1").unwrap();
        cluster.shard_collection("app.users", bson::doc! { "x": 1 }).unwrap();
        for i in 0..10 {
            cluster.insert("app.users", bson::doc! { "_id": i, "x": i }).unwrap();
        }
        let events = drain(&mut merge);
        assert_eq!(events[0].operation_type, OperationType::ShardAdded);
        assert!(events[0].is_control());
        assert_eq!(events.len(), 11);
        assert_eq!(merge.shards(), vec!["shard0".to_string(), "shard1".to_string()]);
    }

    #[test]
    fn topology_events_are_hidden_by_default() {
        let cluster = MemoryCluster::new(&["shard0"]);
        let start = cluster.cluster_time();
        let mut merge = open(&cluster, StreamOptions::new(WatchScope::Cluster), start);
        cluster.add_shard("shard1").unwrap();
        cluster.insert("app.users", bson::doc! { "_id": 1 }).unwrap();
        let events = drain(&mut merge);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation_type, OperationType::Insert);
    }

    #[test]
    fn removed_shard_is_drained_then_dropped() {
        let cluster = sharded_cluster();
        let start = cluster.cluster_time();
        let mut merge = open(&cluster, StreamOptions::new(WatchScope::Cluster), start);
        cluster.remove_shard("shard1").unwrap();
        cluster.insert("app.users", bson::doc! { "_id": 1, "x": 1 }).unwrap();
        drain(&mut merge);
        drain(&mut merge);
        assert_eq!(merge.shards(), vec!["shard0".to_string()]);
    }

    #[test]
    fn direct_shard_stream_fails_on_topology_change() {
        let cluster = MemoryCluster::new(&["shard0"]);
        let start = cluster.cluster_time();
        let options = StreamOptions::new(WatchScope::Cluster).target(Target::Shard("shard0".into()));
        let mut merge = open(&cluster, options, start);
        cluster.add_shard("shard1").unwrap();
        let err = merge.step().unwrap_err();
        assert!(matches!(err, StreamError::TopologyChange(_)));
        let again = merge.step().unwrap_err();
        assert!(matches!(again, StreamError::TopologyChange(_)));
    }

    #[test]
    fn shard_collection_event_needs_expanded_events() {
        let cluster = MemoryCluster::new(&["shard0", "shard1"]);
        cluster.create("app.users").unwrap();
        let start = cluster.cluster_time();
        let scope = WatchScope::Collection(Namespace::collection("app", "users"));
        let mut plain = open(&cluster, StreamOptions::new(scope.clone()), start);
        let mut expanded = open(&cluster, StreamOptions::new(scope).expanded_events(), start);
        cluster.shard_collection("app.users", bson::doc! { "x": 1 }).unwrap();

        assert!(drain(&mut plain).is_empty());
        let events = drain(&mut expanded);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation_type, OperationType::ShardCollection);
        assert_eq!(
            events[0].extra.as_ref().and_then(|e| e.get_document("shardKey").ok()),
            Some(&bson::doc! { "x": 1 })
        );
    }

    #[test]
    fn lookalike_user_document_is_not_a_control_event() {
        let cluster = MemoryCluster::new(&["shard0"]);
        let start = cluster.cluster_time();
        let filter: Document = bson::doc! { "operationType": "shardAdded" };
        let mut merge = open(&cluster, StreamOptions::new(WatchScope::Cluster).filter(filter), start);
        cluster
            .insert("app.users", bson::doc! { "_id": 1, "operationType": "shardAdded", "shard": "evil" })
            .unwrap();
        assert!(drain(&mut merge).is_empty());
    }

    #[test]
    fn lost_history_is_an_invalid_resume_token() {
        let cluster = MemoryCluster::new(&["shard0"]);
        let early = cluster.cluster_time();
        let t = cluster.insert("app.users", bson::doc! { "_id": 1 }).unwrap();
        cluster.truncate_oplog("shard0", t).unwrap();
        let options = StreamOptions::new(WatchScope::Cluster);
        let filter = compile(&Expression::AlwaysTrue, &options.scope, None, true);
        let result = MergeCoordinator::open(
            cluster.topology(),
            &options,
            Arc::new(filter),
            StartPoint::after(early),
            &StreamConfig::default(),
        );
        assert!(matches!(result, Err(StreamError::InvalidResumeToken(_))));
    }
}
