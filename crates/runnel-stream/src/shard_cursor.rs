use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use runnel_oplog::{CancelToken, LogicalTime, OpKind, OplogSource, RawLogEntry, WaitOutcome};
use tracing::debug;

use crate::error::StreamError;
use crate::event::{ChangeEvent, OperationType};
use crate::normalize::Normalizer;
use crate::rewrite::CompiledFilter;
use crate::token::ResumeToken;
use crate::wake::interrupted;
use crate::watch::WatchScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Idle,
    Pulling,
    Delivering,
    Invalidated,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullResult {
    Event(ChangeEvent),
    /// Nothing left at or before this time.
    Heartbeat(LogicalTime),
    Invalidate(ChangeEvent),
}

/// Where a cursor starts reading.
#[derive(Debug, Clone, PartialEq)]
pub struct StartPoint {
    /// Read entries strictly after this time.
    pub after: LogicalTime,
    /// Suppress events at or before this token. Set when resuming from an
    /// event in the middle of a multi-event entry.
    pub skip_through: Option<ResumeToken>,
}

impl StartPoint {
    pub fn after(after: LogicalTime) -> Self {
        Self {
            after,
            skip_through: None,
        }
    }
}

/// Reads one shard's oplog and yields the events of a single stream, in
/// oplog order, plus heartbeats when it runs out of visible entries.
pub struct ShardCursor {
    shard: String,
    source: Arc<dyn OplogSource>,
    filter: Arc<CompiledFilter>,
    normalizer: Arc<Normalizer>,
    scope: WatchScope,
    position: LogicalTime,
    skip_through: Option<ResumeToken>,
    buffer: VecDeque<ChangeEvent>,
    state: CursorState,
    read_limit: usize,
}

impl ShardCursor {
    pub fn new(
        source: Arc<dyn OplogSource>,
        filter: Arc<CompiledFilter>,
        normalizer: Arc<Normalizer>,
        scope: WatchScope,
        start: StartPoint,
        read_limit: usize,
    ) -> Self {
        let shard = source.shard().to_string();
        debug!(shard = %shard, after = %start.after, "shard cursor opened");
        Self {
            shard,
            source,
            filter,
            normalizer,
            scope,
            position: start.after,
            skip_through: start.skip_through,
            buffer: VecDeque::new(),
            state: CursorState::Idle,
            read_limit: read_limit.max(1),
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Every entry at or before this time has been processed.
    pub fn position(&self) -> LogicalTime {
        self.position
    }

    /// Produce the next result without blocking: a buffered or newly read
    /// event, or a heartbeat once every visible entry has been consumed.
    pub fn try_pull(&mut self) -> Result<PullResult, StreamError> {
        match self.state {
            CursorState::Invalidated => {
                return Err(StreamError::Invalidated(format!("cursor on {} was invalidated", self.shard)));
            }
            CursorState::Closed => {
                return Err(StreamError::Invalidated(format!("cursor on {} is closed", self.shard)));
            }
            _ => {}
        }
        if let Some(event) = self.buffer.pop_front() {
            return Ok(self.deliver(event));
        }

        self.state = CursorState::Pulling;
        loop {
            // Read the bound first: anything stamped at or before it is
            // already in the log when the read below runs.
            let visible = self.source.visible_through()?;
            let entries = self.source.read_after(self.position, self.read_limit)?;
            let full = entries.len() == self.read_limit;
            let mut past_visible = false;

            for entry in entries {
                if entry.ts > visible {
                    past_visible = true;
                    break;
                }
                let events = self.process(&entry)?;
                self.position = entry.ts;
                if !events.is_empty() {
                    self.buffer.extend(events);
                    if let Some(event) = self.buffer.pop_front() {
                        return Ok(self.deliver(event));
                    }
                }
            }

            if past_visible || !full {
                self.position = self.position.max(visible);
                self.clear_skip();
                self.state = CursorState::Idle;
                return Ok(PullResult::Heartbeat(self.position));
            }
        }
    }

    /// Like [`try_pull`](Self::try_pull), but waits for new entries until
    /// `deadline` instead of returning a heartbeat straight away.
    pub fn pull(&mut self, deadline: Instant, cancel: &CancelToken) -> Result<PullResult, StreamError> {
        let notifier = self.source.notifier();
        loop {
            let seen = notifier.epoch();
            match self.try_pull()? {
                PullResult::Heartbeat(ts) => match notifier.wait_past(seen, deadline, cancel) {
                    WaitOutcome::Notified => continue,
                    WaitOutcome::TimedOut => return Ok(PullResult::Heartbeat(ts)),
                    WaitOutcome::Cancelled(reason) => return Err(interrupted(reason)),
                },
                other => return Ok(other),
            }
        }
    }

    pub fn close(&mut self) {
        if self.state != CursorState::Closed {
            debug!(shard = %self.shard, position = %self.position, "shard cursor closed");
        }
        self.buffer.clear();
        self.state = CursorState::Closed;
    }

    fn deliver(&mut self, event: ChangeEvent) -> PullResult {
        if event.operation_type == OperationType::Invalidate {
            self.buffer.clear();
            self.state = CursorState::Invalidated;
            PullResult::Invalidate(event)
        } else {
            self.state = if self.buffer.is_empty() {
                CursorState::Idle
            } else {
                CursorState::Delivering
            };
            PullResult::Event(event)
        }
    }

    /// Events of one entry that survive both filters, the scope check and
    /// the resume skip.
    fn process(&self, entry: &RawLogEntry) -> Result<Vec<ChangeEvent>, StreamError> {
        if entry.op == OpKind::Noop || !self.filter.admits_entry(entry) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for statement in self.normalizer.unwind(entry, &self.shard)? {
            if entry.op == OpKind::CommitTxn && !self.filter.admits_entry(&statement) {
                continue;
            }
            for event in self.normalizer.normalize_statement(&statement, &self.shard)? {
                if self.keep(&event) {
                    out.push(event);
                }
            }
        }
        Ok(out)
    }

    fn keep(&self, event: &ChangeEvent) -> bool {
        if self.skip_through.as_ref().is_some_and(|skip| event.token <= *skip) {
            return false;
        }
        if event.is_invalidate() {
            return true;
        }
        event.ns.as_ref().is_some_and(|ns| self.scope.contains(ns)) && self.filter.admits_event(event)
    }

    fn clear_skip(&mut self) {
        if self
            .skip_through
            .as_ref()
            .is_some_and(|skip| self.position > skip.cluster_time)
        {
            self.skip_through = None;
        }
    }
}

impl Drop for ShardCursor {
    fn drop(&mut self) {
        self.close();
    }
}
