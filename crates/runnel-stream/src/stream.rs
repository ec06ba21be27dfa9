use std::time::{Duration, Instant};

use runnel_oplog::CancelToken;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::event::ChangeEvent;
use crate::merge::{MergeCoordinator, MergeItem};
use crate::token::ResumeToken;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(ChangeEvent),
    /// Timed out; resuming from this token loses nothing.
    Heartbeat(ResumeToken),
    /// The final event of the stream.
    Invalidated(ChangeEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub events: Vec<ChangeEvent>,
    pub post_batch_resume_token: ResumeToken,
    /// The last event is an invalidate and the stream is over.
    pub invalidated: bool,
}

/// Client-facing status of a stream, for listing open cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub shards: Vec<String>,
    pub resume_token: ResumeToken,
    pub invalidated: bool,
}

/// One open change stream.
pub struct ChangeStream {
    merge: MergeCoordinator,
    invalidated: bool,
}

impl ChangeStream {
    pub fn new(merge: MergeCoordinator) -> Self {
        Self {
            merge,
            invalidated: false,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn resume_token(&self) -> ResumeToken {
        self.merge.resume_token()
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            shards: self.merge.shards(),
            resume_token: self.merge.resume_token(),
            invalidated: self.invalidated,
        }
    }

    pub fn get_next(&mut self, max_wait: Duration, cancel: &CancelToken) -> Result<StreamItem, StreamError> {
        let item = match self.merge.advance(Instant::now() + max_wait, cancel)? {
            MergeItem::Event(event) => StreamItem::Event(event),
            MergeItem::Heartbeat(token) => StreamItem::Heartbeat(token),
            MergeItem::Invalidate(event) => {
                self.invalidated = true;
                StreamItem::Invalidated(event)
            }
        };
        Ok(item)
    }

    /// Up to `batch_size` events. Waits up to `max_wait` for the first one,
    /// then takes only what is ready without waiting again.
    pub fn get_more(&mut self, batch_size: usize, max_wait: Duration, cancel: &CancelToken) -> Result<Batch, StreamError> {
        let deadline = Instant::now() + max_wait;
        let mut events = Vec::new();
        while events.len() < batch_size.max(1) {
            let wait_until = if events.is_empty() { deadline } else { Instant::now() };
            let item = match self.merge.advance(wait_until, cancel) {
                Ok(item) => item,
                // Events already taken from the merge must not be lost; the
                // error will come back on the next call.
                Err(_) if !events.is_empty() => break,
                Err(err) => return Err(err),
            };
            match item {
                MergeItem::Event(event) => events.push(event),
                MergeItem::Invalidate(event) => {
                    events.push(event);
                    self.invalidated = true;
                    break;
                }
                MergeItem::Heartbeat(_) => break,
            }
        }
        Ok(Batch {
            events,
            post_batch_resume_token: self.merge.resume_token(),
            invalidated: self.invalidated,
        })
    }

    pub fn close(&mut self) {
        self.merge.close();
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.merge.close();
    }
}
