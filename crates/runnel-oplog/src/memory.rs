use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use imbl::Vector;
use tracing::warn;

use crate::entry::RawLogEntry;
use crate::error::OplogError;
use crate::notify::{ClusterClock, Notifier};
use crate::source::OplogSource;
use crate::time::LogicalTime;

/// In-memory oplog for one shard.
///
/// Entries live in a persistent vector behind an [`ArcSwap`], so readers take
/// a cheap snapshot while a writer appends.
pub struct MemoryOplog {
    shard: String,
    entries: ArcSwap<Vector<Arc<RawLogEntry>>>,
    write_lock: Mutex<()>,
    truncated_through: Mutex<LogicalTime>,
    available: AtomicBool,
    clock: Arc<ClusterClock>,
    notifier: Arc<Notifier>,
}

impl MemoryOplog {
    pub fn new(shard: impl Into<String>, clock: Arc<ClusterClock>, notifier: Arc<Notifier>) -> Self {
        Self {
            shard: shard.into(),
            entries: ArcSwap::new(Arc::new(Vector::new())),
            write_lock: Mutex::new(()),
            truncated_through: Mutex::new(LogicalTime::ZERO),
            available: AtomicBool::new(true),
            clock,
            notifier,
        }
    }

    /// Append one entry. Timestamps must be strictly increasing.
    ///
    /// Does not signal the notifier; the writer does that once the whole
    /// write is visible.
    pub fn append(&self, entry: RawLogEntry) -> Result<(), OplogError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut entries = (**self.entries.load()).clone();
        if let Some(last) = entries.last() {
            if entry.ts <= last.ts {
                return Err(OplogError::OutOfOrder(format!(
                    "{}: {} after {}",
                    self.shard, entry.ts, last.ts
                )));
            }
        }
        entries.push_back(Arc::new(entry));
        self.entries.store(Arc::new(entries));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    pub fn last_ts(&self) -> Option<LogicalTime> {
        self.entries.load().last().map(|e| e.ts)
    }

    /// Simulate a stepdown or network partition.
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!(shard = %self.shard, "oplog marked unavailable");
        }
        self.available.store(available, Ordering::Release);
        self.notifier.notify_all();
    }

    /// Drop every entry stamped at or before `through`.
    pub fn truncate_through(&self, through: LogicalTime) {
        let _guard = self.write_lock.lock().unwrap();
        let entries = self.entries.load();
        let keep = entries.iter().position(|e| e.ts > through).unwrap_or(entries.len());
        let mut all = (**entries).clone();
        let retained = all.split_off(keep);
        self.entries.store(Arc::new(retained));
        let mut truncated = self.truncated_through.lock().unwrap();
        if through > *truncated {
            *truncated = through;
        }
    }

    fn check_available(&self) -> Result<(), OplogError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(OplogError::Unavailable(self.shard.clone()))
        }
    }
}

impl OplogSource for MemoryOplog {
    fn shard(&self) -> &str {
        &self.shard
    }

    fn read_after(&self, after: LogicalTime, limit: usize) -> Result<Vec<Arc<RawLogEntry>>, OplogError> {
        self.check_available()?;
        let truncated = *self.truncated_through.lock().unwrap();
        if after < truncated {
            return Err(OplogError::HistoryLost {
                shard: self.shard.clone(),
                requested: after,
                earliest: truncated,
            });
        }
        let entries = self.entries.load();
        let start = match entries.binary_search_by(|e| e.ts.cmp(&after)) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        Ok(entries.iter().skip(start).take(limit).cloned().collect())
    }

    fn visible_through(&self) -> Result<LogicalTime, OplogError> {
        self.check_available()?;
        Ok(self.clock.now())
    }

    fn earliest_retained(&self) -> LogicalTime {
        *self.truncated_through.lock().unwrap()
    }

    fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Namespace, OpKind};
    use bson::doc;

    fn oplog() -> MemoryOplog {
        MemoryOplog::new("shard0", Arc::new(ClusterClock::new()), Arc::new(Notifier::new()))
    }

    fn entry(secs: u32, id: i32) -> RawLogEntry {
        RawLogEntry::new(
            LogicalTime::new(secs, 1),
            Namespace::collection("app", "users"),
            OpKind::Insert,
            doc! { "_id": id },
        )
    }

    #[test]
    fn read_after_is_exclusive_and_limited() {
        let log = oplog();
        for i in 1..=5 {
            log.append(entry(i, i as i32)).unwrap();
        }
        let read = log.read_after(LogicalTime::new(2, 1), 2).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].ts, LogicalTime::new(3, 1));
        assert_eq!(read[1].ts, LogicalTime::new(4, 1));
        assert!(log.read_after(LogicalTime::new(5, 1), 10).unwrap().is_empty());
    }

    #[test]
    fn append_rejects_out_of_order() {
        let log = oplog();
        log.append(entry(5, 1)).unwrap();
        assert!(matches!(log.append(entry(5, 2)), Err(OplogError::OutOfOrder(_))));
        assert!(matches!(log.append(entry(4, 2)), Err(OplogError::OutOfOrder(_))));
    }

    #[test]
    fn truncation_loses_history() {
        let log = oplog();
        for i in 1..=4 {
            log.append(entry(i, i as i32)).unwrap();
        }
        log.truncate_through(LogicalTime::new(2, 1));
        assert_eq!(log.len(), 2);
        assert_eq!(log.earliest_retained(), LogicalTime::new(2, 1));
        assert!(matches!(
            log.read_after(LogicalTime::new(1, 1), 10),
            Err(OplogError::HistoryLost { .. })
        ));
        assert_eq!(log.read_after(LogicalTime::new(2, 1), 10).unwrap().len(), 2);
    }

    #[test]
    fn unavailable_shard_fails_reads() {
        let log = oplog();
        log.set_available(false);
        assert!(matches!(log.read_after(LogicalTime::ZERO, 1), Err(OplogError::Unavailable(_))));
        assert!(log.visible_through().is_err());
        log.set_available(true);
        assert!(log.read_after(LogicalTime::ZERO, 1).is_ok());
    }
}
