use std::sync::Arc;

use crate::entry::RawLogEntry;
use crate::error::OplogError;
use crate::notify::Notifier;
use crate::time::LogicalTime;

/// Read side of one shard's oplog.
pub trait OplogSource: Send + Sync {
    fn shard(&self) -> &str;

    /// Up to `limit` entries with `ts > after`, in log order.
    ///
    /// Fails with [`OplogError::HistoryLost`] if entries after `after` have
    /// already been truncated away.
    fn read_after(&self, after: LogicalTime, limit: usize) -> Result<Vec<Arc<RawLogEntry>>, OplogError>;

    /// Every entry stamped at or before the returned time is readable. Call
    /// this before [`read_after`](OplogSource::read_after) to get a bound that
    /// is safe to report as progress when the read comes back empty.
    fn visible_through(&self) -> Result<LogicalTime, OplogError>;

    /// Positions strictly before this time can no longer be resumed from.
    fn earliest_retained(&self) -> LogicalTime;

    /// Signalled whenever new entries may be visible.
    fn notifier(&self) -> Arc<Notifier>;
}
