mod config;
mod error;
mod event;
mod manager;
mod merge;
mod normalize;
mod rewrite;
mod shard_cursor;
mod stream;
mod token;
mod wake;
mod watch;

pub use config::{RetryConfig, StreamConfig};
pub use error::{Disposition, ErrorCode, StreamError, classify};
pub use event::{ChangeEvent, OperationType, Provenance, TxnContext, UpdateDescription};
pub use manager::{CursorId, CursorManager};
pub use merge::{MergeCoordinator, MergeItem};
pub use normalize::Normalizer;
pub use rewrite::{CompiledFilter, compile};
pub use shard_cursor::{CursorState, PullResult, ShardCursor, StartPoint};
pub use stream::{Batch, ChangeStream, StreamItem, StreamStatus};
pub use token::{ResumeToken, TOKEN_VERSION, compare_encoded};
pub use wake::{Wake, WakeScheduler};
pub use watch::{StartPosition, StreamOptions, Target, WatchScope};
