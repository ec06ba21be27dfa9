use std::fmt;

use runnel_oplog::{LogicalTime, OplogError};
use runnel_query::FilterParseError;
use serde::{Deserialize, Serialize};

/// Error classes a client can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidResumeToken,
    ChangeStreamInvalidated,
    ChangeStreamTopologyChange,
    CursorNotFound,
    CursorInUse,
    Interrupted,
    InvalidOptions,
    CorruptOplogEntry,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidResumeToken => "InvalidResumeToken",
            ErrorCode::ChangeStreamInvalidated => "ChangeStreamInvalidated",
            ErrorCode::ChangeStreamTopologyChange => "ChangeStreamTopologyChange",
            ErrorCode::CursorNotFound => "CursorNotFound",
            ErrorCode::CursorInUse => "CursorInUse",
            ErrorCode::Interrupted => "Interrupted",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::CorruptOplogEntry => "CorruptOplogEntry",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("oplog error: {0}")]
    Oplog(#[from] OplogError),

    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("change stream invalidated: {0}")]
    Invalidated(String),

    #[error("topology change: {0}")]
    TopologyChange(String),

    #[error("cursor {0} not found")]
    CursorNotFound(u64),

    #[error("cursor {0} is in use")]
    CursorInUse(u64),

    #[error("operation interrupted: {0}")]
    Interrupted(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid filter: {0}")]
    Filter(#[from] FilterParseError),

    #[error("corrupt oplog entry on {shard} at {ts}: {reason}")]
    Corrupt {
        shard: String,
        ts: LogicalTime,
        reason: String,
    },
}

impl StreamError {
    /// The client-visible class of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::Oplog(e) => match e {
                OplogError::HistoryLost { .. } => ErrorCode::InvalidResumeToken,
                OplogError::Unavailable(_) | OplogError::UnknownShard(_) => {
                    ErrorCode::ChangeStreamTopologyChange
                }
                OplogError::OutOfOrder(_)
                | OplogError::UnknownNamespace(_)
                | OplogError::Storage(_) => ErrorCode::CorruptOplogEntry,
            },
            StreamError::InvalidResumeToken(_) => ErrorCode::InvalidResumeToken,
            StreamError::Invalidated(_) => ErrorCode::ChangeStreamInvalidated,
            StreamError::TopologyChange(_) => ErrorCode::ChangeStreamTopologyChange,
            StreamError::CursorNotFound(_) => ErrorCode::CursorNotFound,
            StreamError::CursorInUse(_) => ErrorCode::CursorInUse,
            StreamError::Interrupted(_) => ErrorCode::Interrupted,
            StreamError::InvalidOptions(_) | StreamError::Filter(_) => ErrorCode::InvalidOptions,
            StreamError::Corrupt { .. } => ErrorCode::CorruptOplogEntry,
        }
    }

    /// Whether the cursor survives this error.
    pub fn keeps_cursor(&self) -> bool {
        matches!(
            self,
            StreamError::CursorInUse(_) | StreamError::Interrupted(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Fail,
}

/// Retry policy: only transport failures to a shard are retried.
pub fn classify(err: &StreamError) -> Disposition {
    match err {
        StreamError::Oplog(OplogError::Unavailable(_)) => Disposition::Retry,
        _ => Disposition::Fail,
    }
}
