use std::fmt;

use crate::time::LogicalTime;

#[derive(Debug, Clone, PartialEq)]
pub enum OplogError {
    /// The shard cannot be read right now (stepdown, network). Retryable.
    Unavailable(String),
    /// The requested position is older than the retained history.
    HistoryLost {
        shard: String,
        requested: LogicalTime,
        earliest: LogicalTime,
    },
    OutOfOrder(String),
    UnknownShard(String),
    UnknownNamespace(String),
    Storage(String),
}

impl fmt::Display for OplogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OplogError::Unavailable(shard) => write!(f, "shard unavailable: {shard}"),
            OplogError::HistoryLost {
                shard,
                requested,
                earliest,
            } => write!(
                f,
                "history lost on {shard}: requested {requested}, earliest retained {earliest}"
            ),
            OplogError::OutOfOrder(msg) => write!(f, "out of order append: {msg}"),
            OplogError::UnknownShard(shard) => write!(f, "unknown shard: {shard}"),
            OplogError::UnknownNamespace(ns) => write!(f, "unknown namespace: {ns}"),
            OplogError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for OplogError {}
