use std::fmt;
use std::io::{self, Read, Write};

use runnel_oplog::LogicalTime;
use runnel_stream::{ErrorCode, ResumeToken, StreamOptions, StreamStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Frames larger than this are rejected before the body is allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One statement of a transaction sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TxnWrite {
    Insert { ns: String, doc: bson::Document },
    Update { ns: String, key: bson::Document, update: bson::Document },
    Replace { ns: String, doc: bson::Document },
    Delete { ns: String, key: bson::Document },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    // ── Change streams ──────────────────────────────────────────
    Watch {
        options: StreamOptions,
    },
    GetMore {
        cursor_id: u64,
        batch_size: Option<u32>,
        max_wait_ms: Option<u64>,
    },
    CloseStream {
        cursor_id: u64,
    },
    KillCursor {
        cursor_id: u64,
    },
    InterruptCursor {
        cursor_id: u64,
    },
    CursorStatus {
        cursor_id: u64,
    },
    Explain {
        options: StreamOptions,
    },

    // ── Writes ──────────────────────────────────────────────────
    Insert {
        ns: String,
        doc: bson::Document,
    },
    Update {
        ns: String,
        key: bson::Document,
        update: bson::Document,
    },
    Replace {
        ns: String,
        doc: bson::Document,
    },
    Delete {
        ns: String,
        key: bson::Document,
    },
    Transaction {
        lsid: bson::Document,
        txn_number: i64,
        writes: Vec<TxnWrite>,
    },

    // ── DDL and topology ────────────────────────────────────────
    CreateCollection {
        ns: String,
    },
    DropCollection {
        ns: String,
    },
    RenameCollection {
        from: String,
        to: String,
    },
    DropDatabase {
        db: String,
    },
    ShardCollection {
        ns: String,
        key: bson::Document,
    },
    AddShard {
        shard: String,
    },
    RemoveShard {
        shard: String,
    },
    ClusterTime,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Written(LogicalTime),
    Cursor {
        cursor_id: u64,
        resume_token: ResumeToken,
    },
    Batch {
        events: Vec<bson::Document>,
        post_batch_resume_token: ResumeToken,
        invalidated: bool,
    },
    Status(StreamStatus),
    Explain(bson::Document),
    /// `code` is set for change stream errors and absent for write errors.
    Error {
        code: Option<ErrorCode>,
        message: String,
    },
}

// ── Framing ─────────────────────────────────────────────────────
//
// Every message is a u32 big-endian length followed by a MessagePack body.

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Encode(rmp_serde::encode::Error),
    Decode(rmp_serde::decode::Error),
    TooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "io error: {e}"),
            FrameError::Encode(e) => write!(f, "encode error: {e}"),
            FrameError::Decode(e) => write!(f, "decode error: {e}"),
            FrameError::TooLarge(len) => write!(f, "frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl From<rmp_serde::encode::Error> for FrameError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FrameError::Encode(e)
    }
}

impl From<rmp_serde::decode::Error> for FrameError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FrameError::Decode(e)
    }
}

/// Write one frame. The caller flushes.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FrameError> {
    let body = rmp_serde::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    Ok(())
}

/// Read one frame. `None` means the peer closed the connection between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, FrameError> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(rmp_serde::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_follow_each_other() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::ClusterTime).unwrap();
        write_frame(&mut buf, &Request::CloseStream { cursor_id: 7 }).unwrap();

        let mut reader = Cursor::new(buf);
        assert!(matches!(read_frame(&mut reader).unwrap(), Some(Request::ClusterTime)));
        assert!(matches!(
            read_frame(&mut reader).unwrap(),
            Some(Request::CloseStream { cursor_id: 7 })
        ));
        assert!(read_frame::<_, Request>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut reader = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        let err = read_frame::<_, Request>(&mut reader).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::DropDatabase { db: "app".into() }).unwrap();
        buf.truncate(buf.len() - 1);
        let err = read_frame::<_, Request>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
