use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use runnel_oplog::LogicalTime;
use runnel_server::protocol::{FrameError, Request, Response, TxnWrite, read_frame, write_frame};
use runnel_stream::{ErrorCode, ResumeToken, StreamOptions, StreamStatus};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no pooled connection free after {0:?}")]
    PoolExhausted(std::time::Duration),

    #[error("server error: {message}")]
    Server {
        code: Option<ErrorCode>,
        message: String,
    },
}

impl ClientError {
    /// The change stream error class, if the server reported one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server { code, .. } => *code,
            _ => None,
        }
    }

    fn unexpected(response: Response) -> Self {
        match response {
            Response::Error { code, message } => ClientError::Server { code, message },
            other => ClientError::Server {
                code: None,
                message: format!("unexpected response: {other:?}"),
            },
        }
    }
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => ClientError::Io(e),
            other => ClientError::Serialization(other.to_string()),
        }
    }
}

/// A freshly opened change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandle {
    pub cursor_id: u64,
    /// Resuming from here sees everything the stream would have.
    pub resume_token: ResumeToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub events: Vec<bson::Document>,
    pub post_batch_resume_token: ResumeToken,
    pub invalidated: bool,
}

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Self { reader, writer })
    }

    fn request(&mut self, request: Request) -> Result<Response, ClientError> {
        write_frame(&mut self.writer, &request)?;
        self.writer.flush()?;
        read_frame(&mut self.reader)?.ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))
        })
    }

    fn expect_ok(&mut self, request: Request) -> Result<(), ClientError> {
        match self.request(request)? {
            Response::Ok => Ok(()),
            other => Err(ClientError::unexpected(other)),
        }
    }

    fn expect_written(&mut self, request: Request) -> Result<LogicalTime, ClientError> {
        match self.request(request)? {
            Response::Written(ts) => Ok(ts),
            other => Err(ClientError::unexpected(other)),
        }
    }

    // ── Change streams ──────────────────────────────────────────

    pub fn watch(&mut self, options: StreamOptions) -> Result<StreamHandle, ClientError> {
        match self.request(Request::Watch { options })? {
            Response::Cursor {
                cursor_id,
                resume_token,
            } => Ok(StreamHandle {
                cursor_id,
                resume_token,
            }),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub fn get_more(
        &mut self,
        cursor_id: u64,
        batch_size: Option<u32>,
        max_wait: Option<Duration>,
    ) -> Result<EventBatch, ClientError> {
        match self.request(Request::GetMore {
            cursor_id,
            batch_size,
            max_wait_ms: max_wait.map(|d| d.as_millis() as u64),
        })? {
            Response::Batch {
                events,
                post_batch_resume_token,
                invalidated,
            } => Ok(EventBatch {
                events,
                post_batch_resume_token,
                invalidated,
            }),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub fn close_stream(&mut self, cursor_id: u64) -> Result<(), ClientError> {
        self.expect_ok(Request::CloseStream { cursor_id })
    }

    pub fn kill_cursor(&mut self, cursor_id: u64) -> Result<(), ClientError> {
        self.expect_ok(Request::KillCursor { cursor_id })
    }

    pub fn interrupt_cursor(&mut self, cursor_id: u64) -> Result<(), ClientError> {
        self.expect_ok(Request::InterruptCursor { cursor_id })
    }

    pub fn cursor_status(&mut self, cursor_id: u64) -> Result<StreamStatus, ClientError> {
        match self.request(Request::CursorStatus { cursor_id })? {
            Response::Status(status) => Ok(status),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub fn explain(&mut self, options: StreamOptions) -> Result<bson::Document, ClientError> {
        match self.request(Request::Explain { options })? {
            Response::Explain(plan) => Ok(plan),
            other => Err(ClientError::unexpected(other)),
        }
    }

    // ── Writes ──────────────────────────────────────────────────

    pub fn insert(&mut self, ns: &str, doc: bson::Document) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::Insert { ns: ns.to_string(), doc })
    }

    pub fn update(&mut self, ns: &str, key: bson::Document, update: bson::Document) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::Update {
            ns: ns.to_string(),
            key,
            update,
        })
    }

    pub fn replace(&mut self, ns: &str, doc: bson::Document) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::Replace { ns: ns.to_string(), doc })
    }

    pub fn delete(&mut self, ns: &str, key: bson::Document) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::Delete { ns: ns.to_string(), key })
    }

    pub fn transaction(
        &mut self,
        lsid: bson::Document,
        txn_number: i64,
        writes: Vec<TxnWrite>,
    ) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::Transaction {
            lsid,
            txn_number,
            writes,
        })
    }

    // ── DDL and topology ────────────────────────────────────────

    pub fn create_collection(&mut self, ns: &str) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::CreateCollection { ns: ns.to_string() })
    }

    pub fn drop_collection(&mut self, ns: &str) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::DropCollection { ns: ns.to_string() })
    }

    pub fn rename_collection(&mut self, from: &str, to: &str) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::RenameCollection {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn drop_database(&mut self, db: &str) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::DropDatabase { db: db.to_string() })
    }

    pub fn shard_collection(&mut self, ns: &str, key: bson::Document) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::ShardCollection { ns: ns.to_string(), key })
    }

    pub fn add_shard(&mut self, shard: &str) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::AddShard { shard: shard.to_string() })
    }

    pub fn remove_shard(&mut self, shard: &str) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::RemoveShard { shard: shard.to_string() })
    }

    pub fn cluster_time(&mut self) -> Result<LogicalTime, ClientError> {
        self.expect_written(Request::ClusterTime)
    }
}
