use std::sync::{Arc, Mutex};
use std::time::Duration;

use runnel_oplog::{LogicalTime, MemoryCluster, OplogError, TxnOp};
use runnel_stream::{ChangeEvent, CursorId, CursorManager, StreamError};
use tracing::debug;

use crate::protocol::{Request, Response, TxnWrite};

/// Serves the requests of one connection. Cursors live in the shared
/// manager, so a stream opened on one connection can be read, interrupted
/// or killed from another.
pub struct Session {
    cluster: Arc<MemoryCluster>,
    manager: Arc<CursorManager>,
    reading: Mutex<Option<CursorId>>,
}

impl Session {
    pub fn new(cluster: Arc<MemoryCluster>, manager: Arc<CursorManager>) -> Self {
        Self {
            cluster,
            manager,
            reading: Mutex::new(None),
        }
    }

    /// The peer went away. Interrupt the `get_more` it left waiting so the
    /// cursor is free for whoever resumes it.
    pub fn disconnect(&self) {
        if let Some(cursor_id) = *self.reading.lock().unwrap() {
            debug!(cursor_id, "peer disconnected mid read");
            let _ = self.manager.interrupt_cursor(cursor_id);
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Watch { options } => self.stream(|m| {
                let cursor_id = m.open_stream(options)?;
                let status = m.status(cursor_id)?;
                Ok(Response::Cursor {
                    cursor_id,
                    resume_token: status.resume_token,
                })
            }),
            Request::GetMore {
                cursor_id,
                batch_size,
                max_wait_ms,
            } => self.stream(|m| {
                *self.reading.lock().unwrap() = Some(cursor_id);
                let batch = m.get_more(
                    cursor_id,
                    batch_size.map(|n| n as usize),
                    max_wait_ms.map(Duration::from_millis),
                );
                *self.reading.lock().unwrap() = None;
                let batch = batch?;
                Ok(Response::Batch {
                    events: batch.events.iter().map(ChangeEvent::to_document).collect(),
                    post_batch_resume_token: batch.post_batch_resume_token,
                    invalidated: batch.invalidated,
                })
            }),
            Request::CloseStream { cursor_id } => self.stream(|m| {
                m.close_stream(cursor_id)?;
                Ok(Response::Ok)
            }),
            Request::KillCursor { cursor_id } => self.stream(|m| {
                m.kill_cursor(cursor_id)?;
                Ok(Response::Ok)
            }),
            Request::InterruptCursor { cursor_id } => self.stream(|m| {
                m.interrupt_cursor(cursor_id)?;
                Ok(Response::Ok)
            }),
            Request::CursorStatus { cursor_id } => self.stream(|m| Ok(Response::Status(m.status(cursor_id)?))),
            Request::Explain { options } => self.stream(|m| Ok(Response::Explain(m.explain(&options)?))),

            Request::Insert { ns, doc } => self.write(|c| c.insert(&ns, doc)),
            Request::Update { ns, key, update } => self.write(|c| c.update(&ns, key, update)),
            Request::Replace { ns, doc } => self.write(|c| c.replace(&ns, doc)),
            Request::Delete { ns, key } => self.write(|c| c.delete(&ns, key)),
            Request::Transaction {
                lsid,
                txn_number,
                writes,
            } => self.write(|c| c.transaction(lsid, txn_number, writes.into_iter().map(txn_op).collect())),

            Request::CreateCollection { ns } => self.write(|c| c.create(&ns)),
            Request::DropCollection { ns } => self.write(|c| c.drop_collection(&ns)),
            Request::RenameCollection { from, to } => self.write(|c| c.rename(&from, &to)),
            Request::DropDatabase { db } => self.write(|c| c.drop_database(&db)),
            Request::ShardCollection { ns, key } => self.write(|c| c.shard_collection(&ns, key)),
            Request::AddShard { shard } => self.write(|c| c.add_shard(&shard)),
            Request::RemoveShard { shard } => self.write(|c| c.remove_shard(&shard)),
            Request::ClusterTime => Response::Written(self.cluster.cluster_time()),
        }
    }

    fn stream<F>(&self, f: F) -> Response
    where
        F: FnOnce(&CursorManager) -> Result<Response, StreamError>,
    {
        match f(&self.manager) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, code = %e.code(), "stream request failed");
                Response::Error {
                    code: Some(e.code()),
                    message: e.to_string(),
                }
            }
        }
    }

    fn write<F>(&self, f: F) -> Response
    where
        F: FnOnce(&MemoryCluster) -> Result<LogicalTime, OplogError>,
    {
        match f(&self.cluster) {
            Ok(ts) => Response::Written(ts),
            Err(e) => Response::Error {
                code: None,
                message: e.to_string(),
            },
        }
    }
}

fn txn_op(write: TxnWrite) -> TxnOp {
    match write {
        TxnWrite::Insert { ns, doc } => TxnOp::Insert { ns, doc },
        TxnWrite::Update { ns, key, update } => TxnOp::Update { ns, key, update },
        TxnWrite::Replace { ns, doc } => TxnOp::Replace { ns, doc },
        TxnWrite::Delete { ns, key } => TxnOp::Delete { ns, key },
    }
}
