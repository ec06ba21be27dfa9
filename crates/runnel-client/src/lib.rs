mod client;
mod pool;

pub use client::{Client, ClientError, EventBatch, StreamHandle};
pub use pool::{ClientPool, PooledClient};
pub use runnel_server::protocol::TxnWrite;
