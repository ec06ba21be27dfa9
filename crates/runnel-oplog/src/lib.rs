mod catalog;
mod cluster;
mod entry;
mod error;
mod memory;
mod notify;
mod source;
mod time;
mod topology;

pub use catalog::Catalog;
pub use cluster::{MemoryCluster, TxnOp};
pub use entry::{Namespace, OpKind, RawLogEntry};
pub use error::OplogError;
pub use memory::MemoryOplog;
pub use notify::{CancelReason, CancelToken, ClusterClock, Notifier, WaitOutcome};
pub use source::OplogSource;
pub use time::LogicalTime;
pub use topology::{MemoryTopology, Topology, TopologyChange, TopologyChangeKind};
