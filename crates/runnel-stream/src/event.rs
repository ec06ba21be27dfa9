use bson::{Bson, Document, doc};
use runnel_oplog::{LogicalTime, Namespace};
use serde::{Deserialize, Serialize};

use crate::token::ResumeToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Create,
    Invalidate,
    ShardCollection,
    ShardAdded,
    ShardRemoved,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Create => "create",
            OperationType::Invalidate => "invalidate",
            OperationType::ShardCollection => "shardCollection",
            OperationType::ShardAdded => "shardAdded",
            OperationType::ShardRemoved => "shardRemoved",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            "drop" => OperationType::Drop,
            "rename" => OperationType::Rename,
            "dropDatabase" => OperationType::DropDatabase,
            "create" => OperationType::Create,
            "invalidate" => OperationType::Invalidate,
            "shardCollection" => OperationType::ShardCollection,
            "shardAdded" => OperationType::ShardAdded,
            "shardRemoved" => OperationType::ShardRemoved,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnContext {
    pub lsid: Document,
    pub txn_number: i64,
    /// Position of the statement within its transaction.
    pub event_index: u64,
}

/// Proof that an event was synthesized by the merge coordinator. Only this
/// crate can construct one, so no document shape can forge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMarker(());

impl ControlMarker {
    pub(crate) fn new() -> Self {
        ControlMarker(())
    }
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    /// Normalized from an oplog entry of the given shard.
    Oplog { shard: String },
    /// A topology control event injected by the coordinator.
    Control(ControlMarker),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    pub ns: Option<Namespace>,
    pub document_key: Option<Document>,
    pub full_document: Option<Document>,
    pub update_description: Option<UpdateDescription>,
    /// Rename target.
    pub to: Option<Namespace>,
    pub cluster_time: LogicalTime,
    pub token: ResumeToken,
    pub txn: Option<TxnContext>,
    pub provenance: Provenance,
    /// Operation-specific fields of control events (`shardKey`, `shard`).
    pub extra: Option<Document>,
}

impl ChangeEvent {
    pub(crate) fn new(operation_type: OperationType, cluster_time: LogicalTime, token: ResumeToken, provenance: Provenance) -> Self {
        Self {
            operation_type,
            ns: None,
            document_key: None,
            full_document: None,
            update_description: None,
            to: None,
            cluster_time,
            token,
            txn: None,
            provenance,
            extra: None,
        }
    }

    pub fn is_invalidate(&self) -> bool {
        self.operation_type == OperationType::Invalidate
    }

    pub fn is_control(&self) -> bool {
        matches!(self.provenance, Provenance::Control(_))
    }

    /// The client-visible document. Filters are evaluated against this shape.
    pub fn to_document(&self) -> Document {
        let mut out = doc! {
            "_id": self.token.to_document(),
            "operationType": self.operation_type.as_str(),
            "clusterTime": self.cluster_time.to_bson(),
        };
        if let Some(ns) = &self.ns {
            out.insert("ns", ns.to_document());
        }
        if let Some(key) = &self.document_key {
            out.insert("documentKey", key.clone());
        }
        if let Some(full) = &self.full_document {
            out.insert("fullDocument", full.clone());
        }
        if let Some(desc) = &self.update_description {
            let removed: Vec<Bson> = desc.removed_fields.iter().map(|f| Bson::String(f.clone())).collect();
            out.insert(
                "updateDescription",
                doc! { "updatedFields": desc.updated_fields.clone(), "removedFields": removed },
            );
        }
        if let Some(to) = &self.to {
            out.insert("to", to.to_document());
        }
        if let Some(txn) = &self.txn {
            out.insert("lsid", txn.lsid.clone());
            out.insert("txnNumber", txn.txn_number);
            out.insert("txnOpIndex", txn.event_index as i64);
        }
        if let Some(extra) = &self.extra {
            for (k, v) in extra {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}
