use std::fmt;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::time::LogicalTime;

const INTERNAL_DBS: &[&str] = &["admin", "config", "local"];

/// A database, or a collection within one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: Option<String>,
}

impl Namespace {
    pub fn collection(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: Some(coll.into()),
        }
    }

    pub fn database(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: None,
        }
    }

    /// Parse `"db.coll"` or `"db"`. Collection names may themselves contain
    /// dots, so only the first dot separates.
    pub fn parse(full: &str) -> Self {
        match full.split_once('.') {
            Some((db, coll)) => Self::collection(db, coll),
            None => Self::database(full),
        }
    }

    pub fn full_name(&self) -> String {
        match &self.coll {
            Some(coll) => format!("{}.{}", self.db, coll),
            None => self.db.clone(),
        }
    }

    pub fn is_internal(&self) -> bool {
        INTERNAL_DBS.contains(&self.db.as_str())
    }

    /// Render as the `ns` field of a change event.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("db", self.db.clone());
        if let Some(coll) = &self.coll {
            doc.insert("coll", coll.clone());
        }
        doc
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Ddl,
    CommitTxn,
    Noop,
}

impl OpKind {
    /// Single-letter code used in the rendered oplog document.
    pub fn code(self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Delete => "d",
            OpKind::Ddl | OpKind::CommitTxn => "c",
            OpKind::Noop => "n",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(OpKind::Insert),
            "u" => Some(OpKind::Update),
            "d" => Some(OpKind::Delete),
            "c" => Some(OpKind::Ddl),
            "n" => Some(OpKind::Noop),
            _ => None,
        }
    }
}

/// One committed write as recorded in a shard's oplog.
///
/// `description` is the operation payload (`o`); `recorded_key` is the
/// document key captured at write time (`o2`) for inserts and updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogEntry {
    pub ts: LogicalTime,
    pub term: i64,
    pub ns: Namespace,
    pub op: OpKind,
    pub description: Document,
    pub recorded_key: Option<Document>,
    pub session_id: Option<Document>,
    pub txn_number: Option<i64>,
    pub statement_ids: Vec<i32>,
}

impl RawLogEntry {
    pub fn new(ts: LogicalTime, ns: Namespace, op: OpKind, description: Document) -> Self {
        Self {
            ts,
            term: 1,
            ns,
            op,
            description,
            recorded_key: None,
            session_id: None,
            txn_number: None,
            statement_ids: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: Document) -> Self {
        self.recorded_key = Some(key);
        self
    }

    pub fn with_txn(mut self, lsid: Document, txn_number: i64, statement_ids: Vec<i32>) -> Self {
        self.session_id = Some(lsid);
        self.txn_number = Some(txn_number);
        self.statement_ids = statement_ids;
        self
    }

    /// Render as the document shape pushed-down filters are evaluated
    /// against: `{ts, t, op, ns, o, o2?, lsid?, txnNumber?, stmtIds?}`.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("ts", self.ts.to_bson());
        doc.insert("t", self.term);
        doc.insert("op", self.op.code());
        doc.insert("ns", self.ns.full_name());
        doc.insert("o", self.description.clone());
        if let Some(key) = &self.recorded_key {
            doc.insert("o2", key.clone());
        }
        if let Some(lsid) = &self.session_id {
            doc.insert("lsid", lsid.clone());
        }
        if let Some(txn) = self.txn_number {
            doc.insert("txnNumber", txn);
        }
        if !self.statement_ids.is_empty() {
            let ids: Vec<Bson> = self.statement_ids.iter().map(|i| Bson::Int32(*i)).collect();
            doc.insert("stmtIds", ids);
        }
        doc
    }
}
