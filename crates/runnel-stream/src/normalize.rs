use std::sync::Arc;

use bson::{Bson, Document};
use runnel_oplog::{Catalog, Namespace, OpKind, RawLogEntry};
use tracing::error;

use crate::error::StreamError;
use crate::event::{ChangeEvent, OperationType, Provenance, TxnContext, UpdateDescription};
use crate::token::ResumeToken;
use crate::watch::WatchScope;

/// Turns raw oplog entries into change events.
///
/// Stateless apart from the catalog, which answers shard-key and
/// collection-lifetime questions as of each entry's timestamp.
pub struct Normalizer {
    catalog: Arc<Catalog>,
    scope: WatchScope,
    show_expanded_events: bool,
}

impl Normalizer {
    pub fn new(catalog: Arc<Catalog>, scope: WatchScope, show_expanded_events: bool) -> Self {
        Self {
            catalog,
            scope,
            show_expanded_events,
        }
    }

    /// All events an entry produces, in delivery order.
    pub fn normalize(&self, entry: &RawLogEntry, shard: &str) -> Result<Vec<ChangeEvent>, StreamError> {
        let mut events = Vec::new();
        for statement in self.unwind(entry, shard)? {
            events.extend(self.normalize_statement(&statement, shard)?);
        }
        Ok(events)
    }

    /// Split a transaction commit into one entry per statement. Each
    /// statement inherits the commit's timestamp and session and carries its
    /// own statement id. Any other entry is returned unchanged.
    pub fn unwind(&self, entry: &RawLogEntry, shard: &str) -> Result<Vec<RawLogEntry>, StreamError> {
        if entry.op != OpKind::CommitTxn {
            return Ok(vec![entry.clone()]);
        }
        let statements = match entry.description.get("applyOps") {
            Some(Bson::Array(ops)) => ops,
            _ => return Err(corrupt(entry, shard, "commit without applyOps array")),
        };
        let (Some(lsid), Some(txn_number)) = (&entry.session_id, entry.txn_number) else {
            return Err(corrupt(entry, shard, "commit without session"));
        };

        let mut out = Vec::with_capacity(statements.len());
        for (i, statement) in statements.iter().enumerate() {
            let Bson::Document(statement) = statement else {
                return Err(corrupt(entry, shard, "applyOps element is not a document"));
            };
            let op = statement
                .get_str("op")
                .ok()
                .and_then(OpKind::from_code)
                .filter(|op| matches!(op, OpKind::Insert | OpKind::Update | OpKind::Delete))
                .ok_or_else(|| corrupt(entry, shard, "applyOps element has no CRUD op"))?;
            let ns = statement
                .get_str("ns")
                .map_err(|_| corrupt(entry, shard, "applyOps element has no ns"))?;
            let description = statement
                .get_document("o")
                .map_err(|_| corrupt(entry, shard, "applyOps element has no o"))?
                .clone();
            let stmt_id = entry.statement_ids.get(i).copied().unwrap_or(i as i32);

            let mut unwound = RawLogEntry::new(entry.ts, Namespace::parse(ns), op, description)
                .with_txn(lsid.clone(), txn_number, vec![stmt_id]);
            unwound.term = entry.term;
            if let Ok(key) = statement.get_document("o2") {
                unwound.recorded_key = Some(key.clone());
            }
            out.push(unwound);
        }
        Ok(out)
    }

    /// Events for a single non-commit entry.
    pub fn normalize_statement(&self, entry: &RawLogEntry, shard: &str) -> Result<Vec<ChangeEvent>, StreamError> {
        let mut out = EventList::new(entry, shard);
        match entry.op {
            OpKind::Noop => {}
            OpKind::CommitTxn => return Err(corrupt(entry, shard, "nested transaction commit")),
            OpKind::Insert => {
                let ns = collection_ns(entry, shard)?;
                let key = match &entry.recorded_key {
                    Some(key) => key.clone(),
                    None => self
                        .catalog
                        .document_key_at(&ns, entry.ts, &entry.description)
                        .ok_or_else(|| corrupt(entry, shard, "inserted document has no _id"))?,
                };
                let event = out.push(OperationType::Insert, Some(ns));
                event.document_key = Some(key);
                event.full_document = Some(entry.description.clone());
            }
            OpKind::Update => {
                let ns = collection_ns(entry, shard)?;
                let key = entry
                    .recorded_key
                    .clone()
                    .ok_or_else(|| corrupt(entry, shard, "update without o2"))?;
                if entry.description.contains_key("_id") {
                    let event = out.push(OperationType::Replace, Some(ns));
                    event.document_key = Some(key);
                    event.full_document = Some(entry.description.clone());
                } else {
                    let description = update_description(&entry.description)
                        .map_err(|reason| corrupt(entry, shard, &reason))?;
                    let event = out.push(OperationType::Update, Some(ns));
                    event.document_key = Some(key);
                    event.update_description = Some(description);
                }
            }
            OpKind::Delete => {
                let ns = collection_ns(entry, shard)?;
                if !entry.description.contains_key("_id") {
                    return Err(corrupt(entry, shard, "delete key has no _id"));
                }
                let event = out.push(OperationType::Delete, Some(ns));
                event.document_key = Some(entry.description.clone());
            }
            OpKind::Ddl => self.normalize_ddl(entry, shard, &mut out)?,
        }
        Ok(out.events)
    }

    fn normalize_ddl(&self, entry: &RawLogEntry, shard: &str, out: &mut EventList<'_>) -> Result<(), StreamError> {
        let o = &entry.description;
        if o.contains_key("drop") {
            let ns = collection_ns(entry, shard)?;
            let invalidates = self.scope.watched_collection() == Some(&ns);
            out.push(OperationType::Drop, Some(ns));
            if invalidates {
                out.push_invalidate();
            }
        } else if o.contains_key("create") {
            let ns = collection_ns(entry, shard)?;
            if self.show_expanded_events {
                out.push(OperationType::Create, Some(ns));
            }
        } else if let Ok(from) = o.get_str("renameCollection") {
            let to = o
                .get_str("to")
                .map_err(|_| corrupt(entry, shard, "rename without target"))?;
            let from = Namespace::parse(from);
            let invalidates = self.scope.watched_collection() == Some(&from);
            let event = out.push(OperationType::Rename, Some(from));
            event.to = Some(Namespace::parse(to));
            if invalidates {
                out.push_invalidate();
            }
        } else if o.contains_key("dropDatabase") {
            let db = entry.ns.db.clone();
            for coll in self.catalog.collections_alive_before(&db, entry.ts) {
                out.push(OperationType::Drop, Some(Namespace::collection(db.clone(), coll)));
            }
            out.push(OperationType::DropDatabase, Some(Namespace::database(db.clone())));
            if self.scope.watched_collection().is_some_and(|ns| ns.db == db) {
                out.push_invalidate();
            }
        } else {
            return Err(corrupt(entry, shard, "unrecognized command"));
        }
        Ok(())
    }
}

/// Accumulates the events of one entry, assigning tie-breaks as it goes.
struct EventList<'a> {
    entry: &'a RawLogEntry,
    shard: &'a str,
    events: Vec<ChangeEvent>,
}

impl<'a> EventList<'a> {
    fn new(entry: &'a RawLogEntry, shard: &'a str) -> Self {
        Self {
            entry,
            shard,
            events: Vec::new(),
        }
    }

    /// Transaction statements order by statement id, which is unique across
    /// every shard taking part in the commit. Other entries number their
    /// events from zero.
    fn next_tie_break(&self) -> u64 {
        match (self.entry.txn_number, self.entry.statement_ids.first()) {
            (Some(_), Some(id)) => *id as u64 + self.events.len() as u64,
            _ => self.events.len() as u64,
        }
    }

    fn push(&mut self, op: OperationType, ns: Option<Namespace>) -> &mut ChangeEvent {
        let token = ResumeToken::event(self.entry.ts, self.next_tie_break(), self.shard);
        let mut event = ChangeEvent::new(
            op,
            self.entry.ts,
            token,
            Provenance::Oplog {
                shard: self.shard.to_string(),
            },
        );
        event.ns = ns;
        if let (Some(lsid), Some(txn_number), Some(id)) = (
            &self.entry.session_id,
            self.entry.txn_number,
            self.entry.statement_ids.first(),
        ) {
            event.txn = Some(TxnContext {
                lsid: lsid.clone(),
                txn_number,
                event_index: *id as u64,
            });
        }
        self.events.push(event);
        let last = self.events.len() - 1;
        &mut self.events[last]
    }

    fn push_invalidate(&mut self) {
        let event = self.push(OperationType::Invalidate, None);
        event.token.from_invalidate = true;
    }
}

fn collection_ns(entry: &RawLogEntry, shard: &str) -> Result<Namespace, StreamError> {
    if entry.ns.coll.is_none() {
        return Err(corrupt(entry, shard, "expected a collection namespace"));
    }
    Ok(entry.ns.clone())
}

/// Parse a `{$set: {...}, $unset: {...}}` delta.
fn update_description(delta: &Document) -> Result<UpdateDescription, String> {
    let mut description = UpdateDescription::default();
    for (op, fields) in delta {
        let Bson::Document(fields) = fields else {
            return Err(format!("{op} argument is not a document"));
        };
        match op.as_str() {
            "$set" => {
                for (k, v) in fields {
                    description.updated_fields.insert(k.clone(), v.clone());
                }
            }
            "$unset" => description.removed_fields.extend(fields.keys().cloned()),
            other => return Err(format!("unsupported update operator {other}")),
        }
    }
    Ok(description)
}

fn corrupt(entry: &RawLogEntry, shard: &str, reason: &str) -> StreamError {
    error!(shard, ts = %entry.ts, ns = %entry.ns, reason, "corrupt oplog entry");
    StreamError::Corrupt {
        shard: shard.to_string(),
        ts: entry.ts,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use runnel_oplog::LogicalTime;

    const SHARD: &str = "shard0";

    fn ts(inc: u32) -> LogicalTime {
        LogicalTime::new(100, inc)
    }

    fn users() -> Namespace {
        Namespace::collection("app", "users")
    }

    fn normalizer(scope: WatchScope) -> (Arc<Catalog>, Normalizer) {
        let catalog = Arc::new(Catalog::new());
        catalog.record_create(&users(), ts(1));
        (Arc::clone(&catalog), Normalizer::new(catalog, scope, false))
    }

    fn ops(events: &[ChangeEvent]) -> Vec<OperationType> {
        events.iter().map(|e| e.operation_type).collect()
    }

    #[test]
    fn insert_uses_recorded_key() {
        let (_, n) = normalizer(WatchScope::Cluster);
        let entry = RawLogEntry::new(ts(2), users(), OpKind::Insert, doc! { "_id": 1, "x": 5 })
            .with_key(doc! { "x": 5, "_id": 1 });
        let events = n.normalize(&entry, SHARD).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].document_key, Some(doc! { "x": 5, "_id": 1 }));
        assert_eq!(events[0].full_document, Some(doc! { "_id": 1, "x": 5 }));
        assert_eq!(events[0].token, ResumeToken::event(ts(2), 0, SHARD));
    }

    #[test]
    fn insert_without_key_derives_it_from_history() {
        let (catalog, n) = normalizer(WatchScope::Cluster);
        catalog.record_shard_key(&users(), doc! { "x": 1 }, ts(5));
        let before = RawLogEntry::new(ts(3), users(), OpKind::Insert, doc! { "_id": 0, "x": 0 });
        let after = RawLogEntry::new(ts(6), users(), OpKind::Insert, doc! { "_id": 1, "x": 1 });
        assert_eq!(n.normalize(&before, SHARD).unwrap()[0].document_key, Some(doc! { "_id": 0 }));
        assert_eq!(
            n.normalize(&after, SHARD).unwrap()[0].document_key,
            Some(doc! { "x": 1, "_id": 1 })
        );
    }

    #[test]
    fn update_and_replace_are_told_apart() {
        let (_, n) = normalizer(WatchScope::Cluster);
        let delta = RawLogEntry::new(ts(2), users(), OpKind::Update, doc! { "$set": { "a": 1 }, "$unset": { "b": true } })
            .with_key(doc! { "_id": 1 });
        let replace = RawLogEntry::new(ts(3), users(), OpKind::Update, doc! { "_id": 1, "a": 9 })
            .with_key(doc! { "_id": 1 });

        let update = &n.normalize(&delta, SHARD).unwrap()[0];
        assert_eq!(update.operation_type, OperationType::Update);
        let desc = update.update_description.as_ref().unwrap();
        assert_eq!(desc.updated_fields, doc! { "a": 1 });
        assert_eq!(desc.removed_fields, vec!["b".to_string()]);

        let replaced = &n.normalize(&replace, SHARD).unwrap()[0];
        assert_eq!(replaced.operation_type, OperationType::Replace);
        assert_eq!(replaced.full_document, Some(doc! { "_id": 1, "a": 9 }));
    }

    #[test]
    fn transaction_expands_in_statement_order() {
        let (_, n) = normalizer(WatchScope::Cluster);
        let commit = RawLogEntry::new(
            ts(4),
            Namespace::collection("admin", "$cmd"),
            OpKind::CommitTxn,
            doc! { "applyOps": [
                { "op": "i", "ns": "app.users", "o": { "_id": 1 }, "o2": { "_id": 1 } },
                { "op": "d", "ns": "app.users", "o": { "_id": 2 } },
            ] },
        )
        .with_txn(doc! { "id": "s1" }, 7, vec![3, 5]);

        let events = n.normalize(&commit, SHARD).unwrap();
        assert_eq!(ops(&events), vec![OperationType::Insert, OperationType::Delete]);
        assert_eq!(events[0].token.tie_break, 3);
        assert_eq!(events[1].token.tie_break, 5);
        let txn = events[1].txn.as_ref().unwrap();
        assert_eq!(txn.txn_number, 7);
        assert_eq!(txn.event_index, 5);
        assert_eq!(txn.lsid, doc! { "id": "s1" });
    }

    #[test]
    fn drop_invalidates_only_collection_scope() {
        let drop = RawLogEntry::new(ts(5), users(), OpKind::Ddl, doc! { "drop": "users" });

        let (_, coll) = normalizer(WatchScope::Collection(users()));
        let events = coll.normalize(&drop, SHARD).unwrap();
        assert_eq!(ops(&events), vec![OperationType::Drop, OperationType::Invalidate]);
        assert!(events[1].token.from_invalidate);
        assert!(events[0].token < events[1].token);

        let (_, db) = normalizer(WatchScope::Database("app".into()));
        assert_eq!(ops(&db.normalize(&drop, SHARD).unwrap()), vec![OperationType::Drop]);
    }

    #[test]
    fn drop_database_lists_prior_collections() {
        let (catalog, n) = normalizer(WatchScope::Collection(users()));
        catalog.record_create(&Namespace::collection("app", "orders"), ts(2));
        let entry = RawLogEntry::new(ts(9), Namespace::database("app"), OpKind::Ddl, doc! { "dropDatabase": 1 });
        catalog.record_drop(&users(), ts(9));
        catalog.record_drop(&Namespace::collection("app", "orders"), ts(9));

        let events = n.normalize(&entry, SHARD).unwrap();
        assert_eq!(
            ops(&events),
            vec![
                OperationType::Drop,
                OperationType::Drop,
                OperationType::DropDatabase,
                OperationType::Invalidate
            ]
        );
        assert_eq!(events[0].ns, Some(Namespace::collection("app", "orders")));
        assert_eq!(events[1].ns, Some(users()));
        let ties: Vec<u64> = events.iter().map(|e| e.token.tie_break).collect();
        assert_eq!(ties, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rename_carries_target() {
        let (_, n) = normalizer(WatchScope::Collection(users()));
        let entry = RawLogEntry::new(
            ts(6),
            users(),
            OpKind::Ddl,
            doc! { "renameCollection": "app.users", "to": "app.people" },
        );
        let events = n.normalize(&entry, SHARD).unwrap();
        assert_eq!(ops(&events), vec![OperationType::Rename, OperationType::Invalidate]);
        assert_eq!(events[0].to, Some(Namespace::collection("app", "people")));
    }

    #[test]
    fn create_needs_expanded_events() {
        let entry = RawLogEntry::new(ts(2), users(), OpKind::Ddl, doc! { "create": "users" });
        let (catalog, plain) = normalizer(WatchScope::Cluster);
        assert!(plain.normalize(&entry, SHARD).unwrap().is_empty());
        let expanded = Normalizer::new(catalog, WatchScope::Cluster, true);
        assert_eq!(ops(&expanded.normalize(&entry, SHARD).unwrap()), vec![OperationType::Create]);
    }

    #[test]
    fn noop_produces_nothing() {
        let (_, n) = normalizer(WatchScope::Cluster);
        let entry = RawLogEntry::new(ts(2), Namespace::database(""), OpKind::Noop, doc! { "msg": "hi" });
        assert!(n.normalize(&entry, SHARD).unwrap().is_empty());
    }

    #[test]
    fn malformed_entries_are_errors() {
        let (_, n) = normalizer(WatchScope::Cluster);
        let cases = [
            RawLogEntry::new(ts(2), users(), OpKind::Update, doc! { "$set": { "a": 1 } }),
            RawLogEntry::new(ts(3), users(), OpKind::Update, doc! { "$inc": { "a": 1 } }).with_key(doc! { "_id": 1 }),
            RawLogEntry::new(ts(4), users(), OpKind::Delete, doc! { "x": 1 }),
            RawLogEntry::new(ts(5), users(), OpKind::Ddl, doc! { "collMod": "users" }),
            RawLogEntry::new(ts(6), users(), OpKind::Insert, doc! { "x": 1 }),
            RawLogEntry::new(ts(7), Namespace::collection("admin", "$cmd"), OpKind::CommitTxn, doc! { "applyOps": 1 })
                .with_txn(doc! { "id": "s" }, 1, vec![]),
        ];
        for entry in cases {
            let err = n.normalize(&entry, SHARD).unwrap_err();
            assert!(matches!(err, StreamError::Corrupt { ts, .. } if ts == entry.ts), "{entry:?}");
        }
    }
}
