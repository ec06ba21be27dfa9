use bson::{Bson, Document, doc};
use regex::Regex;
use runnel_oplog::{OpKind, RawLogEntry};
use runnel_query::{Collation, Expression, matches, matches_with};
use tracing::debug;

use crate::event::{ChangeEvent, OperationType};
use crate::watch::WatchScope;

/// A user filter split into a predicate over raw oplog entries and one over
/// change events.
///
/// `oplog` may admit entries whose events `residual` later rejects, but never
/// rejects an entry that yields a matching event.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    oplog: Expression,
    residual: Expression,
    collation: Collation,
    pushdown: bool,
}

/// How faithfully a user predicate was translated to the oplog shape.
#[derive(Debug, Clone, PartialEq)]
enum Rewrite {
    /// Matches an entry exactly when the predicate matches every event the
    /// entry produces.
    Exact(Expression),
    /// Matches at least every entry that yields a matching event.
    Inexact(Expression),
    Unsupported,
}

impl Rewrite {
    fn is_exact(&self) -> bool {
        matches!(self, Rewrite::Exact(_))
    }

    fn into_expression(self) -> Option<Expression> {
        match self {
            Rewrite::Exact(e) | Rewrite::Inexact(e) => Some(e),
            Rewrite::Unsupported => None,
        }
    }
}

pub fn compile(
    filter: &Expression,
    scope: &WatchScope,
    collation: Option<&Collation>,
    pushdown_enabled: bool,
) -> CompiledFilter {
    let collation = collation.cloned().unwrap_or_else(Collation::simple);
    let oplog = if pushdown_enabled {
        let rewriter = Rewriter {
            simple_collation: collation.is_simple(),
        };
        let user = rewriter
            .rewrite(filter)
            .into_expression()
            .unwrap_or(Expression::AlwaysTrue);
        let admitted = match invalidating_entries(scope) {
            Some(invalidating) => Expression::or(vec![user, invalidating]),
            None => user,
        };
        Expression::and(vec![scope_filter(scope), admitted])
    } else {
        Expression::AlwaysTrue
    };
    debug!(
        oplog = %oplog.to_document(),
        residual = %filter.to_document(),
        pushdown_enabled,
        "compiled change stream filter"
    );
    CompiledFilter {
        oplog,
        residual: filter.clone(),
        collation,
        pushdown: pushdown_enabled,
    }
}

impl CompiledFilter {
    pub fn oplog_filter(&self) -> &Expression {
        &self.oplog
    }

    pub fn residual_filter(&self) -> &Expression {
        &self.residual
    }

    /// Whether a raw entry may yield a matching event. Transaction commits
    /// always pass; their statements are checked one by one after unwinding.
    pub fn admits_entry(&self, entry: &RawLogEntry) -> bool {
        if entry.op == OpKind::CommitTxn || self.oplog.is_always_true() {
            return true;
        }
        matches(&entry.to_document(), &self.oplog)
    }

    pub fn admits_event(&self, event: &ChangeEvent) -> bool {
        self.residual.is_always_true() || matches_with(&event.to_document(), &self.residual, &self.collation)
    }

    pub fn explain(&self) -> Document {
        doc! {
            "pushdown": self.pushdown,
            "oplogFilter": self.oplog.to_document(),
            "residualFilter": self.residual.to_document(),
        }
    }
}

struct Rewriter {
    simple_collation: bool,
}

impl Rewriter {
    fn rewrite(&self, expr: &Expression) -> Rewrite {
        match expr {
            Expression::AlwaysTrue | Expression::AlwaysFalse => Rewrite::Exact(expr.clone()),
            Expression::And(children) => self.rewrite_and(children),
            Expression::Or(children) => {
                let mut exact = true;
                let mut out = Vec::with_capacity(children.len());
                for child in children {
                    let rewritten = self.rewrite(child);
                    exact &= rewritten.is_exact();
                    match rewritten.into_expression() {
                        Some(e) => out.push(e),
                        None => return Rewrite::Unsupported,
                    }
                }
                wrap(exact, Expression::or(out))
            }
            Expression::Nor(children) => {
                let mut out = Vec::with_capacity(children.len());
                for child in children {
                    match self.rewrite(child) {
                        Rewrite::Exact(e) => out.push(e),
                        _ => return Rewrite::Unsupported,
                    }
                }
                Rewrite::Exact(Expression::Nor(out))
            }
            leaf => match leaf_field(leaf) {
                Some(field) if under(field, "fullDocument") => self.rewrite_full_document(leaf, field),
                Some(field) if under(field, "to") => self.rewrite_rename_target(leaf, field),
                Some(field) if under(field, "updateDescription") => {
                    present_only_on(leaf, update_delta_entry())
                }
                _ => match leaf {
                    Expression::Eq(field, value) => self.rewrite_eq(field, value),
                    Expression::In(field, values) if field == "operationType" || under(field, "ns") => {
                        self.rewrite_in(field, values)
                    }
                    _ => Rewrite::Unsupported,
                },
            },
        }
    }

    /// `$in` as a disjunction of equalities.
    fn rewrite_in(&self, field: &str, values: &[Bson]) -> Rewrite {
        if values.iter().any(|v| matches!(v, Bson::RegularExpression(_))) {
            return Rewrite::Unsupported;
        }
        let mut exact = true;
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            let rewritten = self.rewrite_eq(field, value);
            exact &= rewritten.is_exact();
            match rewritten.into_expression() {
                Some(e) => out.push(e),
                None => return Rewrite::Unsupported,
            }
        }
        wrap(exact, Expression::or(out))
    }

    /// Inserts and replaces carry the full document as `o`. Every other
    /// event has no `fullDocument`, so those entries pass only when the
    /// predicate holds for a missing field.
    fn rewrite_full_document(&self, leaf: &Expression, field: &str) -> Rewrite {
        if !self.simple_collation && leaf_has_string(leaf) {
            return Rewrite::Unsupported;
        }
        let on_o = with_field(leaf, format!("o{}", &field["fullDocument".len()..]));
        let mut admitted = vec![
            Expression::and(vec![Expression::eq("op", "i"), on_o.clone()]),
            Expression::and(vec![Expression::eq("op", "u"), Expression::exists("o._id", true), on_o]),
        ];
        if matches(&Document::new(), leaf) {
            admitted.push(Expression::In(
                "op".into(),
                vec![Bson::from("d"), Bson::from("c"), Bson::from("n")],
            ));
            admitted.push(update_delta_entry());
        }
        Rewrite::Inexact(Expression::or(admitted))
    }

    /// Only renames carry `to`. Equality on the target narrows to the
    /// entry's `o.to` string.
    fn rewrite_rename_target(&self, leaf: &Expression, field: &str) -> Rewrite {
        let renames = command_entry("o.renameCollection");
        if !self.simple_collation {
            return present_only_on(leaf, renames);
        }
        let target = match (field, leaf) {
            ("to", Expression::Eq(_, Bson::Document(ns))) => match (ns.get_str("db"), ns.get_str("coll"), ns.len()) {
                (Ok(db), Ok(coll), 2) => Some(Expression::eq("o.to", format!("{db}.{coll}"))),
                _ => None,
            },
            ("to.db", Expression::Eq(_, Bson::String(db))) => {
                Some(anchored("o.to", &format!(r"^{}\.", regex::escape(db))))
            }
            ("to.coll", Expression::Eq(_, Bson::String(coll))) => {
                Some(anchored("o.to", &format!(r"^[^.]+\.{}$", regex::escape(coll))))
            }
            _ => None,
        };
        match target {
            Some(target) if !matches(&Document::new(), leaf) => {
                Rewrite::Inexact(Expression::and(vec![renames, target]))
            }
            _ => present_only_on(leaf, renames),
        }
    }

    /// Children that cannot be translated are dropped, which only widens
    /// the conjunction.
    fn rewrite_and(&self, children: &[Expression]) -> Rewrite {
        let mut exact = true;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let rewritten = self.rewrite(child);
            exact &= rewritten.is_exact();
            if let Some(e) = rewritten.into_expression() {
                out.push(e);
            }
        }
        if out.is_empty() {
            return Rewrite::Unsupported;
        }
        wrap(exact, Expression::and(out))
    }

    fn rewrite_eq(&self, field: &str, value: &Bson) -> Rewrite {
        if !self.simple_collation && contains_string(value) {
            return Rewrite::Unsupported;
        }
        match field {
            "operationType" => operation_type(value),
            "ns" => namespace_document(value),
            "ns.db" => match value {
                Bson::String(db) => Rewrite::Exact(in_database(db)),
                _ => Rewrite::Unsupported,
            },
            "ns.coll" => match value {
                Bson::String(coll) => Rewrite::Inexact(Expression::or(vec![
                    anchored("ns", &format!(r"^[^.]+\.{}$", regex::escape(coll))),
                    drop_database_entry(),
                ])),
                _ => Rewrite::Unsupported,
            },
            "txnNumber" if !matches!(value, Bson::Null) => Rewrite::Exact(Expression::eq("txnNumber", value.clone())),
            _ if field == "lsid" || field.starts_with("lsid.") => {
                if matches!(value, Bson::Null) {
                    Rewrite::Unsupported
                } else {
                    Rewrite::Exact(Expression::eq(field, value.clone()))
                }
            }
            _ if field == "documentKey" || field.starts_with("documentKey.") => {
                if matches!(value, Bson::Null) {
                    return Rewrite::Unsupported;
                }
                let suffix = &field["documentKey".len()..];
                Rewrite::Inexact(Expression::or(vec![
                    Expression::and(vec![
                        Expression::In("op".into(), vec![Bson::from("i"), Bson::from("u")]),
                        Expression::eq(format!("o2{suffix}"), value.clone()),
                    ]),
                    Expression::and(vec![
                        Expression::eq("op", "d"),
                        Expression::eq(format!("o{suffix}"), value.clone()),
                    ]),
                    Expression::and(vec![Expression::eq("op", "i"), Expression::exists("o2", false)]),
                ]))
            }
            _ => Rewrite::Unsupported,
        }
    }
}

fn wrap(exact: bool, expr: Expression) -> Rewrite {
    if exact {
        Rewrite::Exact(expr)
    } else {
        Rewrite::Inexact(expr)
    }
}

/// Entry predicate for one `operationType` value.
fn operation_type(value: &Bson) -> Rewrite {
    let Bson::String(name) = value else {
        return Rewrite::Exact(Expression::AlwaysFalse);
    };
    let Some(op) = OperationType::from_name(name) else {
        return Rewrite::Exact(Expression::AlwaysFalse);
    };
    match op {
        OperationType::Insert => Rewrite::Exact(Expression::eq("op", "i")),
        OperationType::Delete => Rewrite::Exact(Expression::eq("op", "d")),
        OperationType::Update => Rewrite::Exact(Expression::and(vec![
            Expression::eq("op", "u"),
            Expression::exists("o._id", false),
        ])),
        OperationType::Replace => Rewrite::Exact(Expression::and(vec![
            Expression::eq("op", "u"),
            Expression::exists("o._id", true),
        ])),
        OperationType::Drop => Rewrite::Inexact(Expression::and(vec![
            Expression::eq("op", "c"),
            Expression::or(vec![
                Expression::exists("o.drop", true),
                Expression::exists("o.dropDatabase", true),
            ]),
        ])),
        OperationType::Create => Rewrite::Inexact(command_entry("o.create")),
        OperationType::Rename => Rewrite::Inexact(command_entry("o.renameCollection")),
        OperationType::DropDatabase => Rewrite::Inexact(command_entry("o.dropDatabase")),
        OperationType::Invalidate => Rewrite::Inexact(Expression::eq("op", "c")),
        // Synthesized by the coordinator, never read from an oplog.
        OperationType::ShardCollection | OperationType::ShardAdded | OperationType::ShardRemoved => {
            Rewrite::Exact(Expression::AlwaysFalse)
        }
    }
}

/// `ns: {db, coll}` or `ns: {db}` equality.
fn namespace_document(value: &Bson) -> Rewrite {
    let Bson::Document(ns) = value else {
        return Rewrite::Unsupported;
    };
    let keys: Vec<&str> = ns.keys().map(String::as_str).collect();
    match (keys.as_slice(), ns.get("db"), ns.get("coll")) {
        (["db", "coll"], Some(Bson::String(db)), Some(Bson::String(coll))) => Rewrite::Inexact(Expression::or(vec![
            Expression::eq("ns", format!("{db}.{coll}")),
            Expression::and(vec![Expression::eq("ns", db.as_str()), drop_database_entry()]),
        ])),
        (["db"], Some(Bson::String(db)), None) => Rewrite::Inexact(Expression::and(vec![
            Expression::eq("ns", db.as_str()),
            drop_database_entry(),
        ])),
        _ => Rewrite::Unsupported,
    }
}

fn drop_database_entry() -> Expression {
    Expression::and(vec![Expression::eq("op", "c"), Expression::exists("o.dropDatabase", true)])
}

fn command_entry(field: &str) -> Expression {
    Expression::and(vec![Expression::eq("op", "c"), Expression::exists(field, true)])
}

/// `$set`/`$unset` updates, the only entries with an `updateDescription`.
fn update_delta_entry() -> Expression {
    Expression::and(vec![Expression::eq("op", "u"), Expression::exists("o._id", false)])
}

/// For event fields that only `producers` yield: a predicate that fails on
/// a missing field can only match events of those entries.
fn present_only_on(leaf: &Expression, producers: Expression) -> Rewrite {
    if matches(&Document::new(), leaf) {
        Rewrite::Unsupported
    } else {
        Rewrite::Inexact(producers)
    }
}

fn anchored(field: &str, pattern: &str) -> Expression {
    match Regex::new(pattern) {
        Ok(re) => Expression::Regex(field.into(), re),
        Err(_) => Expression::AlwaysTrue,
    }
}

fn in_database(db: &str) -> Expression {
    Expression::or(vec![
        Expression::eq("ns", db),
        anchored("ns", &format!(r"^{}\.", regex::escape(db))),
    ])
}

fn under(field: &str, root: &str) -> bool {
    field
        .strip_prefix(root)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn leaf_field(expr: &Expression) -> Option<&str> {
    match expr {
        Expression::Eq(field, _)
        | Expression::Ne(field, _)
        | Expression::Gt(field, _)
        | Expression::Gte(field, _)
        | Expression::Lt(field, _)
        | Expression::Lte(field, _)
        | Expression::In(field, _)
        | Expression::Nin(field, _)
        | Expression::Regex(field, _)
        | Expression::Exists(field, _) => Some(field),
        _ => None,
    }
}

/// The same predicate over another path.
fn with_field(expr: &Expression, field: String) -> Expression {
    match expr {
        Expression::Eq(_, v) => Expression::Eq(field, v.clone()),
        Expression::Ne(_, v) => Expression::Ne(field, v.clone()),
        Expression::Gt(_, v) => Expression::Gt(field, v.clone()),
        Expression::Gte(_, v) => Expression::Gte(field, v.clone()),
        Expression::Lt(_, v) => Expression::Lt(field, v.clone()),
        Expression::Lte(_, v) => Expression::Lte(field, v.clone()),
        Expression::In(_, vs) => Expression::In(field, vs.clone()),
        Expression::Nin(_, vs) => Expression::Nin(field, vs.clone()),
        Expression::Regex(_, re) => Expression::Regex(field, re.clone()),
        Expression::Exists(_, present) => Expression::Exists(field, *present),
        other => other.clone(),
    }
}

fn leaf_has_string(expr: &Expression) -> bool {
    match expr {
        Expression::Regex(..) => true,
        Expression::Exists(..) => false,
        Expression::In(_, vs) | Expression::Nin(_, vs) => vs.iter().any(contains_string),
        Expression::Eq(_, v)
        | Expression::Ne(_, v)
        | Expression::Gt(_, v)
        | Expression::Gte(_, v)
        | Expression::Lt(_, v)
        | Expression::Lte(_, v) => contains_string(v),
        _ => false,
    }
}

/// Entries that can yield events inside the watched scope.
fn scope_filter(scope: &WatchScope) -> Expression {
    match scope {
        WatchScope::Collection(ns) => Expression::or(vec![
            Expression::eq("ns", ns.full_name()),
            Expression::and(vec![Expression::eq("ns", ns.db.as_str()), drop_database_entry()]),
        ]),
        WatchScope::Database(db) => in_database(db),
        WatchScope::Cluster => Expression::Nor(vec![anchored("ns", r"^(admin|config|local)(\.|$)")]),
    }
}

/// Entries that end a collection-scoped stream. Their invalidate events
/// bypass the user filter, so the entries must too.
fn invalidating_entries(scope: &WatchScope) -> Option<Expression> {
    let ns = scope.watched_collection()?;
    Some(Expression::or(vec![
        Expression::and(vec![
            Expression::eq("ns", ns.full_name()),
            Expression::eq("op", "c"),
            Expression::or(vec![
                Expression::exists("o.drop", true),
                Expression::exists("o.renameCollection", true),
            ]),
        ]),
        Expression::and(vec![Expression::eq("ns", ns.db.as_str()), drop_database_entry()]),
    ]))
}

fn contains_string(value: &Bson) -> bool {
    match value {
        Bson::String(_) => true,
        Bson::Array(items) => items.iter().any(contains_string),
        Bson::Document(doc) => doc.values().any(contains_string),
        _ => false,
    }
}
