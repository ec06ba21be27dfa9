use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::collation::Collation;
use crate::expression::Expression;

/// Evaluate whether a document matches the given expression with simple
/// (code point) string comparison.
pub fn matches(doc: &Document, expr: &Expression) -> bool {
    matches_with(doc, expr, &Collation::simple())
}

/// Evaluate whether a document matches the given expression, comparing
/// strings under `collation`.
pub fn matches_with(doc: &Document, expr: &Expression, collation: &Collation) -> bool {
    match expr {
        Expression::AlwaysTrue => true,
        Expression::AlwaysFalse => false,
        Expression::And(children) => children.iter().all(|c| matches_with(doc, c, collation)),
        Expression::Or(children) => children.iter().any(|c| matches_with(doc, c, collation)),
        Expression::Nor(children) => !children.iter().any(|c| matches_with(doc, c, collation)),
        Expression::Eq(field, val) => field_eq(doc, field, val, collation),
        Expression::Ne(field, val) => !field_eq(doc, field, val, collation),
        Expression::In(field, vals) => vals.iter().any(|v| field_eq(doc, field, v, collation)),
        Expression::Nin(field, vals) => !vals.iter().any(|v| field_eq(doc, field, v, collation)),
        Expression::Gt(field, val)
        | Expression::Gte(field, val)
        | Expression::Lt(field, val)
        | Expression::Lte(field, val) => {
            let predicate: fn(Ordering) -> bool = match expr {
                Expression::Gt(..) => |o| o == Ordering::Greater,
                Expression::Gte(..) => |o| o != Ordering::Less,
                Expression::Lt(..) => |o| o == Ordering::Less,
                _ => |o| o != Ordering::Greater,
            };
            candidates(doc, field).into_iter().any(|stored| {
                compare_values(stored, val, collation).is_some_and(predicate)
            })
        }
        Expression::Regex(field, re) => candidates(doc, field)
            .into_iter()
            .any(|stored| matches!(stored, Bson::String(s) if re.is_match(s))),
        Expression::Exists(field, expected) => {
            // Presence only: an explicit null still exists
            let present = !lookup_path(doc, field).is_empty();
            *expected == present
        }
    }
}

/// `$eq` semantics: null matches both missing fields and explicit null values;
/// an array field matches when any element (or the array itself) is equal.
fn field_eq(doc: &Document, field: &str, val: &Bson, collation: &Collation) -> bool {
    let found = lookup_path(doc, field);
    if matches!(val, Bson::Null) && found.is_empty() {
        return true;
    }
    found.into_iter().any(|stored| match stored {
        Bson::Array(arr) => {
            values_equal(stored, val, collation)
                || arr.iter().any(|elem| values_equal(elem, val, collation))
        }
        _ => values_equal(stored, val, collation),
    })
}

/// Values considered for comparison operators: scalars directly, and the
/// elements of an array field.
fn candidates<'a>(doc: &'a Document, field: &str) -> Vec<&'a Bson> {
    let mut out = Vec::new();
    for value in lookup_path(doc, field) {
        match value {
            Bson::Array(arr) => out.extend(arr.iter()),
            other => out.push(other),
        }
    }
    out
}

/// Resolve a dotted path. Arrays of documents along the way fan out, so the
/// result can hold several values.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let mut out = Vec::new();
    collect_path(doc, path, &mut out);
    out
}

fn collect_path<'a>(doc: &'a Document, path: &str, out: &mut Vec<&'a Bson>) {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };
    let Some(value) = doc.get(head) else {
        return;
    };
    match rest {
        None => out.push(value),
        Some(rest) => match value {
            Bson::Document(sub) => collect_path(sub, rest, out),
            Bson::Array(arr) => {
                for elem in arr {
                    if let Bson::Document(sub) = elem {
                        collect_path(sub, rest, out);
                    }
                }
            }
            _ => {}
        },
    }
}

/// Structural equality with numeric widening and collation-aware strings.
/// Embedded documents compare field by field in order.
pub fn values_equal(a: &Bson, b: &Bson, collation: &Collation) -> bool {
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => collation.compare(x, y) == Ordering::Equal,
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb, collation))
        }
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(va, vb)| values_equal(va, vb, collation))
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => match (a, b) {
                // Keep 64-bit integers exact
                (Bson::Int64(_) | Bson::Int32(_), Bson::Int64(_) | Bson::Int32(_)) => {
                    as_i64(a) == as_i64(b)
                }
                _ => x == y,
            },
            _ => a == b,
        },
    }
}

/// Ordering between two values of the same type class; `None` when the types
/// cannot be compared (silent exclusion, as with `$gt` on mismatched types).
fn compare_values(stored: &Bson, query: &Bson, collation: &Collation) -> Option<Ordering> {
    match (stored, query) {
        (Bson::String(a), Bson::String(b)) => Some(collation.compare(a, b)),
        (Bson::DateTime(a), Bson::DateTime(b)) => {
            Some(a.timestamp_millis().cmp(&b.timestamp_millis()))
        }
        (Bson::Timestamp(a), Bson::Timestamp(b)) => {
            Some((a.time, a.increment).cmp(&(b.time, b.increment)))
        }
        (Bson::Boolean(a), Bson::Boolean(b)) => Some(a.cmp(b)),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => Some(a.bytes().cmp(&b.bytes())),
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            Some(as_i64(stored)?.cmp(&as_i64(query)?))
        }
        _ => {
            let (a, b) = (as_f64(stored)?, as_f64(query)?);
            a.partial_cmp(&b)
        }
    }
}

fn as_i64(v: &Bson) -> Option<i64> {
    match v {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}
