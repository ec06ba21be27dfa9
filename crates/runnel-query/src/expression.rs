use bson::{Bson, Document, doc};
use regex::Regex;

/// A recursive filter expression tree.
///
/// Owns field paths and values so a compiled filter can live as long as the
/// stream that uses it. The same tree type describes predicates over change
/// events and predicates over raw oplog entries.
#[derive(Debug, Clone)]
pub enum Expression {
    // Logical
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Nor(Vec<Expression>),
    // Comparison: dotted field path + value
    Eq(String, Bson),
    Ne(String, Bson),
    Gt(String, Bson),
    Gte(String, Bson),
    Lt(String, Bson),
    Lte(String, Bson),
    // Set membership
    In(String, Vec<Bson>),
    Nin(String, Vec<Bson>),
    // Pattern, compiled once at parse time
    Regex(String, Regex),
    // Existence
    Exists(String, bool),
    // Constants
    AlwaysTrue,
    AlwaysFalse,
}

impl Expression {
    /// Conjunction that collapses trivial shapes: no children is `AlwaysTrue`,
    /// one child is the child itself, and `AlwaysTrue` children are dropped.
    pub fn and(children: Vec<Expression>) -> Expression {
        let mut kept: Vec<Expression> = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Expression::AlwaysTrue => {}
                Expression::AlwaysFalse => return Expression::AlwaysFalse,
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => Expression::AlwaysTrue,
            1 => kept.pop().unwrap_or(Expression::AlwaysTrue),
            _ => Expression::And(kept),
        }
    }

    /// Disjunction that collapses trivial shapes: no children is `AlwaysFalse`,
    /// one child is the child itself, and any `AlwaysTrue` child wins.
    pub fn or(children: Vec<Expression>) -> Expression {
        let mut kept: Vec<Expression> = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Expression::AlwaysFalse => {}
                Expression::AlwaysTrue => return Expression::AlwaysTrue,
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => Expression::AlwaysFalse,
            1 => kept.pop().unwrap_or(Expression::AlwaysFalse),
            _ => Expression::Or(kept),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expression {
        Expression::Eq(field.into(), value.into())
    }

    pub fn exists(field: impl Into<String>, present: bool) -> Expression {
        Expression::Exists(field.into(), present)
    }

    pub fn is_always_true(&self) -> bool {
        matches!(self, Expression::AlwaysTrue)
    }

    /// Render the tree back into query-document form. Used for explain
    /// output and log lines; not guaranteed to re-parse into an identical tree
    /// for the constant variants.
    pub fn to_document(&self) -> Document {
        match self {
            Expression::And(children) => doc! { "$and": render_children(children) },
            Expression::Or(children) => doc! { "$or": render_children(children) },
            Expression::Nor(children) => doc! { "$nor": render_children(children) },
            Expression::Eq(f, v) => field_op(f, "$eq", v.clone()),
            Expression::Ne(f, v) => field_op(f, "$ne", v.clone()),
            Expression::Gt(f, v) => field_op(f, "$gt", v.clone()),
            Expression::Gte(f, v) => field_op(f, "$gte", v.clone()),
            Expression::Lt(f, v) => field_op(f, "$lt", v.clone()),
            Expression::Lte(f, v) => field_op(f, "$lte", v.clone()),
            Expression::In(f, vs) => field_op(f, "$in", Bson::Array(vs.clone())),
            Expression::Nin(f, vs) => field_op(f, "$nin", Bson::Array(vs.clone())),
            Expression::Regex(f, re) => field_op(f, "$regex", Bson::String(re.as_str().into())),
            Expression::Exists(f, b) => field_op(f, "$exists", Bson::Boolean(*b)),
            Expression::AlwaysTrue => doc! { "$alwaysTrue": 1 },
            Expression::AlwaysFalse => doc! { "$alwaysFalse": 1 },
        }
    }
}

fn render_children(children: &[Expression]) -> Vec<Bson> {
    children
        .iter()
        .map(|c| Bson::Document(c.to_document()))
        .collect()
}

fn field_op(field: &str, op: &str, value: Bson) -> Document {
    let mut inner = Document::new();
    inner.insert(op, value);
    let mut outer = Document::new();
    outer.insert(field, inner);
    outer
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expression::And(a), Expression::And(b)) => a == b,
            (Expression::Or(a), Expression::Or(b)) => a == b,
            (Expression::Nor(a), Expression::Nor(b)) => a == b,
            (Expression::Eq(f1, v1), Expression::Eq(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::Ne(f1, v1), Expression::Ne(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::Gt(f1, v1), Expression::Gt(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::Gte(f1, v1), Expression::Gte(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::Lt(f1, v1), Expression::Lt(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::Lte(f1, v1), Expression::Lte(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::In(f1, v1), Expression::In(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::Nin(f1, v1), Expression::Nin(f2, v2)) => f1 == f2 && v1 == v2,
            (Expression::Regex(f1, r1), Expression::Regex(f2, r2)) => {
                f1 == f2 && r1.as_str() == r2.as_str()
            }
            (Expression::Exists(f1, b1), Expression::Exists(f2, b2)) => f1 == f2 && b1 == b2,
            (Expression::AlwaysTrue, Expression::AlwaysTrue) => true,
            (Expression::AlwaysFalse, Expression::AlwaysFalse) => true,
            _ => false,
        }
    }
}
