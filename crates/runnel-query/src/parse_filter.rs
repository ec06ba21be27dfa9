use bson::{Bson, Document};
use regex::Regex;

use crate::expression::Expression;

/// Parse error for filter documents.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParseError(pub String);

impl std::fmt::Display for FilterParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "filter parse error: {}", self.0)
    }
}

impl std::error::Error for FilterParseError {}

/// Parse a BSON filter document into an Expression tree.
///
/// Follows MongoDB query semantics:
/// - Top-level document is an implicit AND of all entries
/// - `{ "field": value }` is implicit `$eq`
/// - `{ "field": { "$gt": v } }` uses operator sub-documents
/// - `{ "$or": [...] }` / `{ "$and": [...] }` / `{ "$nor": [...] }` for logical ops
/// - `{ "field": { "$in": [...] } }` / `$nin` for set membership
/// - `{ "field": { "$regex": "pattern", "$options": "i" } }` for regex
/// - `{ "field": { "$exists": true } }` for field existence checks
///
/// An empty document matches everything.
pub fn parse_filter(doc: &Document) -> Result<Expression, FilterParseError> {
    let mut children = Vec::new();

    for (key, value) in doc {
        match key.as_str() {
            "$and" => children.push(Expression::And(parse_logical_array(value)?)),
            "$or" => children.push(Expression::Or(parse_logical_array(value)?)),
            "$nor" => children.push(Expression::Nor(parse_logical_array(value)?)),
            k if k.starts_with('$') => {
                return Err(FilterParseError(format!("unknown top-level operator: {k}")));
            }
            _ => children.push(parse_field_condition(key, value)?),
        }
    }

    Ok(match children.len() {
        0 => Expression::AlwaysTrue,
        1 => children.pop().unwrap_or(Expression::AlwaysTrue),
        _ => Expression::And(children),
    })
}

/// Parse a `$and` / `$or` / `$nor` array value into its child expressions.
fn parse_logical_array(value: &Bson) -> Result<Vec<Expression>, FilterParseError> {
    let arr = match value {
        Bson::Array(a) => a,
        _ => return Err(FilterParseError("$and/$or/$nor value must be an array".into())),
    };

    let mut children = Vec::with_capacity(arr.len());
    for elem in arr {
        match elem {
            Bson::Document(sub_doc) => children.push(parse_filter(sub_doc)?),
            _ => {
                return Err(FilterParseError(
                    "$and/$or/$nor array elements must be documents".into(),
                ));
            }
        }
    }

    if children.is_empty() {
        return Err(FilterParseError("$and/$or/$nor array must not be empty".into()));
    }

    Ok(children)
}

/// Parse a field condition: either implicit $eq or an operator sub-document.
fn parse_field_condition(field: &str, value: &Bson) -> Result<Expression, FilterParseError> {
    match value {
        // If value is a document whose first key starts with $, it's an operator doc
        Bson::Document(sub_doc)
            if sub_doc.keys().next().is_some_and(|k| k.starts_with('$')) =>
        {
            parse_operator_doc(field, sub_doc)
        }
        _ => Ok(Expression::Eq(field.to_string(), value.clone())),
    }
}

/// Parse an operator sub-document like `{ "$gt": 21, "$lte": 100 }`.
fn parse_operator_doc(field: &str, doc: &Document) -> Result<Expression, FilterParseError> {
    let mut conditions: Vec<Expression> = Vec::new();

    for (op_key, op_value) in doc {
        // $regex needs special handling (consumes $options sibling)
        if op_key == "$regex" {
            return parse_regex(field, doc);
        }

        let f = field.to_string();
        let expr = match op_key.as_str() {
            "$eq" => Expression::Eq(f, op_value.clone()),
            "$ne" => Expression::Ne(f, op_value.clone()),
            "$gt" => Expression::Gt(f, op_value.clone()),
            "$gte" => Expression::Gte(f, op_value.clone()),
            "$lt" => Expression::Lt(f, op_value.clone()),
            "$lte" => Expression::Lte(f, op_value.clone()),
            "$in" => Expression::In(f, set_values(op_key, op_value)?),
            "$nin" => Expression::Nin(f, set_values(op_key, op_value)?),
            "$exists" => match op_value {
                Bson::Boolean(b) => Expression::Exists(f, *b),
                Bson::Int32(n) => Expression::Exists(f, *n != 0),
                _ => return Err(FilterParseError("$exists value must be a boolean".into())),
            },
            "$options" => {
                return Err(FilterParseError("$options without $regex".into()));
            }
            k => return Err(FilterParseError(format!("unknown field operator: {k}"))),
        };
        conditions.push(expr);
    }

    match conditions.len() {
        0 => Err(FilterParseError("empty operator document".into())),
        1 => Ok(conditions.pop().unwrap_or(Expression::AlwaysTrue)),
        _ => Ok(Expression::And(conditions)),
    }
}

fn set_values(op: &str, value: &Bson) -> Result<Vec<Bson>, FilterParseError> {
    match value {
        Bson::Array(values) => Ok(values.clone()),
        _ => Err(FilterParseError(format!("{op} value must be an array"))),
    }
}

/// Parse a `$regex` + optional `$options` sub-document.
fn parse_regex(field: &str, doc: &Document) -> Result<Expression, FilterParseError> {
    let mut pattern: Option<&str> = None;
    let mut options: Option<&str> = None;

    for (key, value) in doc {
        match key.as_str() {
            "$regex" => match value {
                Bson::String(s) => pattern = Some(s.as_str()),
                _ => return Err(FilterParseError("$regex value must be a string".into())),
            },
            "$options" => match value {
                Bson::String(s) => options = Some(s.as_str()),
                _ => return Err(FilterParseError("$options value must be a string".into())),
            },
            k => {
                return Err(FilterParseError(format!(
                    "unexpected key alongside $regex: {k}"
                )));
            }
        }
    }

    let pat = pattern.ok_or_else(|| FilterParseError("missing $regex pattern".into()))?;
    compile_regex(field, pat, options)
}

fn compile_regex(
    field: &str,
    pat: &str,
    options: Option<&str>,
) -> Result<Expression, FilterParseError> {
    // Build final pattern with flags
    let full_pattern = match options.filter(|o| !o.is_empty()) {
        Some(opts) => {
            let mut prefix = String::with_capacity(4 + opts.len() + pat.len());
            prefix.push_str("(?");
            for ch in opts.chars() {
                match ch {
                    'i' | 's' | 'm' | 'x' => prefix.push(ch),
                    c => return Err(FilterParseError(format!("unknown regex option: {c}"))),
                }
            }
            prefix.push(')');
            prefix.push_str(pat);
            prefix
        }
        None => pat.to_string(),
    };

    let re = Regex::new(&full_pattern)
        .map_err(|e| FilterParseError(format!("invalid regex pattern: {e}")))?;

    Ok(Expression::Regex(field.to_string(), re))
}
