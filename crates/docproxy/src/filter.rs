//! Filter / Limit / Projection (§4.3, post-fetch shaping). These are pure
//! functions over the [`Document`]/[`Value`] model, no backend I/O, and
//! are applied per cursor batch by the dispatcher rather than pushed into
//! the SQL query (§4.3: "filtering is post-fetch").

use crate::error::ProxyError;
use crate::value::{Document, Value};

/// Evaluates `predicate` against `doc`. The matcher surface is deliberately
/// narrow per §4.3: equality (a bare scalar, or `$eq`), numeric comparison
/// (`$gt`/`$gte`/`$lt`/`$lte`/`$ne`), and top-level `$or`. Any other
/// operator is rejected with `BadValue` rather than silently ignored.
pub fn matches(predicate: &Document, doc: &Document) -> Result<bool, ProxyError> {
    for (key, condition) in predicate.iter() {
        if key == "$or" {
            let branches = condition.as_array().map_err(ProxyError::from)?;
            let mut any = false;
            for branch in branches {
                let branch_doc = branch.as_document().map_err(ProxyError::from)?;
                if matches(branch_doc, doc)? {
                    any = true;
                    break;
                }
            }
            if !any {
                return Ok(false);
            }
            continue;
        }

        let field = doc.get_opt(key);
        if !matches_field(field, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_field(field: Option<&Value>, condition: &Value) -> Result<bool, ProxyError> {
    match condition {
        Value::Document(ops) if is_operator_document(ops) => {
            for (op, operand) in ops.iter() {
                let ok = match op.as_ref() {
                    "$eq" => values_equal(field, operand),
                    "$ne" => !values_equal(field, operand),
                    "$gt" => compare(field, operand)?.is_gt(),
                    "$gte" => compare(field, operand)?.is_ge(),
                    "$lt" => compare(field, operand)?.is_lt(),
                    "$lte" => compare(field, operand)?.is_le(),
                    other => {
                        return Err(ProxyError::BadValue(format!(
                            "unsupported query operator `{other}`"
                        )))
                    }
                };
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        // A bare scalar/document/array operand means plain equality.
        other => Ok(values_equal(field, other)),
    }
}

/// A document is treated as an operator document only when every key
/// starts with `$`; otherwise it's a literal value (a query equality
/// operand, or an update replacement document) -- MongoDB's own
/// disambiguation rule, reused by `dispatch`'s update-modifier handling.
pub fn is_operator_document(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

fn values_equal(field: Option<&Value>, operand: &Value) -> bool {
    match field {
        Some(v) => v == operand,
        None => matches!(operand, Value::Null),
    }
}

fn compare(field: Option<&Value>, operand: &Value) -> Result<std::cmp::Ordering, ProxyError> {
    let (Some(field), Some(rhs)) = (field.and_then(Value::as_f64_lossy), operand.as_f64_lossy())
    else {
        return Err(ProxyError::BadValue(
            "comparison operators require numeric operands".to_string(),
        ));
    };
    field
        .partial_cmp(&rhs)
        .ok_or_else(|| ProxyError::BadValue("cannot compare NaN".to_string()))
}

/// Keeps only the documents in `docs` for which `predicate` matches. An
/// empty predicate document matches everything.
pub fn filter(docs: Vec<Document>, predicate: &Document) -> Result<Vec<Document>, ProxyError> {
    if predicate.is_empty() {
        return Ok(docs);
    }
    docs.into_iter()
        .filter_map(|doc| match matches(predicate, &doc) {
            Ok(true) => Some(Ok(doc)),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        })
        .collect()
}

/// Applies MongoDB's limit sign convention (§4.3, pinned down per the
/// Open Question in §9-ORIG): `0` is unlimited, a positive `n` bounds the
/// count, and a negative `n` behaves identically to `n.abs()`. MongoDB
/// itself uses the sign only to additionally request single-batch
/// delivery, which this crate already guarantees (every `find` drains to
/// one reply batch, per SPEC_FULL §4.4's `getMore` resolution).
pub fn apply_limit(docs: &mut Vec<Document>, limit: i64) {
    if limit == 0 {
        return;
    }
    let bound = limit.unsigned_abs() as usize;
    docs.truncate(bound);
}

/// Inclusion-only projection: when `spec` is `Some` and non-empty, returns a
/// document containing only the requested top-level fields, plus `_id`
/// unless explicitly excluded with `{"_id": 0}`. A field named in `spec`
/// that the source document lacks is simply omitted, not an error.
pub fn project(doc: &Document, spec: Option<&Document>) -> Document {
    let Some(spec) = spec else {
        return doc.clone();
    };
    if spec.is_empty() {
        return doc.clone();
    }

    let include_id = spec
        .get_opt("_id")
        .map(|v| truthy(v))
        .unwrap_or(true);

    let mut out = Document::new();
    if include_id {
        if let Some(id) = doc.get_opt("_id") {
            out.set("_id", id.clone());
        }
    }
    for key in spec.keys() {
        if key == "_id" {
            continue;
        }
        if truthy(spec.get_opt(key).expect("key came from spec.keys()")) {
            if let Some(value) = doc.get_opt(key) {
                out.set(key, value.clone());
            }
        }
    }
    out
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Boolean(b) => *b,
        Value::Int32(i) => *i != 0,
        Value::Int64(i) => *i != 0,
        Value::Double(d) => *d != 0.0,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: Vec<(&str, Value)>) -> Document {
        Document::from_pairs(pairs.into_iter().map(|(k, v)| (k.to_string(), v)))
    }

    #[test]
    fn empty_predicate_matches_everything() {
        let d = doc(vec![("a", Value::Int32(1))]);
        assert!(matches(&Document::new(), &d).unwrap());
    }

    #[test]
    fn equality_on_missing_field_requires_null() {
        let d = doc(vec![("a", Value::Int32(1))]);
        let pred = doc(vec![("b", Value::Null)]);
        assert!(matches(&pred, &d).unwrap());
        let pred2 = doc(vec![("b", Value::Int32(1))]);
        assert!(!matches(&pred2, &d).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let d = doc(vec![("a", Value::Int32(5))]);
        let pred = doc(vec![("a", Value::Document(doc(vec![("$gte", Value::Int32(5))])))]);
        assert!(matches(&pred, &d).unwrap());
        let pred2 = doc(vec![("a", Value::Document(doc(vec![("$lt", Value::Int32(5))])))]);
        assert!(!matches(&pred2, &d).unwrap());
    }

    #[test]
    fn unknown_operator_is_bad_value() {
        let d = doc(vec![("a", Value::Int32(5))]);
        let pred = doc(vec![("a", Value::Document(doc(vec![("$mod", Value::Int32(2))])))]);
        assert!(matches!(matches(&pred, &d), Err(ProxyError::BadValue(_))));
    }

    #[test]
    fn or_matches_any_branch() {
        let d = doc(vec![("a", Value::Int32(1))]);
        let pred = doc(vec![(
            "$or",
            Value::Array(vec![
                Value::Document(doc(vec![("a", Value::Int32(2))])),
                Value::Document(doc(vec![("a", Value::Int32(1))])),
            ]),
        )]);
        assert!(matches(&pred, &d).unwrap());
    }

    #[test]
    fn limit_sign_conventions() {
        let mut docs = vec![
            doc(vec![("a", Value::Int32(1))]),
            doc(vec![("a", Value::Int32(2))]),
            doc(vec![("a", Value::Int32(3))]),
        ];
        let mut zero = docs.clone();
        apply_limit(&mut zero, 0);
        assert_eq!(zero.len(), 3);

        let mut one = docs.clone();
        apply_limit(&mut one, 1);
        assert_eq!(one.len(), 1);

        apply_limit(&mut docs, -2);
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn projection_keeps_id_unless_excluded() {
        let d = doc(vec![
            ("_id", Value::Int32(1)),
            ("a", Value::Int32(2)),
            ("b", Value::Int32(3)),
        ]);
        let spec = doc(vec![("a", Value::Int32(1))]);
        let projected = project(&d, Some(&spec));
        assert_eq!(projected.keys().collect::<Vec<_>>(), vec!["_id", "a"]);

        let spec_no_id = doc(vec![("a", Value::Int32(1)), ("_id", Value::Int32(0))]);
        let projected_no_id = project(&d, Some(&spec_no_id));
        assert_eq!(projected_no_id.keys().collect::<Vec<_>>(), vec!["a"]);
    }
}
