//! The in-memory document model that every other module in this crate
//! operates over. This is deliberately independent of `bson::Document`:
//! the wire layer (`crate::wire`) is the only place that translates
//! between BSON and `Value`/`Document`.

use indexmap::IndexMap;
use thiserror::Error;

/// A single BSON-ish scalar or composite value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Value>),
    Binary(Vec<u8>),
    /// 12-byte opaque MongoDB object id.
    ObjectId([u8; 12]),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    Null,
    Int32(i32),
    Int64(i64),
}

/// An ordered, key-unique mapping from `String` to `Value`.
///
/// Backed by `IndexMap` rather than a plain `HashMap` because `set`
/// must preserve a key's original position when replacing its value
/// (`IndexMap::insert` already does this), and iteration order must be
/// the insertion order.
#[derive(Debug, Clone, Default)]
pub struct Document {
    fields: IndexMap<String, Value>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("key `{0}` is not present in the document")]
    KeyNotFound(String),
    #[error("expected a {expected} value, found {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a document from alternating (key, value) pairs, in the
    /// order given. Later pairs with a duplicate key replace earlier
    /// ones in place, matching `set`'s semantics.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut doc = Self::new();
        for (k, v) in pairs {
            doc.set(k, v);
        }
        doc
    }

    pub fn get(&self, key: &str) -> Result<&Value, ValueError> {
        self.fields
            .get(key)
            .ok_or_else(|| ValueError::KeyNotFound(key.to_string()))
    }

    pub fn get_opt(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Replaces the value at `key` if present (keeping its position),
    /// or appends a new `(key, value)` pair at the end.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Document::from_pairs(iter)
    }
}

// `IndexMap`'s own `PartialEq` considers two maps equal regardless of
// key order. The data model here requires order-sensitive equality
// (see round-trip invariant in the specification), so this is written
// by hand instead of derived.
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|((k1, v1), (k2, v2))| k1 == k2 && v1 == v2)
    }
}

macro_rules! accessor {
    ($name:ident, $variant:ident, $ret:ty, $expected:expr) => {
        pub fn $name(&self) -> Result<&$ret, ValueError> {
            match self {
                Value::$variant(v) => Ok(v),
                other => Err(ValueError::TypeMismatch {
                    expected: $expected,
                    actual: other.type_name(),
                }),
            }
        }
    };
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Document(_) => "document",
            Value::Array(_) => "array",
            Value::Binary(_) => "binary",
            Value::ObjectId(_) => "objectId",
            Value::Boolean(_) => "bool",
            Value::DateTime(_) => "date",
            Value::Null => "null",
            Value::Int32(_) => "int",
            Value::Int64(_) => "long",
        }
    }

    accessor!(as_f64, Double, f64, "double");
    accessor!(as_str, String, String, "string");
    accessor!(as_document, Document, Document, "document");
    accessor!(as_array, Array, Vec<Value>, "array");
    accessor!(as_binary, Binary, Vec<u8>, "binary");
    accessor!(as_object_id, ObjectId, [u8; 12], "objectId");
    accessor!(as_bool, Boolean, bool, "bool");
    accessor!(as_datetime_millis, DateTime, i64, "date");
    accessor!(as_i32, Int32, i32, "int");
    accessor!(as_i64, Int64, i64, "long");

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric widening accessor used by filter/limit comparisons, where
    /// MongoDB treats int32/int64/double as one comparable numeric domain.
    pub fn as_f64_lossy(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_preserves_position_on_replace() {
        let mut doc = Document::from_pairs([
            ("a".to_string(), Value::Int32(1)),
            ("b".to_string(), Value::Int32(2)),
            ("c".to_string(), Value::Int32(3)),
        ]);
        doc.set("a", Value::Int32(100));
        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(doc.get("a").unwrap(), &Value::Int32(100));
    }

    #[test]
    fn set_appends_new_key_at_end() {
        let mut doc = Document::from_pairs([("a".to_string(), Value::Int32(1))]);
        doc.set("z", Value::Int32(9));
        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["a", "z"]);
    }

    #[test]
    fn equality_is_order_sensitive() {
        let a = Document::from_pairs([
            ("a".to_string(), Value::Int32(1)),
            ("b".to_string(), Value::Int32(2)),
        ]);
        let b = Document::from_pairs([
            ("b".to_string(), Value::Int32(2)),
            ("a".to_string(), Value::Int32(1)),
        ]);
        assert_ne!(a, b, "same keys/values in different order must differ");

        let c = Document::from_pairs([
            ("a".to_string(), Value::Int32(1)),
            ("b".to_string(), Value::Int32(2)),
        ]);
        assert_eq!(a, c);
    }

    #[test]
    fn get_missing_key_errors() {
        let doc = Document::new();
        assert_eq!(
            doc.get("missing").unwrap_err(),
            ValueError::KeyNotFound("missing".to_string())
        );
    }

    #[test]
    fn typed_accessor_reports_mismatch() {
        let v = Value::Int32(1);
        let err = v.as_str().unwrap_err();
        assert_eq!(
            err,
            ValueError::TypeMismatch {
                expected: "string",
                actual: "int"
            }
        );
    }

    #[test]
    fn deep_clone_has_no_shared_state() {
        let mut original = Document::from_pairs([(
            "nested".to_string(),
            Value::Document(Document::from_pairs([("x".to_string(), Value::Int32(1))])),
        )]);
        let cloned = original.clone();
        original.set(
            "nested",
            Value::Document(Document::from_pairs([("x".to_string(), Value::Int32(2))])),
        );
        assert_eq!(
            cloned.get("nested").unwrap().as_document().unwrap().get("x").unwrap(),
            &Value::Int32(1)
        );
    }
}
