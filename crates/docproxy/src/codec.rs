//! Conversions between this crate's own [`Value`] model (§4.1) and the
//! canonical extended JSON representation used both on the wire (decoded
//! `OP_MSG` sections) and at rest (the `_jsonb` column, per the wire
//! encoding resolution in the specification). `Value` itself never depends
//! on `bson`; this module is the only place that crosses between the two.

use crate::value::{Document, Value};
use bson::Bson;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported BSON variant: {0}")]
    UnsupportedVariant(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Converts a [`Value`] into a `bson::Bson`, the inverse of [`bson_to_value`].
pub fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Double(d) => Bson::Double(*d),
        Value::String(s) => Bson::String(s.clone()),
        Value::Document(doc) => Bson::Document(document_to_bson(doc)),
        Value::Array(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
        Value::Binary(bytes) => Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: bytes.clone(),
        }),
        Value::ObjectId(bytes) => Bson::ObjectId(bson::oid::ObjectId::from_bytes(*bytes)),
        Value::Boolean(b) => Bson::Boolean(*b),
        Value::DateTime(millis) => Bson::DateTime(bson::DateTime::from_millis(*millis)),
        Value::Null => Bson::Null,
        Value::Int32(i) => Bson::Int32(*i),
        Value::Int64(i) => Bson::Int64(*i),
    }
}

/// Converts a [`Document`] into a `bson::Document`, the inverse of
/// [`bson_to_document`].
pub fn document_to_bson(doc: &Document) -> bson::Document {
    let mut out = bson::Document::new();
    for (key, value) in doc.iter() {
        out.insert(key.clone(), value_to_bson(value));
    }
    out
}

/// Converts a `bson::Bson` into this crate's [`Value`], the inverse of
/// [`value_to_bson`]. Variants outside this crate's supported set
/// (`JavaScriptCode`, `Decimal128`, `MaxKey`/`MinKey`, `Timestamp`, ...) are
/// rejected rather than silently narrowed.
pub fn bson_to_value(bson: &Bson) -> Result<Value, CodecError> {
    Ok(match bson {
        Bson::Double(d) => Value::Double(*d),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Document(doc) => Value::Document(bson_to_document(doc)?),
        Bson::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(bson_to_value(item)?);
            }
            Value::Array(out)
        }
        Bson::Binary(bin) => Value::Binary(bin.bytes.clone()),
        Bson::ObjectId(oid) => Value::ObjectId(oid.bytes()),
        Bson::Boolean(b) => Value::Boolean(*b),
        Bson::DateTime(dt) => Value::DateTime(dt.timestamp_millis()),
        Bson::Null => Value::Null,
        Bson::Int32(i) => Value::Int32(*i),
        Bson::Int64(i) => Value::Int64(*i),
        other => {
            return Err(CodecError::UnsupportedVariant(format!(
                "{:?}",
                other.element_type()
            )))
        }
    })
}

pub fn bson_to_document(doc: &bson::Document) -> Result<Document, CodecError> {
    let mut pairs = Vec::with_capacity(doc.len());
    for (key, value) in doc {
        pairs.push((key.clone(), bson_to_value(value)?));
    }
    Ok(Document::from_pairs(pairs))
}

/// Serializes a [`Document`] to canonical extended JSON text, ready to bind
/// as the `_jsonb` column's value.
pub fn document_to_canonical_json(doc: &Document) -> String {
    Bson::Document(document_to_bson(doc))
        .into_canonical_extjson()
        .to_string()
}

/// Parses the `_jsonb` column's canonical extended JSON text back into a
/// [`Document`].
pub fn document_from_canonical_json(text: &str) -> Result<Document, CodecError> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    let bson = Bson::try_from(json).map_err(|_| {
        CodecError::UnsupportedVariant("could not interpret stored JSON as extended JSON".into())
    })?;
    match bson {
        Bson::Document(doc) => bson_to_document(&doc),
        other => Err(CodecError::UnsupportedVariant(format!(
            "{:?}",
            other.element_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_supported_variant() {
        let doc = Document::from_pairs([
            ("d".to_string(), Value::Double(1.5)),
            ("s".to_string(), Value::String("hi".to_string())),
            (
                "nested".to_string(),
                Value::Document(Document::from_pairs([(
                    "a".to_string(),
                    Value::Int32(1),
                )])),
            ),
            (
                "arr".to_string(),
                Value::Array(vec![Value::Int64(1), Value::Null]),
            ),
            ("bin".to_string(), Value::Binary(vec![1, 2, 3])),
            ("oid".to_string(), Value::ObjectId([7u8; 12])),
            ("b".to_string(), Value::Boolean(true)),
            ("dt".to_string(), Value::DateTime(1_700_000_000_000)),
            ("n".to_string(), Value::Null),
            ("i32".to_string(), Value::Int32(-5)),
            ("i64".to_string(), Value::Int64(9_000_000_000)),
        ]);

        let json = document_to_canonical_json(&doc);
        let round_tripped = document_from_canonical_json(&json).unwrap();
        assert_eq!(doc, round_tripped);
    }

    #[test]
    fn rejects_unsupported_bson_variants() {
        let text = r#"{"ts": {"$timestamp": {"t": 1, "i": 1}}}"#;
        assert!(document_from_canonical_json(text).is_err());
    }
}
