//! # Tagged Codecs
//!
//! Payloads stored in documents (outputs, inputs, extra fields) are wrapped
//! as `{_t: tag, _b: bytes}` so that a reader picks the decoder by tag
//! instead of guessing from the shape of the data.
//!
//! Built-in tags: `null`, `bool`, `int`, `float`, `text`, `time`, `list`,
//! `map`, `array`, `table` and `blob` (raw bytes). A registry can map a
//! kind to a different tag; decoding an unregistered tag fails with
//! `SerializationError`.

use crate::{CellError, NumArray, Table, Timestamp, Value, ValueKind};
use std::collections::BTreeMap;
use std::fmt;

/// Tag key in an encoded payload.
pub const TAG_FIELD: &str = "_t";

/// Inline bytes key in an encoded payload.
pub const BYTES_FIELD: &str = "_b";

/// Blob reference key, replacing `_b` when the bytes were offloaded.
pub const BLOB_FIELD: &str = "_blob";

pub type EncodeFn = fn(&Value) -> Result<Vec<u8>, CellError>;
pub type DecodeFn = fn(&[u8]) -> Result<Value, CellError>;

/// One encode/decode pair.
#[derive(Clone, Copy)]
pub struct Codec {
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

/// Tag -> codec table, plus the tag chosen for each value kind.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    by_kind: BTreeMap<ValueKind, String>,
    codecs: BTreeMap<String, Codec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_kind: BTreeMap::new(),
            codecs: BTreeMap::new(),
        };
        let builtins: [(ValueKind, EncodeFn, DecodeFn); 11] = [
            (ValueKind::Null, |_| Ok(Vec::new()), |_| Ok(Value::Null)),
            (ValueKind::Bool, encode_bool, decode_bool),
            (ValueKind::Int, encode_int, decode_int),
            (ValueKind::Float, encode_float, decode_float),
            (ValueKind::Text, encode_text, decode_text),
            (ValueKind::Time, encode_time, decode_time),
            (ValueKind::List, encode_postcard, decode_postcard),
            (ValueKind::Map, encode_postcard, decode_postcard),
            (ValueKind::Array, encode_array, decode_array),
            (ValueKind::Table, encode_table, decode_table),
            (ValueKind::Bytes, encode_blob, decode_blob),
        ];
        for (kind, encode, decode) in builtins {
            registry.register(kind.name(), kind, Codec { encode, decode });
        }
        registry
    }
}

impl CodecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` under `tag` and use it for values of `kind`.
    pub fn register(&mut self, tag: impl Into<String>, kind: ValueKind, codec: Codec) {
        let tag = tag.into();
        self.by_kind.insert(kind, tag.clone());
        self.codecs.insert(tag, codec);
    }

    /// Tag used for values of `kind`. Kinds without an entry fall back to
    /// the blob tag.
    #[must_use]
    pub fn tag_for(&self, kind: ValueKind) -> &str {
        self.by_kind
            .get(&kind)
            .map_or(ValueKind::Bytes.name(), String::as_str)
    }

    /// Encode to `(tag, bytes)`.
    pub fn encode_bytes(&self, value: &Value) -> Result<(String, Vec<u8>), CellError> {
        let tag = self.tag_for(value.kind());
        let codec = self.codec(tag)?;
        Ok((tag.to_string(), (codec.encode)(value)?))
    }

    pub fn decode_bytes(&self, tag: &str, bytes: &[u8]) -> Result<Value, CellError> {
        (self.codec(tag)?.decode)(bytes)
    }

    /// Wrap a value as `{_t, _b}`.
    pub fn encode(&self, value: &Value) -> Result<Value, CellError> {
        let (tag, bytes) = self.encode_bytes(value)?;
        Ok(Value::Map(BTreeMap::from([
            (TAG_FIELD.to_string(), Value::Text(tag)),
            (BYTES_FIELD.to_string(), Value::Bytes(bytes)),
        ])))
    }

    /// Unwrap a `{_t, _b}` payload.
    pub fn decode(&self, encoded: &Value) -> Result<Value, CellError> {
        let (tag, bytes) = split(encoded)?;
        self.decode_bytes(tag, bytes)
    }

    fn codec(&self, tag: &str) -> Result<&Codec, CellError> {
        self.codecs
            .get(tag)
            .ok_or_else(|| CellError::SerializationError(format!("unknown codec tag '{tag}'")))
    }
}

/// True if `value` has the `{_t, ...}` shape of an encoded payload.
#[must_use]
pub fn is_tagged(value: &Value) -> bool {
    value
        .as_map()
        .is_some_and(|m| matches!(m.get(TAG_FIELD), Some(Value::Text(_))))
}

fn split(encoded: &Value) -> Result<(&str, &[u8]), CellError> {
    let map = encoded.as_map().ok_or_else(|| {
        CellError::SerializationError(format!("not an encoded payload: {encoded}"))
    })?;
    let tag = map
        .get(TAG_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| CellError::SerializationError("payload without tag".to_string()))?;
    match map.get(BYTES_FIELD) {
        Some(Value::Bytes(bytes)) => Ok((tag, bytes)),
        _ => Err(CellError::SerializationError(format!(
            "payload '{tag}' has no inline bytes"
        ))),
    }
}

// =============================================================================
// BUILT-IN CODECS
// =============================================================================

fn mismatch(expected: ValueKind, value: &Value) -> CellError {
    CellError::SerializationError(format!(
        "{} codec cannot encode {}",
        expected.name(),
        value.kind().name()
    ))
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], CellError> {
    bytes.try_into().map_err(|_| {
        CellError::DeserializationError(format!("{what} needs {N} bytes, got {}", bytes.len()))
    })
}

fn encode_bool(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Bool(b) => Ok(vec![u8::from(*b)]),
        other => Err(mismatch(ValueKind::Bool, other)),
    }
}

fn decode_bool(bytes: &[u8]) -> Result<Value, CellError> {
    let [b] = fixed::<1>(bytes, "bool")?;
    Ok(Value::Bool(b != 0))
}

fn encode_int(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Int(i) => Ok(i.to_le_bytes().to_vec()),
        other => Err(mismatch(ValueKind::Int, other)),
    }
}

fn decode_int(bytes: &[u8]) -> Result<Value, CellError> {
    Ok(Value::Int(i64::from_le_bytes(fixed(bytes, "int")?)))
}

fn encode_float(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Float(x) => Ok(x.to_le_bytes().to_vec()),
        other => Err(mismatch(ValueKind::Float, other)),
    }
}

fn decode_float(bytes: &[u8]) -> Result<Value, CellError> {
    Ok(Value::Float(f64::from_le_bytes(fixed(bytes, "float")?)))
}

fn encode_text(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Text(s) => Ok(s.as_bytes().to_vec()),
        other => Err(mismatch(ValueKind::Text, other)),
    }
}

fn decode_text(bytes: &[u8]) -> Result<Value, CellError> {
    String::from_utf8(bytes.to_vec())
        .map(Value::Text)
        .map_err(|e| CellError::DeserializationError(e.to_string()))
}

fn encode_time(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Time(t) => Ok(t.as_micros().to_le_bytes().to_vec()),
        other => Err(mismatch(ValueKind::Time, other)),
    }
}

fn decode_time(bytes: &[u8]) -> Result<Value, CellError> {
    Ok(Value::Time(Timestamp(i64::from_le_bytes(fixed(
        bytes, "time",
    )?))))
}

fn encode_postcard(value: &Value) -> Result<Vec<u8>, CellError> {
    postcard::to_stdvec(value).map_err(|e| CellError::SerializationError(e.to_string()))
}

fn decode_postcard(bytes: &[u8]) -> Result<Value, CellError> {
    postcard::from_bytes(bytes).map_err(|e| CellError::DeserializationError(e.to_string()))
}

fn encode_array(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Array(array) => {
            postcard::to_stdvec(array).map_err(|e| CellError::SerializationError(e.to_string()))
        }
        other => Err(mismatch(ValueKind::Array, other)),
    }
}

fn decode_array(bytes: &[u8]) -> Result<Value, CellError> {
    postcard::from_bytes::<NumArray>(bytes)
        .map(Value::Array)
        .map_err(|e| CellError::DeserializationError(e.to_string()))
}

fn encode_table(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Table(table) => {
            postcard::to_stdvec(table).map_err(|e| CellError::SerializationError(e.to_string()))
        }
        other => Err(mismatch(ValueKind::Table, other)),
    }
}

fn decode_table(bytes: &[u8]) -> Result<Value, CellError> {
    postcard::from_bytes::<Table>(bytes)
        .map(Value::Table)
        .map_err(|e| CellError::DeserializationError(e.to_string()))
}

fn encode_blob(value: &Value) -> Result<Vec<u8>, CellError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        other => Err(mismatch(ValueKind::Bytes, other)),
    }
}

fn decode_blob(bytes: &[u8]) -> Result<Value, CellError> {
    Ok(Value::Bytes(bytes.to_vec()))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_kind_round_trips() {
        let registry = CodecRegistry::new();
        let mut table = Table::new(vec!["a".into(), "b".into()]);
        table
            .push_row(vec![Value::Int(1), Value::from("x")])
            .expect("row");
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int(-3),
            Value::Float(0.25),
            Value::from("text"),
            Value::Time(Timestamp(99)),
            Value::List(vec![Value::Int(1), Value::from("a")]),
            Value::Map(BTreeMap::from([("k".to_string(), Value::Int(1))])),
            Value::Array(NumArray::from_vec(vec![1.0, 2.0, 3.0])),
            Value::Table(table),
            Value::Bytes(vec![0, 1, 2]),
        ];

        for value in values {
            let encoded = registry.encode(&value).expect("encode");
            assert!(is_tagged(&encoded));
            assert_eq!(registry.decode(&encoded).expect("decode"), value);
        }
    }

    #[test]
    fn tag_names_follow_kinds() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.tag_for(ValueKind::Array), "array");
        assert_eq!(registry.tag_for(ValueKind::Bytes), "blob");
    }

    #[test]
    fn unknown_tag_fails() {
        let registry = CodecRegistry::new();
        let encoded = Value::Map(BTreeMap::from([
            (TAG_FIELD.to_string(), Value::from("parquet")),
            (BYTES_FIELD.to_string(), Value::Bytes(Vec::new())),
        ]));
        assert!(matches!(
            registry.decode(&encoded),
            Err(CellError::SerializationError(_))
        ));
    }

    #[test]
    fn custom_codec_overrides_a_kind() {
        fn upper(value: &Value) -> Result<Vec<u8>, CellError> {
            Ok(value.as_str().unwrap_or_default().to_uppercase().into_bytes())
        }
        let mut registry = CodecRegistry::new();
        registry.register(
            "upper",
            ValueKind::Text,
            Codec {
                encode: upper,
                decode: decode_text,
            },
        );

        let encoded = registry.encode(&Value::from("abc")).expect("encode");
        assert_eq!(
            encoded.as_map().and_then(|m| m.get(TAG_FIELD)),
            Some(&Value::from("upper"))
        );
        assert_eq!(registry.decode(&encoded).expect("decode"), Value::from("ABC"));
    }

    #[test]
    fn truncated_int_is_rejected() {
        let registry = CodecRegistry::new();
        assert!(registry.decode_bytes("int", &[1, 2]).is_err());
    }
}
