//! Encodings and the typed value union.
//!
//! Artefact payloads are raw bytes on the wire. The declared encoding of a
//! funsie slot says how those bytes map to a [`Value`]: `blob` is the
//! identity on bytes, `json` is UTF-8 JSON. Codec failures become data
//! errors, not engine errors, so they propagate through the graph like any
//! other failed output.

use crate::errors::{Error, ErrorKind, Lifted};
use crate::hashes::ContentHash;

/// How artefact bytes map to structured values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Encoding {
    /// Raw bytes.
    Blob,
    /// UTF-8 JSON.
    Json,
}

impl Encoding {
    /// Stable name used in hub records and hash strings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Blob => "blob",
            Encoding::Json => "json",
        }
    }

    /// Parse a stored encoding name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blob" => Some(Encoding::Blob),
            "json" => Some(Encoding::Json),
            _ => None,
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded artefact value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Raw bytes (`blob`).
    Bytes(Vec<u8>),
    /// Structured value (`json`).
    Json(serde_json::Value),
}

impl Value {
    /// The encoding this value naturally serializes under.
    #[must_use]
    pub fn natural_encoding(&self) -> Encoding {
        match self {
            Value::Bytes(_) => Encoding::Blob,
            Value::Json(_) => Encoding::Json,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(v: &[u8; N]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        // Strings are data, not structure.
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Json(serde_json::Value::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Json(serde_json::Value::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Json(serde_json::Value::from(v))
    }
}

/// Deserialize bytes according to an encoding.
///
/// `carry` marks the operation on whose behalf the decode happens, so a
/// fresh decode error can name its source.
#[must_use]
pub fn decode(enc: Encoding, data: &[u8], carry: Option<&ContentHash>) -> Lifted<Value> {
    match enc {
        Encoding::Blob => Ok(Value::Bytes(data.to_vec())),
        Encoding::Json => match serde_json::from_slice(data) {
            Ok(v) => Ok(Value::Json(v)),
            Err(e) => {
                let mut err =
                    Error::new(ErrorKind::JsonDecodingError).with_details(e.to_string());
                if let Some(source) = carry {
                    err = err.with_source(source.clone());
                }
                Err(err)
            }
        },
    }
}

/// Serialize a value according to an encoding.
#[must_use]
pub fn encode(enc: Encoding, value: &Value) -> Lifted<Vec<u8>> {
    match (enc, value) {
        (Encoding::Blob, Value::Bytes(b)) => Ok(b.clone()),
        (Encoding::Json, Value::Json(v)) => serde_json::to_vec(v)
            .map_err(|e| Error::new(ErrorKind::JsonEncodingError).with_details(e.to_string())),
        (Encoding::Blob, Value::Json(_)) | (Encoding::Json, Value::Bytes(_)) => {
            Err(Error::new(ErrorKind::WrongType).with_details(format!(
                "value of kind {} under declared encoding {}",
                value.natural_encoding(),
                enc
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_is_identity() {
        let v = decode(Encoding::Blob, b"\x00\xffraw", None).unwrap();
        assert_eq!(v, Value::Bytes(b"\x00\xffraw".to_vec()));
        assert_eq!(encode(Encoding::Blob, &v).unwrap(), b"\x00\xffraw");
    }

    #[test]
    fn json_roundtrip() {
        let v = decode(Encoding::Json, b"{\"a\": [1, 2]}", None).unwrap();
        let bytes = encode(Encoding::Json, &v).unwrap();
        assert_eq!(decode(Encoding::Json, &bytes, None).unwrap(), v);
    }

    #[test]
    fn bad_json_is_a_data_error() {
        let source =
            ContentHash::from_hex("aaaa000000000000000000000000000000000000").unwrap();
        let err = decode(Encoding::Json, b"not json", Some(&source)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::JsonDecodingError);
        assert_eq!(err.source, Some(source));
    }

    #[test]
    fn kind_mismatch_is_wrong_type() {
        let err = encode(Encoding::Blob, &Value::Json(serde_json::json!(3))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WrongType);
        let err = encode(Encoding::Json, &Value::Bytes(vec![1])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WrongType);
    }

    #[test]
    fn natural_encodings() {
        assert_eq!(Value::from("text").natural_encoding(), Encoding::Blob);
        assert_eq!(Value::from(3i64).natural_encoding(), Encoding::Json);
    }
}
