//! # Document Format
//!
//! Binary serialization of persisted documents.
//!
//! Format: Header (5 bytes) + postcard-serialized document.
//! - 4 bytes: Magic ("CELL")
//! - 1 byte: Version
//!
//! The backend id (`_id`) is not part of the payload: it is the table key
//! and is re-attached by the store on read.
//!
//! Size and header are validated before the payload is deserialized.

use crate::primitives::{self, ID_FIELD};
use crate::storage::Document;
use crate::CellError;

/// Upper bound on one encoded document. Large payloads belong in a blob
/// store, not inline.
pub const MAX_DOCUMENT_SIZE: usize = 64 * 1024 * 1024;

const HEADER_SIZE: usize = 5;

// =============================================================================
// HEADER
// =============================================================================

/// The header preceding every stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl DocumentHeader {
    /// Header for the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), CellError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(CellError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(CellError::DeserializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CellError> {
        let Some(header) = bytes.get(..HEADER_SIZE) else {
            return Err(CellError::DeserializationError(
                "Header too short".to_string(),
            ));
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        Ok(Self {
            magic,
            version: header[4],
        })
    }
}

impl Default for DocumentHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION
// =============================================================================

/// Serialize a document (without its `_id`) to header + payload bytes.
pub fn document_to_bytes(document: &Document) -> Result<Vec<u8>, CellError> {
    let payload = if document.contains_key(ID_FIELD) {
        let mut stripped = document.clone();
        stripped.remove(ID_FIELD);
        postcard::to_stdvec(&stripped)
    } else {
        postcard::to_stdvec(document)
    }
    .map_err(|e| CellError::SerializationError(e.to_string()))?;

    if payload.len() > MAX_DOCUMENT_SIZE {
        return Err(CellError::SerializationError(format!(
            "Document size {} bytes exceeds maximum allowed {} bytes",
            payload.len(),
            MAX_DOCUMENT_SIZE
        )));
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&DocumentHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Deserialize bytes produced by [`document_to_bytes`].
pub fn document_from_bytes(bytes: &[u8]) -> Result<Document, CellError> {
    if bytes.len() > MAX_DOCUMENT_SIZE.saturating_add(HEADER_SIZE) {
        return Err(CellError::DeserializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_DOCUMENT_SIZE
        )));
    }

    DocumentHeader::from_bytes(bytes)?.validate()?;

    postcard::from_bytes(&bytes[HEADER_SIZE..]).map_err(|e| {
        CellError::DeserializationError(format!("Failed to deserialize document: {e}"))
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NumArray, Timestamp, Value};
    use std::collections::BTreeMap;

    fn sample() -> Document {
        Document::from([
            ("key".to_string(), Value::from("a")),
            ("deleted".to_string(), Value::Time(Timestamp(5))),
            (
                "data".to_string(),
                Value::Map(BTreeMap::from([(
                    "arr".to_string(),
                    Value::Array(NumArray::from_vec(vec![1.0, 2.0])),
                )])),
            ),
        ])
    }

    #[test]
    fn header_roundtrip() {
        let bytes = DocumentHeader::new().to_bytes();
        let restored = DocumentHeader::from_bytes(&bytes).expect("parse header");
        assert_eq!(restored, DocumentHeader::new());
    }

    #[test]
    fn bytes_roundtrip_bit_exact() {
        let bytes1 = document_to_bytes(&sample()).expect("first serialize");
        let restored = document_from_bytes(&bytes1).expect("deserialize");
        let bytes2 = document_to_bytes(&restored).expect("second serialize");
        assert_eq!(restored, sample());
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn id_is_not_serialized() {
        let mut with_id = sample();
        with_id.insert(ID_FIELD.to_string(), Value::Int(7));
        let restored =
            document_from_bytes(&document_to_bytes(&with_id).expect("serialize")).expect("parse");
        assert!(!restored.contains_key(ID_FIELD));
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut bytes = vec![0u8; 10];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert!(document_from_bytes(&bytes).is_err());
        assert!(document_from_bytes(b"CE").is_err());
    }
}
