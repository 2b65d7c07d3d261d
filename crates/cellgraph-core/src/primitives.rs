//! # Primitives
//!
//! Fixed constants shared by cells, the persistence adapter and the
//! document codecs. These are compiled in and immutable at runtime.

/// Output key used when a cell declares no output keys of its own.
pub const DEFAULT_OUTPUT_KEY: &str = "data";

// =============================================================================
// RESERVED DOCUMENT FIELDS
// =============================================================================

/// Backend-assigned record identifier, preserved across supersession.
pub const ID_FIELD: &str = "_id";

/// Absent on live records, the supersession timestamp otherwise.
pub const DELETED_FIELD: &str = "deleted";

/// Time the record content was computed.
pub const UPDATED_FIELD: &str = "_updated";

/// Name of the function that produced the outputs.
pub const FUNCTION_FIELD: &str = "_fn";

/// Declared primary-key field names.
pub const PRIMARY_KEY_FIELD: &str = "_pk";

/// Declared output keys.
pub const OUTPUTS_FIELD: &str = "_outputs";

/// Encoded inputs, including references to upstream cells.
pub const INPUTS_FIELD: &str = "_inputs";

/// Caller-defined fields that are not part of the primary key.
pub const EXTRA_FIELD: &str = "_extra";

/// Marker key for a reference to another cell's address inside `_inputs`.
pub const REF_MARKER: &str = "_ref";

// =============================================================================
// BINARY FORMAT
// =============================================================================

/// Magic bytes prefixed to every document stored by the redb backend.
pub const MAGIC_BYTES: &[u8; 4] = b"CELL";

/// Current document serialization format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

/// Default size above which array and table payloads are offloaded to the
/// blob store (when one is configured).
pub const DEFAULT_BLOB_THRESHOLD: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(MAGIC_BYTES, b"CELL");
    }

    #[test]
    fn reserved_fields_are_distinct() {
        let fields = [
            ID_FIELD,
            DELETED_FIELD,
            UPDATED_FIELD,
            FUNCTION_FIELD,
            PRIMARY_KEY_FIELD,
            OUTPUTS_FIELD,
            INPUTS_FIELD,
            EXTRA_FIELD,
        ];
        let unique: std::collections::BTreeSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
    }
}
