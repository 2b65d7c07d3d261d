//! # Formats
//!
//! Byte-level encodings: the document format used by disk backends and the
//! tagged payload codecs used inside documents.

pub mod codec;
pub mod persistence;

pub use codec::{Codec, CodecRegistry, is_tagged};
pub use persistence::{DocumentHeader, document_from_bytes, document_to_bytes};
