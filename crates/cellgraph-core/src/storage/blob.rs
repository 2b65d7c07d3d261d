//! # Blob Storage
//!
//! Large array and table payloads are written outside the document store.
//! The document keeps a reference (`path`, `len`, `blake3`) and the bytes
//! are verified against it on read.

use crate::{CellError, Timestamp, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

/// Where offloaded payloads live.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path`, returning the locator to read them back.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<String, CellError>;

    /// Read the bytes behind a locator returned by `write`.
    fn read(&self, locator: &str) -> Result<Vec<u8>, CellError>;
}

// =============================================================================
// PATH TEMPLATE
// =============================================================================

/// Blob path pattern resolved against the record being written.
///
/// Placeholders: `{collection}`, `{keys}` (one `field=value` segment per
/// primary-key field), `{updated}` (write time in microseconds) and
/// `{output}`. Versions of one record land in distinct paths because
/// `{updated}` differs between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub const DEFAULT: &'static str = "{collection}/{keys}/{updated}/{output}.bin";

    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    #[must_use]
    pub fn resolve(
        &self,
        collection: &str,
        keys: &[(String, Value)],
        updated: Timestamp,
        output: &str,
    ) -> String {
        let keys = keys
            .iter()
            .map(|(k, v)| format!("{}={}", sanitize(k), sanitize(&v.to_string())))
            .collect::<Vec<_>>()
            .join("/");
        self.0
            .replace("{collection}", &sanitize(collection))
            .replace("{keys}", &keys)
            .replace("{updated}", &updated.as_micros().to_string())
            .replace("{output}", &sanitize(output))
    }
}

impl Default for PathTemplate {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

/// Keep one path segment from escaping its directory.
fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_") + "_"
    } else {
        cleaned
    }
}

// =============================================================================
// FILESYSTEM
// =============================================================================

/// Blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, relative: &str) -> Result<PathBuf, CellError> {
        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(CellError::IoError(format!(
                "blob path escapes store root: {}",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FsBlobStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<String, CellError> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| CellError::IoError(e.to_string()))?;
        }
        fs::write(&full, bytes).map_err(|e| CellError::IoError(e.to_string()))?;
        Ok(path.to_string())
    }

    fn read(&self, locator: &str) -> Result<Vec<u8>, CellError> {
        let full = self.full_path(locator)?;
        fs::read(&full).map_err(|e| CellError::IoError(format!("{}: {e}", full.display())))
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// Volatile blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().map_or(0, |blobs| blobs.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<String, CellError> {
        self.blobs
            .write()
            .map_err(|e| CellError::IoError(e.to_string()))?
            .insert(path.to_string(), bytes.to_vec());
        Ok(path.to_string())
    }

    fn read(&self, locator: &str) -> Result<Vec<u8>, CellError> {
        self.blobs
            .read()
            .map_err(|e| CellError::IoError(e.to_string()))?
            .get(locator)
            .cloned()
            .ok_or_else(|| CellError::IoError(format!("no blob at {locator}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_resolves_placeholders() {
        let template = PathTemplate::default();
        let keys = vec![
            ("key".to_string(), Value::from("a/b")),
            ("n".to_string(), Value::Int(2)),
        ];
        let path = template.resolve("series", &keys, Timestamp(42), "data");
        assert_eq!(path, "series/key=a_b/n=2/42/data.bin");
    }

    #[test]
    fn dot_segments_are_neutralized() {
        assert_eq!(sanitize(".."), "___");
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize("a.b"), "a.b");
    }

    #[test]
    fn fs_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let locator = store.write("c/k=1/data.bin", b"payload").expect("write");
        assert_eq!(store.read(&locator).expect("read"), b"payload");
    }

    #[test]
    fn fs_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        assert!(store.write("../outside.bin", b"x").is_err());
        assert!(store.read("/etc/passwd").is_err());
    }

    #[test]
    fn memory_store_reports_missing_blobs() {
        let store = MemoryBlobStore::new();
        store.write("a", b"1").expect("write");
        assert_eq!(store.len(), 1);
        assert!(store.read("b").is_err());
    }
}
