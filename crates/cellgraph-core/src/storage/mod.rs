//! # Document Storage
//!
//! The backend seam of the persistence adapter. A `DocumentStore` holds
//! schemaless documents grouped in collections and answers `Filter`
//! queries; versioning lives one layer up in `Versioned`.
//!
//! Backends:
//! - `MemoryStore`: volatile, for tests and scratch contexts
//! - `RedbStore`: disk-backed, ACID, one redb table per collection
//!
//! Every document carries its backend id in `_id` (`Value::Int`). `find`
//! returns documents in ascending id order.

mod blob;
mod redb_store;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore, PathTemplate};
pub use redb_store::RedbStore;

use crate::primitives::{DELETED_FIELD, ID_FIELD};
use crate::query::Filter;
use crate::{CellError, Timestamp, Value};
use std::collections::BTreeMap;

/// A schemaless persisted record.
pub type Document = BTreeMap<String, Value>;

/// Backend id of a document, if it carries one.
#[must_use]
pub fn document_id(document: &Document) -> Option<u64> {
    document
        .get(ID_FIELD)
        .and_then(Value::as_int)
        .and_then(|id| u64::try_from(id).ok())
}

/// Keep only `fields` (and `_id`).
#[must_use]
pub fn project(document: Document, fields: Option<&[&str]>) -> Document {
    match fields {
        None => document,
        Some(fields) => document
            .into_iter()
            .filter(|(k, _)| k == ID_FIELD || fields.contains(&k.as_str()))
            .collect(),
    }
}

/// Minimal document-database surface the versioning layer needs.
pub trait DocumentStore: Send + Sync {
    /// Every document in `collection` matching `filter`, ascending by id.
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Vec<Document>, CellError>;

    /// Insert a new document and return its backend id. Any `_id` in
    /// `document` is ignored.
    fn insert_one(&mut self, collection: &str, document: Document) -> Result<u64, CellError>;

    /// Merge `patch` into the first matching document. Returns whether a
    /// document matched.
    fn update_one(
        &mut self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> Result<bool, CellError>;

    /// Soft-delete: stamp `deleted = at` on every matching document.
    /// Returns the number of documents marked.
    fn delete_or_mark(
        &mut self,
        collection: &str,
        filter: &Filter,
        at: Timestamp,
    ) -> Result<usize, CellError>;

    /// Insert `archived` as a new document and merge `patch` into the
    /// record `live_id`. Returns the archived copy's id.
    ///
    /// Fails with `StorageError` when `live_id` does not exist. The default
    /// issues two calls, so a failure between them leaves the archived copy
    /// without its replacement; backends with transactions apply both
    /// writes at once.
    fn supersede(
        &mut self,
        collection: &str,
        live_id: u64,
        archived: Document,
        patch: Document,
    ) -> Result<u64, CellError> {
        let archived_id = self.insert_one(collection, archived)?;
        let live = Filter::field(ID_FIELD).eq(Value::Int(live_id as i64));
        if !self.update_one(collection, &live, patch)? {
            return Err(missing_record(collection, live_id));
        }
        Ok(archived_id)
    }
}

pub(crate) fn missing_record(collection: &str, id: u64) -> CellError {
    CellError::StorageError(format!("no record {id} in '{collection}'"))
}

impl<S: DocumentStore + ?Sized> DocumentStore for Box<S> {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Vec<Document>, CellError> {
        (**self).find(collection, filter, projection)
    }

    fn insert_one(&mut self, collection: &str, document: Document) -> Result<u64, CellError> {
        (**self).insert_one(collection, document)
    }

    fn update_one(
        &mut self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> Result<bool, CellError> {
        (**self).update_one(collection, filter, patch)
    }

    fn delete_or_mark(
        &mut self,
        collection: &str,
        filter: &Filter,
        at: Timestamp,
    ) -> Result<usize, CellError> {
        (**self).delete_or_mark(collection, filter, at)
    }

    fn supersede(
        &mut self,
        collection: &str,
        live_id: u64,
        archived: Document,
        patch: Document,
    ) -> Result<u64, CellError> {
        (**self).supersede(collection, live_id, archived, patch)
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Volatile document store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: BTreeMap<String, BTreeMap<u64, Document>>,
    next_id: u64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents (live and superseded) in `collection`.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.values().all(BTreeMap::is_empty)
    }
}

impl DocumentStore for MemoryStore {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Vec<Document>, CellError> {
        let Some(documents) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(documents
            .values()
            .filter(|doc| filter.matches(doc))
            .map(|doc| project(doc.clone(), projection))
            .collect())
    }

    fn insert_one(&mut self, collection: &str, mut document: Document) -> Result<u64, CellError> {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        document.insert(ID_FIELD.to_string(), Value::Int(id as i64));
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, document);
        Ok(id)
    }

    fn update_one(
        &mut self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> Result<bool, CellError> {
        let Some(documents) = self.collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(document) = documents.values_mut().find(|doc| filter.matches(doc)) else {
            return Ok(false);
        };
        for (key, value) in patch {
            if key != ID_FIELD {
                document.insert(key, value);
            }
        }
        Ok(true)
    }

    fn delete_or_mark(
        &mut self,
        collection: &str,
        filter: &Filter,
        at: Timestamp,
    ) -> Result<usize, CellError> {
        let Some(documents) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut marked = 0;
        for document in documents.values_mut().filter(|doc| filter.matches(doc)) {
            document.insert(DELETED_FIELD.to_string(), Value::Time(at));
            marked += 1;
        }
        Ok(marked)
    }
}

// =============================================================================
// TESTS
// =============================================================================
