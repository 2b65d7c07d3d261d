//! # redb-backed Document Storage
//!
//! A disk-backed document store using the redb embedded database.
//!
//! - One table per collection: `backend id (u64) -> document bytes`
//! - Document bytes are the `CELL` header followed by postcard
//! - A metadata table keeps the next id per collection
//!
//! Every mutating call is its own ACID write transaction. `supersede`
//! archives the old version and rewrites the live record in one
//! transaction, so a crash never leaves a supersession half-applied.
//! Readers are MVCC snapshots and never block the writer.

use super::{Document, DocumentStore, missing_record, project};
use crate::formats::{document_from_bytes, document_to_bytes};
use crate::primitives::{DELETED_FIELD, ID_FIELD};
use crate::query::Filter;
use crate::{CellError, Timestamp, Value};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use std::path::Path;

/// Table for metadata: collection name -> next backend id.
const NEXT_IDS: TableDefinition<&str, u64> = TableDefinition::new("cellgraph_next_ids");

fn table_name(collection: &str) -> String {
    format!("docs/{collection}")
}

fn io_error(e: impl std::fmt::Display) -> CellError {
    CellError::StorageError(e.to_string())
}

/// A disk-backed document store using redb.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a document database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CellError> {
        let db = Database::create(path.as_ref()).map_err(io_error)?;

        let write_txn = db.begin_write().map_err(io_error)?;
        let _ = write_txn.open_table(NEXT_IDS).map_err(io_error)?;
        write_txn.commit().map_err(io_error)?;

        Ok(Self { db })
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<bool, CellError> {
        self.db.compact().map_err(io_error)
    }

    /// Read every matching `(id, document)` pair of a collection.
    fn scan(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, CellError> {
        let name = table_name(collection);
        let definition: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);

        let read_txn = self.db.begin_read().map_err(io_error)?;
        let table = match read_txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut documents = Vec::new();
        for entry in table.iter().map_err(io_error)? {
            let (key, value) = entry.map_err(io_error)?;
            let document = decode(key.value(), value.value())?;
            if filter.matches(&document) {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    /// Apply `edit` to matching documents inside one write transaction.
    ///
    /// `limit` caps how many documents are rewritten. Returns the count.
    fn rewrite(
        &mut self,
        collection: &str,
        filter: &Filter,
        limit: usize,
        edit: impl Fn(&mut Document),
    ) -> Result<usize, CellError> {
        let name = table_name(collection);
        let definition: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);

        let write_txn = self.db.begin_write().map_err(io_error)?;
        let count = {
            let mut table = write_txn.open_table(definition).map_err(io_error)?;

            let mut matched = Vec::new();
            for entry in table.iter().map_err(io_error)? {
                if matched.len() >= limit {
                    break;
                }
                let (key, value) = entry.map_err(io_error)?;
                let document = decode(key.value(), value.value())?;
                if filter.matches(&document) {
                    matched.push((key.value(), document));
                }
            }

            for (id, document) in &mut matched {
                edit(document);
                let bytes = document_to_bytes(document)?;
                table.insert(*id, bytes.as_slice()).map_err(io_error)?;
            }
            matched.len()
        };
        write_txn.commit().map_err(io_error)?;
        Ok(count)
    }
}

fn decode(id: u64, bytes: &[u8]) -> Result<Document, CellError> {
    let mut document = document_from_bytes(bytes)?;
    document.insert(ID_FIELD.to_string(), Value::Int(id as i64));
    Ok(document)
}

impl DocumentStore for RedbStore {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Vec<Document>, CellError> {
        Ok(self
            .scan(collection, filter)?
            .into_iter()
            .map(|doc| project(doc, projection))
            .collect())
    }

    fn insert_one(&mut self, collection: &str, document: Document) -> Result<u64, CellError> {
        let name = table_name(collection);
        let definition: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let bytes = document_to_bytes(&document)?;

        let write_txn = self.db.begin_write().map_err(io_error)?;
        let id = {
            let mut ids = write_txn.open_table(NEXT_IDS).map_err(io_error)?;
            let id = ids
                .get(collection)
                .map_err(io_error)?
                .map(|v| v.value())
                .unwrap_or(0);
            ids.insert(collection, id.saturating_add(1))
                .map_err(io_error)?;

            let mut table = write_txn.open_table(definition).map_err(io_error)?;
            table.insert(id, bytes.as_slice()).map_err(io_error)?;
            id
        };
        write_txn.commit().map_err(io_error)?;
        Ok(id)
    }

    fn supersede(
        &mut self,
        collection: &str,
        live_id: u64,
        archived: Document,
        patch: Document,
    ) -> Result<u64, CellError> {
        let name = table_name(collection);
        let definition: TableDefinition<u64, &[u8]> = TableDefinition::new(&name);
        let archived_bytes = document_to_bytes(&archived)?;

        // Dropping the transaction without commit aborts both writes.
        let write_txn = self.db.begin_write().map_err(io_error)?;
        let archived_id = {
            let mut table = write_txn.open_table(definition).map_err(io_error)?;
            let live = match table.get(live_id).map_err(io_error)? {
                Some(bytes) => Some(decode(live_id, bytes.value())?),
                None => None,
            };
            let Some(mut live) = live else {
                return Err(missing_record(collection, live_id));
            };
            for (key, value) in patch {
                if key != ID_FIELD {
                    live.insert(key, value);
                }
            }
            let live_bytes = document_to_bytes(&live)?;

            let mut ids = write_txn.open_table(NEXT_IDS).map_err(io_error)?;
            let archived_id = ids
                .get(collection)
                .map_err(io_error)?
                .map(|v| v.value())
                .unwrap_or(0);
            ids.insert(collection, archived_id.saturating_add(1))
                .map_err(io_error)?;

            table
                .insert(archived_id, archived_bytes.as_slice())
                .map_err(io_error)?;
            table.insert(live_id, live_bytes.as_slice()).map_err(io_error)?;
            archived_id
        };
        write_txn.commit().map_err(io_error)?;
        Ok(archived_id)
    }

    fn update_one(
        &mut self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> Result<bool, CellError> {
        let updated = self.rewrite(collection, filter, 1, |document| {
            for (key, value) in &patch {
                if key != ID_FIELD {
                    document.insert(key.clone(), value.clone());
                }
            }
        })?;
        Ok(updated > 0)
    }

    fn delete_or_mark(
        &mut self,
        collection: &str,
        filter: &Filter,
        at: Timestamp,
    ) -> Result<usize, CellError> {
        self.rewrite(collection, filter, usize::MAX, |document| {
            document.insert(DELETED_FIELD.to_string(), Value::Time(at));
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::document_id;

    fn doc(key: &str, n: i64) -> Document {
        Document::from([
            ("key".to_string(), Value::from(key)),
            ("n".to_string(), Value::Int(n)),
        ])
    }

    #[test]
    fn insert_and_find() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RedbStore::open(dir.path().join("cells.redb")).expect("open");

        let a = store.insert_one("adds", doc("a", 1)).expect("insert");
        let b = store.insert_one("adds", doc("b", 2)).expect("insert");
        let other = store.insert_one("muls", doc("a", 3)).expect("insert");
        assert_eq!((a, b, other), (0, 1, 0));

        let found = store
            .find("adds", &Filter::field("key").eq("b"), None)
            .expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(document_id(&found[0]), Some(1));
        assert_eq!(found[0].get("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn missing_collection_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RedbStore::open(dir.path().join("cells.redb")).expect("open");
        assert!(store
            .find("nothing", &Filter::Everything, None)
            .expect("find")
            .is_empty());
    }

    #[test]
    fn update_and_mark_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cells.redb");
        {
            let mut store = RedbStore::open(&path).expect("open");
            store.insert_one("adds", doc("a", 1)).expect("insert");
            store.insert_one("adds", doc("b", 1)).expect("insert");

            let patch = Document::from([("n".to_string(), Value::Int(10))]);
            assert!(store
                .update_one("adds", &Filter::field("key").eq("a"), patch)
                .expect("update"));
            let marked = store
                .delete_or_mark("adds", &Filter::field("key").eq("b"), Timestamp(7))
                .expect("mark");
            assert_eq!(marked, 1);
        }

        let store = RedbStore::open(&path).expect("reopen");
        let a = store
            .find("adds", &Filter::field("key").eq("a"), None)
            .expect("find");
        assert_eq!(a[0].get("n"), Some(&Value::Int(10)));

        let live = store
            .find("adds", &Filter::field(DELETED_FIELD).missing(), Some(&["key"]))
            .expect("find");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].get("key"), Some(&Value::from("a")));
        assert!(!live[0].contains_key("n"));
    }

    #[test]
    fn supersede_archives_and_rewrites_together() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cells.redb");
        {
            let mut store = RedbStore::open(&path).expect("open");
            let live = store.insert_one("adds", doc("a", 1)).expect("insert");
            let mut archived = doc("a", 1);
            archived.insert(DELETED_FIELD.to_string(), Value::Time(Timestamp(9)));

            let archived_id = store
                .supersede("adds", live, archived, doc("a", 2))
                .expect("supersede");
            assert_eq!(archived_id, 1);
        }

        let store = RedbStore::open(&path).expect("reopen");
        let all = store.find("adds", &Filter::Everything, None).expect("find");
        assert_eq!(all.len(), 2);
        let live = store
            .find("adds", &Filter::field(DELETED_FIELD).missing(), None)
            .expect("live");
        assert_eq!(live.len(), 1);
        assert_eq!(document_id(&live[0]), Some(0));
        assert_eq!(live[0].get("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn failed_supersede_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RedbStore::open(dir.path().join("cells.redb")).expect("open");
        store.insert_one("adds", doc("a", 1)).expect("insert");

        let err = store
            .supersede("adds", 42, doc("a", 1), doc("a", 2))
            .expect_err("no record 42");
        assert!(matches!(err, CellError::StorageError(_)));

        let all = store.find("adds", &Filter::Everything, None).expect("find");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("n"), Some(&Value::Int(1)));
        assert_eq!(store.insert_one("adds", doc("b", 1)).expect("insert"), 1);
    }

    #[test]
    fn ids_continue_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cells.redb");
        {
            let mut store = RedbStore::open(&path).expect("open");
            store.insert_one("adds", doc("a", 1)).expect("insert");
        }
        let mut store = RedbStore::open(&path).expect("reopen");
        assert_eq!(store.insert_one("adds", doc("b", 1)).expect("insert"), 1);
    }
}
