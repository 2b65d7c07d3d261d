//! # Versioned Persistence
//!
//! Append-only versioning on top of any `DocumentStore`.
//!
//! ## Invariants
//!
//! - At most one live record (no `deleted` field) per primary-key value set
//!   per collection
//! - Updating a live record first inserts a superseded copy of its prior
//!   content (`deleted = now`, new backend id), then rewrites the live
//!   document in place (backend id kept)
//! - A version is visible at instant `t` when `_updated <= t` and its
//!   `deleted` is absent or later than `t`; the intervals of one record's
//!   versions never overlap
//!
//! Duplicate live records (left behind by concurrent writers) are healed on
//! the next save or load when `self_heal` is on: all but the newest by
//! backend id are superseded.

use crate::address::Address;
use crate::cell::Cell;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::formats::CodecRegistry;
use crate::formats::codec::{BLOB_FIELD, BYTES_FIELD, TAG_FIELD};
use crate::function::Registry;
use crate::primitives::{DELETED_FIELD, ID_FIELD, OUTPUTS_FIELD, UPDATED_FIELD};
use crate::query::Filter;
use crate::record;
use crate::storage::{BlobStore, Document, DocumentStore, FsBlobStore, PathTemplate, document_id};
use crate::{CellError, Timestamp, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// POLICY
// =============================================================================

/// Everything about versioning that does not touch the store: clock,
/// codecs, blob offloading and the filters used to find versions.
///
/// Cheap to clone, so the async adapter can hand a copy to each task.
#[derive(Clone)]
pub struct VersionPolicy {
    clock: Arc<dyn Clock>,
    codecs: Arc<CodecRegistry>,
    blobs: Option<Arc<dyn BlobStore>>,
    template: PathTemplate,
    blob_threshold: usize,
    self_heal: bool,
}

impl fmt::Debug for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionPolicy")
            .field("template", &self.template)
            .field("blob_threshold", &self.blob_threshold)
            .field("self_heal", &self.self_heal)
            .field("blobs", &self.blobs.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl VersionPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            codecs: Arc::new(CodecRegistry::default()),
            blobs: config
                .blob_root
                .as_ref()
                .map(|root| Arc::new(FsBlobStore::new(root)) as Arc<dyn BlobStore>),
            template: config.path_template(),
            blob_threshold: config.blob_threshold,
            self_heal: config.self_heal,
        }
    }

    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    #[cfg_attr(not(feature = "async"), allow(dead_code))]
    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    #[cfg_attr(not(feature = "async"), allow(dead_code))]
    pub(crate) fn set_blobs(&mut self, blobs: Arc<dyn BlobStore>, threshold: usize) {
        self.blobs = Some(blobs);
        self.blob_threshold = threshold;
    }

    #[cfg_attr(not(feature = "async"), allow(dead_code))]
    pub(crate) fn set_self_heal(&mut self, enabled: bool) {
        self.self_heal = enabled;
    }

    #[must_use]
    pub fn self_heal(&self) -> bool {
        self.self_heal
    }

    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Equality on every key field.
    #[must_use]
    pub fn key_filter(key: &[(String, Value)]) -> Filter {
        Filter::by_keyword(key.iter().cloned())
    }

    /// The live version of a key.
    #[must_use]
    pub fn live_filter(key: &[(String, Value)]) -> Filter {
        Self::key_filter(key) & Filter::field(DELETED_FIELD).missing()
    }

    /// Versions of a key visible at `at`.
    #[must_use]
    pub fn as_of_filter(key: &[(String, Value)], at: Timestamp) -> Filter {
        Self::key_filter(key)
            & Filter::field(UPDATED_FIELD).lte(at)
            & (Filter::field(DELETED_FIELD).missing() | Filter::field(DELETED_FIELD).gt(at))
    }

    pub(crate) fn id_filter(ids: impl IntoIterator<Item = u64>) -> Filter {
        Filter::field(ID_FIELD).is_in(ids.into_iter().map(|id| Value::Int(id as i64)))
    }

    /// Validate `cell` and build the live document to write at `now`.
    pub fn prepare(&self, cell: &Cell, now: Timestamp) -> Result<(String, Address, Document), CellError> {
        let Some(collection) = cell.locator.clone() else {
            return Err(CellError::StorageError(format!(
                "{} has no persistence locator",
                cell.describe()
            )));
        };
        let Some(address) = cell.address()? else {
            return Err(CellError::Identity {
                field: String::new(),
                keys: Vec::new(),
                reason: format!("{} declares no primary key", cell.describe()),
            });
        };

        let keys: Vec<String> = cell.primary_key.iter().flatten().cloned().collect();
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| address.get(k).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CellError::MissingKey {
                address: address.to_string(),
                keys,
                missing,
            });
        }

        let mut document = record::encode_cell(cell, &address, &self.codecs)?;
        document.insert(UPDATED_FIELD.to_string(), Value::Time(now));
        self.offload(&collection, &address, cell, now, &mut document)?;
        Ok((collection, address, document))
    }

    /// The superseded copy of a live document.
    #[must_use]
    pub fn superseded_copy(live: &Document, now: Timestamp) -> Document {
        let mut copy = live.clone();
        copy.remove(ID_FIELD);
        copy.insert(DELETED_FIELD.to_string(), Value::Time(now));
        copy
    }

    /// Split duplicate live documents into the survivor (highest backend
    /// id) and the ids to supersede.
    #[must_use]
    pub fn split_duplicates(mut live: Vec<Document>) -> (Option<Document>, Vec<u64>) {
        live.sort_by_key(document_id);
        let survivor = live.pop();
        (survivor, live.iter().filter_map(document_id).collect())
    }

    /// Newest of the versions matching a point-in-time filter.
    #[must_use]
    pub fn newest(versions: Vec<Document>) -> Option<Document> {
        versions.into_iter().max_by(|a, b| {
            let key = |d: &Document| (d.get(UPDATED_FIELD).cloned(), document_id(d));
            key(a).cmp(&key(b))
        })
    }

    /// Sort versions oldest first.
    pub fn order_history(versions: &mut [Document]) {
        versions.sort_by_key(|d| (d.get(UPDATED_FIELD).cloned(), document_id(d)));
    }

    /// Rebuild a cell from a stored document.
    pub fn to_cell(
        &self,
        collection: &str,
        document: &Document,
        registry: &Registry,
    ) -> Result<Cell, CellError> {
        let document = self.restore(document.clone())?;
        record::decode_cell(collection, &document, registry, &self.codecs)
    }

    /// Move large array and table outputs to the blob store.
    fn offload(
        &self,
        collection: &str,
        address: &Address,
        cell: &Cell,
        now: Timestamp,
        document: &mut Document,
    ) -> Result<(), CellError> {
        let Some(blobs) = &self.blobs else {
            return Ok(());
        };

        for key in &cell.output_keys {
            let shape = match cell.outputs.get(key) {
                Some(Value::Array(array)) => array.shape.clone(),
                Some(Value::Table(table)) => {
                    let (rows, cols) = table.shape();
                    vec![rows, cols]
                }
                _ => continue,
            };
            let Some(Value::Map(payload)) = document.get_mut(key) else {
                continue;
            };
            let Some(Value::Bytes(bytes)) = payload.get(BYTES_FIELD) else {
                continue;
            };
            if bytes.len() <= self.blob_threshold {
                continue;
            }

            let path = self.template.resolve(collection, &address.fields, now, key);
            let locator = blobs.write(&path, bytes)?;
            let reference = BTreeMap::from([
                ("path".to_string(), Value::Text(locator)),
                ("len".to_string(), Value::Int(bytes.len() as i64)),
                (
                    "blake3".to_string(),
                    Value::Text(blake3::hash(bytes).to_hex().to_string()),
                ),
                (
                    "shape".to_string(),
                    Value::List(shape.into_iter().map(|n| Value::Int(n as i64)).collect()),
                ),
            ]);
            debug!(%address, output = %key, path = %path, "offloaded payload to blob store");
            payload.remove(BYTES_FIELD);
            payload.insert(BLOB_FIELD.to_string(), Value::Map(reference));
        }
        Ok(())
    }

    /// Bring offloaded outputs back inline, verifying length and checksum.
    pub fn restore(&self, mut document: Document) -> Result<Document, CellError> {
        let keys: Vec<String> = match document.get(OUTPUTS_FIELD) {
            Some(Value::List(keys)) => keys
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => return Ok(document),
        };

        for key in keys {
            let Some(Value::Map(payload)) = document.get_mut(&key) else {
                continue;
            };
            let Some(Value::Map(reference)) = payload.remove(BLOB_FIELD) else {
                continue;
            };
            let blobs = self.blobs.as_ref().ok_or_else(|| {
                CellError::StorageError(format!("output '{key}' is offloaded but no blob store is configured"))
            })?;

            let path = reference.get("path").and_then(Value::as_str).unwrap_or_default();
            let bytes = blobs.read(path)?;
            let expected_len = reference.get("len").and_then(Value::as_int);
            let expected_hash = reference.get("blake3").and_then(Value::as_str);
            let actual_hash = blake3::hash(&bytes).to_hex();
            if expected_len != Some(bytes.len() as i64) || expected_hash != Some(actual_hash.as_str()) {
                return Err(CellError::DeserializationError(format!(
                    "blob {path} for output '{key}' failed verification"
                )));
            }
            payload.insert(BYTES_FIELD.to_string(), Value::Bytes(bytes));
            if !payload.contains_key(TAG_FIELD) {
                return Err(CellError::DeserializationError(format!(
                    "offloaded output '{key}' has no codec tag"
                )));
            }
        }
        Ok(document)
    }
}

pub(crate) fn not_found(collection: &str, key: &[(String, Value)], as_of: Option<Timestamp>) -> CellError {
    CellError::NotFound {
        address: Address::new(Some(collection.to_string()), key.iter().cloned()).to_string(),
        as_of,
    }
}

pub(crate) fn ambiguity(collection: &str, key: &[(String, Value)], count: usize) -> CellError {
    CellError::Ambiguity {
        collection: collection.to_string(),
        key: Address::new(None, key.iter().cloned()).to_string(),
        count,
    }
}

// =============================================================================
// VERSIONED ADAPTER
// =============================================================================

/// Versioned persistence over a synchronous document store.
pub struct Versioned<S> {
    store: S,
    policy: VersionPolicy,
}

impl<S> fmt::Debug for Versioned<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioned")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<S: DocumentStore> Versioned<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: VersionPolicy::default(),
        }
    }

    pub fn from_config(store: S, config: &Config) -> Self {
        Self {
            store,
            policy: VersionPolicy::from_config(config),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.policy.clock = clock;
        self
    }

    #[must_use]
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.policy.codecs = Arc::new(codecs);
        self
    }

    /// Offload array and table outputs larger than `threshold` bytes.
    #[must_use]
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>, threshold: usize) -> Self {
        self.policy.blobs = Some(blobs);
        self.policy.blob_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_path_template(mut self, template: PathTemplate) -> Self {
        self.policy.template = template;
        self
    }

    #[must_use]
    pub fn with_self_heal(mut self, enabled: bool) -> Self {
        self.policy.self_heal = enabled;
        self
    }

    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.policy.clock = clock;
    }

    #[must_use]
    pub fn policy(&self) -> &VersionPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Persist `cell` as the live version of its record.
    ///
    /// Returns the `_updated` instant written.
    pub fn save(&mut self, cell: &Cell) -> Result<Timestamp, CellError> {
        let now = self.policy.now();
        let (collection, address, document) = self.policy.prepare(cell, now)?;

        match self.live(&collection, &address.fields)? {
            Some(live) => {
                let id = document_id(&live).ok_or_else(|| {
                    CellError::StorageError(format!("live record of {address} has no id"))
                })?;
                let archived = self.store.supersede(
                    &collection,
                    id,
                    VersionPolicy::superseded_copy(&live, now),
                    document,
                )?;
                info!(%address, id, archived, at = %now, "superseded live record");
            }
            None => {
                let id = self.store.insert_one(&collection, document)?;
                debug!(%address, id, "inserted record");
            }
        }
        Ok(now)
    }

    /// The live document of a key, healing duplicates when allowed.
    fn live(
        &mut self,
        collection: &str,
        key: &[(String, Value)],
    ) -> Result<Option<Document>, CellError> {
        let filter = VersionPolicy::live_filter(key);
        let mut found = self.store.find(collection, &filter, None)?;
        if found.len() > 1 {
            if !self.policy.self_heal {
                return Err(ambiguity(collection, key, found.len()));
            }
            self.heal(collection, key, found)?;
            found = self.store.find(collection, &filter, None)?;
            if found.len() > 1 {
                return Err(ambiguity(collection, key, found.len()));
            }
        }
        Ok(found.pop())
    }

    fn heal(
        &mut self,
        collection: &str,
        key: &[(String, Value)],
        live: Vec<Document>,
    ) -> Result<(), CellError> {
        let count = live.len();
        let (_, stale) = VersionPolicy::split_duplicates(live);
        let now = self.policy.now();
        let marked =
            self.store
                .delete_or_mark(collection, &VersionPolicy::id_filter(stale), now)?;
        warn!(
            collection,
            key = %Address::new(None, key.iter().cloned()),
            live = count,
            superseded = marked,
            "healed duplicate live records"
        );
        Ok(())
    }

    /// The version of a key: live when `as_of` is `None`, otherwise the
    /// one visible at that instant.
    pub fn load(
        &mut self,
        collection: &str,
        key: &[(String, Value)],
        as_of: Option<Timestamp>,
    ) -> Result<Document, CellError> {
        let document = match as_of {
            None => self.live(collection, key)?,
            Some(at) => VersionPolicy::newest(self.store.find(
                collection,
                &VersionPolicy::as_of_filter(key, at),
                None,
            )?),
        };
        let document = document.ok_or_else(|| not_found(collection, key, as_of))?;
        self.policy.restore(document)
    }

    /// Load and rebuild the cell stored at `address`.
    pub fn load_cell(
        &mut self,
        address: &Address,
        as_of: Option<Timestamp>,
        registry: &Registry,
    ) -> Result<Cell, CellError> {
        let collection = address.locator.as_deref().ok_or_else(|| CellError::NotFound {
            address: address.to_string(),
            as_of,
        })?;
        let document = self.load(collection, &address.fields, as_of)?;
        record::decode_cell(collection, &document, registry, self.policy.codecs())
    }

    /// Every version of a key, oldest first.
    pub fn history(
        &self,
        collection: &str,
        key: &[(String, Value)],
    ) -> Result<Vec<Document>, CellError> {
        let mut versions = self
            .store
            .find(collection, &VersionPolicy::key_filter(key), None)?;
        VersionPolicy::order_history(&mut versions);
        Ok(versions)
    }

    /// Soft-delete the live version. Returns whether one existed.
    pub fn delete(&mut self, collection: &str, key: &[(String, Value)]) -> Result<bool, CellError> {
        let now = self.policy.now();
        let marked = self
            .store
            .delete_or_mark(collection, &VersionPolicy::live_filter(key), now)?;
        if marked > 0 {
            info!(collection, key = %Address::new(None, key.iter().cloned()), "deleted live record");
        }
        Ok(marked > 0)
    }
}

// =============================================================================
// TESTS
// =============================================================================
