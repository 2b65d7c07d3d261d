//! # Async Adapter
//!
//! Cooperative persistence for the evaluation context. Graph walking stays
//! synchronous and borrows nothing across an await; only the store boundary
//! suspends:
//!
//! 1. before a walk, every persisted upstream cell the walk may read is
//!    fetched concurrently and primed into the memo store
//! 2. the synchronous walk runs with saves queued in an outbox
//! 3. the queued writes fan out on a `JoinSet` and are all awaited before
//!    the next generation starts
//!
//! Versioning rules are the ones of [`crate::versioned`]: both adapters
//! share one [`VersionPolicy`].

use crate::address::Address;
use crate::cell::{Cell, Input};
use crate::clock::Clock;
use crate::config::Config;
use crate::context::{Context, LoadMode};
use crate::function::{Function, Registry};
use crate::memo::MemoStore;
use crate::query::Filter;
use crate::record;
use crate::storage::{BlobStore, Document, DocumentStore, document_id};
use crate::versioned::{VersionPolicy, ambiguity, not_found};
use crate::{CellError, Timestamp, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

// =============================================================================
// STORE SEAM
// =============================================================================

/// A document store whose calls may suspend.
///
/// Same contract as [`DocumentStore`]; methods take `&self` so one store can
/// serve many in-flight requests.
pub trait AsyncDocumentStore: Send + Sync + 'static {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> impl Future<Output = Result<Vec<Document>, CellError>> + Send;

    fn insert_one(
        &self,
        collection: &str,
        document: Document,
    ) -> impl Future<Output = Result<u64, CellError>> + Send;

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> impl Future<Output = Result<bool, CellError>> + Send;

    fn delete_or_mark(
        &self,
        collection: &str,
        filter: &Filter,
        at: Timestamp,
    ) -> impl Future<Output = Result<usize, CellError>> + Send;

    /// Archive `archived` and rewrite record `live_id` as one step.
    fn supersede(
        &self,
        collection: &str,
        live_id: u64,
        archived: Document,
        patch: Document,
    ) -> impl Future<Output = Result<u64, CellError>> + Send;
}

/// Any synchronous store behind an async mutex.
///
/// Every call yields to the scheduler first, so concurrent requests
/// interleave the way they would against a remote database.
pub struct Shared<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for Shared<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Shared<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl<S: DocumentStore> Shared<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Exclusive access to the wrapped store.
    pub async fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock().await
    }
}

impl<S: DocumentStore + 'static> AsyncDocumentStore for Shared<S> {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> impl Future<Output = Result<Vec<Document>, CellError>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.inner.lock().await.find(collection, filter, projection)
        }
    }

    fn insert_one(
        &self,
        collection: &str,
        document: Document,
    ) -> impl Future<Output = Result<u64, CellError>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.inner.lock().await.insert_one(collection, document)
        }
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> impl Future<Output = Result<bool, CellError>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.inner.lock().await.update_one(collection, filter, patch)
        }
    }

    fn delete_or_mark(
        &self,
        collection: &str,
        filter: &Filter,
        at: Timestamp,
    ) -> impl Future<Output = Result<usize, CellError>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.inner.lock().await.delete_or_mark(collection, filter, at)
        }
    }

    fn supersede(
        &self,
        collection: &str,
        live_id: u64,
        archived: Document,
        patch: Document,
    ) -> impl Future<Output = Result<u64, CellError>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.inner
                .lock()
                .await
                .supersede(collection, live_id, archived, patch)
        }
    }
}

fn join_error(e: JoinError) -> CellError {
    CellError::StorageError(format!("storage task failed: {e}"))
}

// =============================================================================
// VERSIONED ADAPTER
// =============================================================================

/// Versioned persistence over an async store. Clones share the store.
pub struct AsyncVersioned<S> {
    store: Arc<S>,
    policy: VersionPolicy,
}

impl<S> Clone for AsyncVersioned<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
        }
    }
}

impl<S> fmt::Debug for AsyncVersioned<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncVersioned")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncDocumentStore> AsyncVersioned<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            policy: VersionPolicy::default(),
        }
    }

    pub fn from_config(store: S, config: &Config) -> Self {
        Self {
            store: Arc::new(store),
            policy: VersionPolicy::from_config(config),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.policy.set_clock(clock);
        self
    }

    #[must_use]
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>, threshold: usize) -> Self {
        self.policy.set_blobs(blobs, threshold);
        self
    }

    #[must_use]
    pub fn with_self_heal(mut self, enabled: bool) -> Self {
        self.policy.set_self_heal(enabled);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &VersionPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist `cell` as the live version of its record.
    pub async fn save(&self, cell: &Cell) -> Result<Timestamp, CellError> {
        let now = self.policy.now();
        let (collection, address, document) = self.policy.prepare(cell, now)?;

        match self.live(&collection, &address.fields).await? {
            Some(live) => {
                let id = document_id(&live).ok_or_else(|| {
                    CellError::StorageError(format!("live record of {address} has no id"))
                })?;
                let archived = self
                    .store
                    .supersede(
                        &collection,
                        id,
                        VersionPolicy::superseded_copy(&live, now),
                        document,
                    )
                    .await?;
                info!(%address, id, archived, at = %now, "superseded live record");
            }
            None => {
                let id = self.store.insert_one(&collection, document).await?;
                debug!(%address, id, "inserted record");
            }
        }
        Ok(now)
    }

    async fn live(
        &self,
        collection: &str,
        key: &[(String, Value)],
    ) -> Result<Option<Document>, CellError> {
        let filter = VersionPolicy::live_filter(key);
        let mut found = self.store.find(collection, &filter, None).await?;
        if found.len() > 1 {
            if !self.policy.self_heal() {
                return Err(ambiguity(collection, key, found.len()));
            }
            let count = found.len();
            let (_, stale) = VersionPolicy::split_duplicates(found);
            let marked = self
                .store
                .delete_or_mark(collection, &VersionPolicy::id_filter(stale), self.policy.now())
                .await?;
            warn!(
                collection,
                key = %Address::new(None, key.iter().cloned()),
                live = count,
                superseded = marked,
                "healed duplicate live records"
            );
            found = self.store.find(collection, &filter, None).await?;
            if found.len() > 1 {
                return Err(ambiguity(collection, key, found.len()));
            }
        }
        Ok(found.pop())
    }

    /// Live version, or the one visible at `as_of`.
    pub async fn load(
        &self,
        collection: &str,
        key: &[(String, Value)],
        as_of: Option<Timestamp>,
    ) -> Result<Document, CellError> {
        let document = match as_of {
            None => self.live(collection, key).await?,
            Some(at) => VersionPolicy::newest(
                self.store
                    .find(collection, &VersionPolicy::as_of_filter(key, at), None)
                    .await?,
            ),
        };
        let document = document.ok_or_else(|| not_found(collection, key, as_of))?;
        self.policy.restore(document)
    }

    pub async fn load_cell(
        &self,
        address: &Address,
        as_of: Option<Timestamp>,
        registry: &Registry,
    ) -> Result<Cell, CellError> {
        let collection = address.locator.as_deref().ok_or_else(|| CellError::NotFound {
            address: address.to_string(),
            as_of,
        })?;
        let document = self.load(collection, &address.fields, as_of).await?;
        record::decode_cell(collection, &document, registry, self.policy.codecs())
    }

    /// Every version of a key, oldest first.
    pub async fn history(
        &self,
        collection: &str,
        key: &[(String, Value)],
    ) -> Result<Vec<Document>, CellError> {
        let mut versions = self
            .store
            .find(collection, &VersionPolicy::key_filter(key), None)
            .await?;
        VersionPolicy::order_history(&mut versions);
        Ok(versions)
    }

    /// Soft-delete the live version. Returns whether one existed.
    pub async fn delete(&self, collection: &str, key: &[(String, Value)]) -> Result<bool, CellError> {
        let marked = self
            .store
            .delete_or_mark(collection, &VersionPolicy::live_filter(key), self.policy.now())
            .await?;
        Ok(marked > 0)
    }
}

// =============================================================================
// ASYNC CONTEXT
// =============================================================================

/// Upstream addresses of `cell`, with the inline copy when the memo store
/// does not already hold one.
fn walk_inputs(
    cell: &Cell,
    memo: &MemoStore,
    out: &mut Vec<(Address, Option<Cell>)>,
) -> Result<(), CellError> {
    for input in cell.inputs.values() {
        walk_input(input, memo, out)?;
    }
    Ok(())
}

fn walk_input(
    input: &Input,
    memo: &MemoStore,
    out: &mut Vec<(Address, Option<Cell>)>,
) -> Result<(), CellError> {
    match input {
        Input::Data(_) => {}
        Input::Cell(cell) => match cell.address()? {
            Some(address) => {
                let inline = (!memo.contains(&address)).then(|| (**cell).clone());
                out.push((address, inline));
            }
            None => walk_inputs(cell, memo, out)?,
        },
        Input::Ref(address) => out.push((address.clone(), None)),
        Input::List(items) => {
            for item in items {
                walk_input(item, memo, out)?;
            }
        }
        Input::Map(items) => {
            for item in items.values() {
                walk_input(item, memo, out)?;
            }
        }
    }
    Ok(())
}

/// Evaluation context over an async store.
///
/// Wraps a [`Context`] whose saves are buffered; this type owns the I/O.
/// Loads prime the memo store, so a loaded cell stays memoized.
pub struct AsyncContext<S> {
    inner: Context,
    persistence: AsyncVersioned<S>,
}

impl<S> fmt::Debug for AsyncContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("inner", &self.inner)
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl<S: AsyncDocumentStore> AsyncContext<S> {
    /// A context adopting the clock of `persistence`.
    pub fn new(persistence: AsyncVersioned<S>) -> Self {
        Self {
            inner: Context::buffered(persistence.policy().clock(), Registry::new()),
            persistence,
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.inner = std::mem::take(&mut self.inner).with_registry(registry);
        self
    }

    pub fn register(&mut self, function: Arc<Function>) {
        self.inner.register(function);
    }

    /// The wrapped synchronous context (memo, DAG, dirty set).
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.inner
    }

    #[must_use]
    pub fn persistence(&self) -> &AsyncVersioned<S> {
        &self.persistence
    }

    /// See [`Context::go`].
    pub async fn go(&mut self, cell: Cell, depth: i32) -> Result<Cell, CellError> {
        self.preload(&cell).await?;
        let result = self.inner.go(cell, depth);
        self.flush().await?;
        result
    }

    /// See [`Context::load`].
    pub async fn load(&mut self, cell: Cell, mode: LoadMode) -> Result<Cell, CellError> {
        if mode != LoadMode::Evict {
            if let Some(address) = cell.address()? {
                self.ensure_loaded(std::slice::from_ref(&address)).await?;
            }
        }
        self.inner.load(cell, mode)
    }

    /// The version of the cell at `address` visible at `at`.
    pub async fn load_as_of(&self, address: &Address, at: Timestamp) -> Result<Cell, CellError> {
        self.persistence
            .load_cell(address, Some(at), self.inner.registry())
            .await
    }

    /// Fetch the live copies of `addresses` concurrently. Results keep the
    /// order of `addresses`; `None` marks an address with no live record.
    pub async fn load_many(&self, addresses: &[Address]) -> Result<Vec<Option<Cell>>, CellError> {
        let mut tasks = JoinSet::new();
        for (index, address) in addresses.iter().cloned().enumerate() {
            let persistence = self.persistence.clone();
            let registry = self.inner.registry().clone();
            tasks.spawn(async move {
                let found = match persistence.load_cell(&address, None, &registry).await {
                    Ok(cell) => Ok(Some(cell)),
                    Err(CellError::NotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                };
                (index, found)
            });
        }

        let mut results = vec![None; addresses.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, found) = joined.map_err(join_error)?;
            if let Some(slot) = results.get_mut(index) {
                *slot = found?;
            }
        }
        Ok(results)
    }

    /// See [`Context::push`]. Each generation's writes land before the
    /// next generation is recomputed.
    pub async fn push(&mut self, cell: Cell) -> Result<Cell, CellError> {
        let Some(address) = cell.address()? else {
            return self.go(cell, 1).await;
        };

        self.ensure_loaded(std::slice::from_ref(&address)).await?;
        self.preload(&cell).await?;
        let refreshed = self.inner.refresh_root(cell, &address);
        self.flush().await?;
        let (root, changed) = refreshed?;

        let generations = self
            .inner
            .dag()
            .topological_generations(std::slice::from_ref(&address))?;
        let mut recomputed = 0usize;
        for (_, generation) in generations.by_generation.into_iter().filter(|(g, _)| *g > 0) {
            let generation: Vec<Address> = generation.into_iter().collect();
            recomputed += self.recompute_all(&generation).await?;
        }
        info!(%address, changed, recomputed, "push complete");
        Ok(root)
    }

    /// See [`Context::reconcile`].
    pub async fn reconcile(&mut self) -> Result<usize, CellError> {
        let mut recomputed = 0usize;
        for generation in self.inner.dirty_generations()? {
            recomputed += self.recompute_all(&generation).await?;
        }
        if recomputed > 0 {
            info!(recomputed, "reconciled dirty cells");
        }
        Ok(recomputed)
    }

    /// Recompute the dirty members of one generation, then flush their
    /// writes. Members that are not dirty are left alone.
    async fn recompute_all(&mut self, addresses: &[Address]) -> Result<usize, CellError> {
        let dirty: Vec<Address> = addresses
            .iter()
            .filter(|address| self.inner.dirty().contains(*address))
            .cloned()
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        self.ensure_loaded(&dirty).await?;
        for address in &dirty {
            if let Some(cell) = self.inner.memo().get(address).cloned() {
                self.preload(&cell).await?;
            }
        }

        let mut outcome = Ok(0usize);
        for address in &dirty {
            match self.inner.refresh(address) {
                Ok(_) => outcome = outcome.map(|n| n + 1),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.flush().await?;
        outcome
    }

    /// Prime the memo store with any of `addresses` it lacks.
    async fn ensure_loaded(&mut self, addresses: &[Address]) -> Result<(), CellError> {
        let missing: Vec<Address> = addresses
            .iter()
            .filter(|a| a.locator.is_some() && !self.inner.memo().contains(a))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for cell in self.load_many(&missing).await?.into_iter().flatten() {
            self.inner.prime(cell)?;
        }
        Ok(())
    }

    /// Prime every persisted ancestor of `cell` the walk may read.
    ///
    /// Transitive, so a lazy `go` may read more than it ends up using.
    async fn preload(&mut self, cell: &Cell) -> Result<(), CellError> {
        let mut seen = BTreeSet::new();
        let mut pending = Vec::new();
        walk_inputs(cell, self.inner.memo(), &mut pending)?;

        while !pending.is_empty() {
            let mut next = Vec::new();
            let mut wanted = Vec::new();
            for (address, inline) in std::mem::take(&mut pending) {
                if !seen.insert(address.clone()) {
                    continue;
                }
                if let Some(memoized) = self.inner.memo().get(&address) {
                    walk_inputs(memoized, self.inner.memo(), &mut next)?;
                } else if address.locator.is_some() {
                    wanted.push((address, inline));
                } else if let Some(inline) = inline {
                    walk_inputs(&inline, self.inner.memo(), &mut next)?;
                }
            }

            if !wanted.is_empty() {
                let addresses: Vec<Address> = wanted.iter().map(|(a, _)| a.clone()).collect();
                let loaded = self.load_many(&addresses).await?;
                debug!(requested = addresses.len(), "preloaded upstream cells");
                for ((_, inline), stored) in wanted.into_iter().zip(loaded) {
                    match stored {
                        Some(stored) => {
                            walk_inputs(&stored, self.inner.memo(), &mut next)?;
                            self.inner.prime(stored)?;
                        }
                        None => {
                            if let Some(inline) = inline {
                                walk_inputs(&inline, self.inner.memo(), &mut next)?;
                            }
                        }
                    }
                }
            }
            pending = next;
        }
        Ok(())
    }

    /// Write everything the last walk saved. Repeated saves of one address
    /// collapse to the last.
    async fn flush(&mut self) -> Result<usize, CellError> {
        let mut latest: BTreeMap<Address, Cell> = BTreeMap::new();
        for cell in self.inner.take_outbox() {
            if let Some(address) = cell.address()? {
                latest.insert(address, cell);
            }
        }
        let count = latest.len();

        let mut tasks = JoinSet::new();
        for cell in latest.into_values() {
            let persistence = self.persistence.clone();
            tasks.spawn(async move { persistence.save(&cell).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined.map_err(join_error).and_then(|saved| saved) {
                warn!(error = %e, "write failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
