//! # Context
//!
//! The evaluation context: owns the memo store, the dependency graph, the
//! dirty set, the function registry and (optionally) the versioned
//! persistence adapter. Every cache lives here; there are no globals, so
//! independent contexts can run side by side.
//!
//! ## Lifecycle operations
//!
//! - `go`: materialize inputs (respecting depth), run, save
//! - `save`: write through to persistence, memoize, `pull`
//! - `load`: merge a memoized or persisted copy into the cell in hand
//! - `pull`: bring the DAG edges of a cell in line with its inputs
//! - `push`: bring a cell up to date, then recompute the descendants its
//!   change actually reaches, in generation order
//!
//! ## Depth
//!
//! `go(cell, 0)` is lazy: a computed cell is returned as is and input cells
//! are only computed when they have no outputs. `go(cell, n)` with `n > 0`
//! forces the cell and `n - 1` generations of ancestors. A negative depth
//! forces the whole ancestor chain.

use crate::address::Address;
use crate::cell::{Cell, Input};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dag::{Dag, EdgeLabel};
use crate::function::{Function, Registry};
use crate::memo::MemoStore;
use crate::storage::DocumentStore;
use crate::versioned::Versioned;
use crate::{CellError, Timestamp, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `load` does when it finds (or does not find) a stored copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Drop the memoized copy so the next load goes back to persistence.
    Evict,
    /// Merge a stored copy if one exists, otherwise return the cell as is.
    IfExists,
    /// Like `IfExists`, but fail with `NotFound` when nothing is stored.
    Required,
}

/// Synchronous persistence behind a trait object.
pub type Persistence = Versioned<Box<dyn DocumentStore>>;

/// Evaluation context.
pub struct Context {
    memo: MemoStore,
    dag: Dag,
    dirty: BTreeSet<Address>,
    registry: Registry,
    clock: Arc<dyn Clock>,
    persistence: Option<Persistence>,
    /// When set, persisted saves are queued here instead of written.
    outbox: Option<Vec<Cell>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("memo_size", &self.memo.len())
            .field("edges", &self.dag.edge_count())
            .field("dirty", &self.dirty.len())
            .field("functions", &self.registry.len())
            .field("persistent", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self {
            memo: MemoStore::new(),
            dag: Dag::new(),
            dirty: BTreeSet::new(),
            registry: Registry::new(),
            clock: Arc::new(SystemClock),
            persistence: None,
            outbox: None,
        }
    }
}

impl Context {
    /// A context without persistence: cells live in the memo store only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context persisting through `store` with the given configuration.
    pub fn from_config(store: impl DocumentStore + 'static, config: &Config) -> Self {
        let store: Box<dyn DocumentStore> = Box::new(store);
        Self::new().with_versioned(Versioned::from_config(store, config))
    }

    /// Persist through `store` with default settings.
    #[must_use]
    pub fn with_store(self, store: impl DocumentStore + 'static) -> Self {
        let store: Box<dyn DocumentStore> = Box::new(store);
        self.with_versioned(Versioned::new(store))
    }

    /// Persist through a configured adapter. The adapter adopts this
    /// context's clock.
    #[must_use]
    pub fn with_versioned(mut self, mut versioned: Persistence) -> Self {
        versioned.set_clock(Arc::clone(&self.clock));
        self.persistence = Some(versioned);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.set_clock(Arc::clone(&clock));
        }
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Make `function` available for rehydrating persisted cells.
    pub fn register(&mut self, function: Arc<Function>) {
        self.registry.register(function);
    }

    /// A context that queues persisted saves in an outbox.
    #[cfg_attr(not(feature = "async"), allow(dead_code))]
    pub(crate) fn buffered(clock: Arc<dyn Clock>, registry: Registry) -> Self {
        Self {
            clock,
            registry,
            outbox: Some(Vec::new()),
            ..Self::default()
        }
    }

    #[cfg_attr(not(feature = "async"), allow(dead_code))]
    pub(crate) fn take_outbox(&mut self) -> Vec<Cell> {
        self.outbox.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Seed the memo store with a copy fetched elsewhere.
    #[cfg_attr(not(feature = "async"), allow(dead_code))]
    pub(crate) fn prime(&mut self, cell: Cell) -> Result<(), CellError> {
        if let Some(address) = cell.address()? {
            let merged = match self.memo.evict(&address) {
                Some(cached) => Cell::merge(cached, cell),
                None => cell,
            };
            self.memo.insert(address, merged);
        }
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn memo(&self) -> &MemoStore {
        &self.memo
    }

    #[must_use]
    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Addresses waiting for recomputation after an interrupted push.
    #[must_use]
    pub fn dirty(&self) -> &BTreeSet<Address> {
        &self.dirty
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn persistence(&self) -> Option<&Persistence> {
        self.persistence.as_ref()
    }

    pub fn persistence_mut(&mut self) -> Option<&mut Persistence> {
        self.persistence.as_mut()
    }

    /// Drop every memoized cell, edge and dirty mark.
    pub fn clear(&mut self) {
        self.memo.clear();
        self.dag.clear();
        self.dirty.clear();
    }

    // =========================================================================
    // GO
    // =========================================================================

    /// Evaluate `cell`, see the module docs for `depth`.
    pub fn go(&mut self, cell: Cell, depth: i32) -> Result<Cell, CellError> {
        if cell.function.is_none() {
            return Ok(cell);
        }
        if depth == 0 && !cell.run() {
            return Ok(cell);
        }

        let child_depth = if depth > 0 { depth - 1 } else { depth };
        let mut cell = cell;
        self.materialize_inputs(&mut cell, child_depth)?;
        self.compute(&mut cell)?;
        self.save(cell)
    }

    fn materialize_inputs(&mut self, cell: &mut Cell, depth: i32) -> Result<(), CellError> {
        let inputs = std::mem::take(&mut cell.inputs);
        let mut materialized = BTreeMap::new();
        for (name, input) in inputs {
            materialized.insert(name, self.materialize(input, depth)?);
        }
        cell.inputs = materialized;
        Ok(())
    }

    /// Bring every upstream cell inside `input` up to date.
    fn materialize(&mut self, input: Input, depth: i32) -> Result<Input, CellError> {
        Ok(match input {
            Input::Data(value) => Input::Data(value),
            Input::Cell(cell) => {
                let cell = self.load(*cell, LoadMode::IfExists)?;
                Input::Cell(Box::new(self.go(cell, depth)?))
            }
            Input::Ref(address) => {
                let cell = self.fetch(&address)?;
                Input::Cell(Box::new(self.go(cell, depth)?))
            }
            Input::List(items) => Input::List(
                items
                    .into_iter()
                    .map(|item| self.materialize(item, depth))
                    .collect::<Result<_, _>>()?,
            ),
            Input::Map(items) => Input::Map(
                items
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.materialize(v, depth)?)))
                    .collect::<Result<_, CellError>>()?,
            ),
        })
    }

    /// Call the function and stamp the outputs.
    ///
    /// Parameters are filled from the inputs first, then from `extra`.
    fn compute(&self, cell: &mut Cell) -> Result<(), CellError> {
        let Some(function) = cell.function.clone() else {
            return Ok(());
        };

        let raw = function.call(&arguments(cell)?)?;
        cell.unpack(raw)?;
        cell.updated_at = Some(self.clock.now());
        debug!(cell = %cell.describe(), function = function.name(), "computed");
        Ok(())
    }

    // =========================================================================
    // SAVE / LOAD
    // =========================================================================

    /// Persist, memoize and pull `cell`. Unaddressable cells pass through.
    pub fn save(&mut self, mut cell: Cell) -> Result<Cell, CellError> {
        let Some(address) = cell.address()? else {
            return Ok(cell);
        };

        if cell.locator.is_some() {
            if let Some(outbox) = self.outbox.as_mut() {
                outbox.push(cell.clone());
            } else if let Some(persistence) = self.persistence.as_mut() {
                let written = persistence.save(&cell)?;
                cell.updated_at = Some(written);
            }
        }

        self.memo.insert(address, cell.clone());
        self.pull(&cell)?;
        Ok(cell)
    }

    /// See [`LoadMode`].
    pub fn load(&mut self, cell: Cell, mode: LoadMode) -> Result<Cell, CellError> {
        let address = cell.address()?;

        if mode == LoadMode::Evict {
            if let Some(address) = &address {
                if self.memo.evict(address).is_some() {
                    debug!(%address, "evicted from memo");
                }
            }
            return Ok(cell);
        }

        let stored = match &address {
            Some(address) => self.lookup(address)?,
            None => None,
        };
        match stored {
            Some(stored) => Ok(Cell::merge(stored, cell)),
            None if mode == LoadMode::Required => Err(CellError::NotFound {
                address: cell.describe(),
                as_of: None,
            }),
            None => Ok(cell),
        }
    }

    /// The version of the cell at `address` visible at `at`.
    pub fn load_as_of(&mut self, address: &Address, at: Timestamp) -> Result<Cell, CellError> {
        let persistence = self.persistence.as_mut().ok_or_else(|| CellError::NotFound {
            address: address.to_string(),
            as_of: Some(at),
        })?;
        persistence.load_cell(address, Some(at), &self.registry)
    }

    /// Memoized copy, else the live persisted record.
    fn lookup(&mut self, address: &Address) -> Result<Option<Cell>, CellError> {
        if let Some(cell) = self.memo.get(address) {
            debug!(%address, "memo hit");
            return Ok(Some(cell.clone()));
        }
        let Some(persistence) = self.persistence.as_mut() else {
            return Ok(None);
        };
        if address.locator.is_none() {
            return Ok(None);
        }
        match persistence.load_cell(address, None, &self.registry) {
            Ok(cell) => {
                debug!(%address, "loaded from persistence");
                Ok(Some(cell))
            }
            Err(CellError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The cell stored at `address`, from memo or persistence.
    pub fn fetch(&mut self, address: &Address) -> Result<Cell, CellError> {
        self.lookup(address)?.ok_or_else(|| CellError::NotFound {
            address: address.to_string(),
            as_of: None,
        })
    }

    // =========================================================================
    // PULL / PUSH
    // =========================================================================

    /// Make the DAG parents of `cell` match its current input cells.
    ///
    /// Returns `(added, removed)` edge counts.
    pub fn pull(&mut self, cell: &Cell) -> Result<(usize, usize), CellError> {
        let Some(child) = cell.address()? else {
            return Ok((0, 0));
        };

        let mut parents: BTreeMap<Address, EdgeLabel> = BTreeMap::new();
        for (name, input) in &cell.inputs {
            let mut upstream = BTreeSet::new();
            input.upstream(&mut upstream)?;
            for parent in upstream {
                parents.entry(parent).or_default().insert(name.clone());
            }
        }

        let (added, removed) = self.dag.replace_parents(&child, parents);
        if added > 0 || removed > 0 {
            debug!(%child, added, removed, "updated dependency edges");
        }
        Ok((added, removed))
    }

    /// Everything downstream of `address`, in recomputation order.
    pub fn descendants(&self, address: &Address) -> Result<Vec<Address>, CellError> {
        self.dag.descendants(address, &[0])
    }

    /// Recompute `cell` and whatever its change reaches downstream.
    ///
    /// The pushed cell is recomputed unless its stored copy was computed
    /// from the same arguments. When its outputs change its children are
    /// marked dirty. Descendants are then visited generation by generation:
    /// each dirty one is recomputed, leaves the dirty set, and dirties its
    /// own children only if its outputs changed. Pushing an unchanged cell
    /// therefore writes nothing. If a recomputation fails the rest stay
    /// dirty for [`Context::reconcile`].
    pub fn push(&mut self, cell: Cell) -> Result<Cell, CellError> {
        let Some(address) = cell.address()? else {
            return self.go(cell, 1);
        };

        let (root, changed) = self.refresh_root(cell, &address)?;
        let order = self.dag.descendants(&address, &[0])?;
        let mut recomputed = 0usize;
        for descendant in &order {
            if self.dirty.contains(descendant) {
                self.refresh(descendant)?;
                recomputed += 1;
            }
        }
        info!(%address, changed, recomputed, skipped = order.len().saturating_sub(recomputed), "push complete");
        Ok(root)
    }

    /// Bring a pushed cell up to date. Returns it and whether its outputs
    /// differ from the copy known before the push.
    pub(crate) fn refresh_root(
        &mut self,
        mut cell: Cell,
        address: &Address,
    ) -> Result<(Cell, bool), CellError> {
        let prior = self.lookup(address)?;
        if cell.function.is_some() {
            self.materialize_inputs(&mut cell, 0)?;
        }

        if !self.dirty.contains(address) {
            if let Some(prior) = prior.as_ref().filter(|prior| is_current(prior, &cell)) {
                debug!(%address, "pushed cell unchanged");
                return Ok((Cell::merge(prior.clone(), cell), false));
            }
        }

        self.compute(&mut cell)?;
        let changed = prior.is_none_or(|prior| prior.outputs != cell.outputs);
        let cell = self.save(cell)?;
        self.dirty.remove(address);
        if changed {
            self.mark_children(address);
        }
        Ok((cell, changed))
    }

    /// Mark every descendant of `address` dirty and return them grouped by
    /// generation, nearest first. The next [`Context::reconcile`]
    /// recomputes them all.
    pub fn mark_descendants(&mut self, address: &Address) -> Result<Vec<BTreeSet<Address>>, CellError> {
        let generations = self
            .dag
            .topological_generations(std::slice::from_ref(address))?;
        let buckets: Vec<BTreeSet<Address>> = generations
            .by_generation
            .into_iter()
            .filter(|(generation, _)| *generation > 0)
            .map(|(_, bucket)| bucket)
            .collect();
        for bucket in &buckets {
            self.dirty.extend(bucket.iter().cloned());
        }
        Ok(buckets)
    }

    fn mark_children(&mut self, address: &Address) {
        let children: Vec<Address> = self.dag.children(address).cloned().collect();
        self.dirty.extend(children);
    }

    /// Force one stored cell to recompute against its current inputs.
    ///
    /// If its outputs change, its children are marked dirty.
    pub fn recompute(&mut self, address: &Address) -> Result<Cell, CellError> {
        self.refresh(address).map(|(cell, _)| cell)
    }

    /// Recompute one stored cell and clear its dirty mark. Returns the cell
    /// and whether its outputs changed.
    pub(crate) fn refresh(&mut self, address: &Address) -> Result<(Cell, bool), CellError> {
        let cell = self.fetch(address)?;
        if cell.function.is_none() && !cell.inputs.is_empty() {
            warn!(%address, "cannot recompute: function not registered");
            return Err(CellError::UnknownFunction(address.to_string()));
        }

        let before = cell.outputs.clone();
        let cell = self.go(cell, 1)?;
        self.dirty.remove(address);
        let changed = cell.outputs != before;
        if changed {
            self.mark_children(address);
        }
        Ok((cell, changed))
    }

    /// Dirty addresses and everything below them, grouped by generation.
    ///
    /// Entries that are not dirty when visited are skipped; they become
    /// dirty only if an ancestor's outputs change on the way down.
    pub(crate) fn dirty_generations(&self) -> Result<Vec<Vec<Address>>, CellError> {
        let roots: Vec<Address> = self.dirty.iter().cloned().collect();
        Ok(self
            .dag
            .topological_generations(&roots)?
            .by_generation
            .into_values()
            .map(|bucket| bucket.into_iter().collect())
            .collect())
    }

    /// Recompute whatever an interrupted push (or `mark_descendants`) left
    /// dirty. Returns the number of cells recomputed.
    pub fn reconcile(&mut self) -> Result<usize, CellError> {
        let mut recomputed = 0usize;
        for generation in self.dirty_generations()? {
            for address in &generation {
                if self.dirty.contains(address) {
                    self.refresh(address)?;
                    recomputed += 1;
                }
            }
        }
        if recomputed > 0 {
            info!(recomputed, "reconciled dirty cells");
        }
        Ok(recomputed)
    }
}

/// Arguments a cell's function is called with: `extra`, overlaid by the
/// values of its inputs.
fn arguments(cell: &Cell) -> Result<BTreeMap<String, Value>, CellError> {
    let mut values: BTreeMap<String, Value> = cell.extra.clone();
    for (name, input) in &cell.inputs {
        values.insert(name.clone(), input.value()?);
    }
    Ok(values)
}

/// Whether `prior` already holds the result `cell` would compute.
///
/// A prior copy whose upstream inputs are bare references (a record just
/// read back from persistence) cannot be compared and counts as outdated.
fn is_current(prior: &Cell, cell: &Cell) -> bool {
    if prior.run() || prior.function_name() != cell.function_name() {
        return false;
    }
    if cell.function.is_none() {
        return prior.outputs == cell.outputs;
    }
    match (arguments(prior), arguments(cell)) {
        (Ok(before), Ok(now)) => before == now,
        _ => false,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_add(calls: Arc<AtomicUsize>) -> Arc<Function> {
        Function::new("add", ["a", "b"], move |args| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(args.int("a")?.saturating_add(args.int("b")?)))
        })
    }

    fn named(function: &Arc<Function>, name: &str) -> Cell {
        Cell::new(Arc::clone(function))
            .with_extra("name", name)
            .with_primary_key(["name"])
    }

    fn clocked() -> (Context, ManualClock) {
        let clock = ManualClock::new(Timestamp(1_000));
        (Context::new().with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn literal_cells_pass_through_go() {
        let mut ctx = Context::new();
        let cell = ctx.go(Cell::literal(3), -1).expect("go");
        assert_eq!(cell.value().expect("value"), Value::Int(3));
        assert!(ctx.memo().is_empty());
    }

    #[test]
    fn go_computes_and_memoizes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let mut ctx = Context::new();

        let cell = ctx
            .go(named(&add, "x").with_input("a", 1).with_input("b", 2), 0)
            .expect("go");
        assert_eq!(cell.value().expect("value"), Value::Int(3));
        assert!(cell.updated_at.is_some());
        assert_eq!(ctx.memo().len(), 1);

        let again = ctx.go(cell, 0).expect("lazy go");
        assert_eq!(again.value().expect("value"), Value::Int(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn depth_controls_ancestor_recomputation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let mut ctx = Context::new();

        let a = ctx
            .go(named(&add, "a").with_input("a", 1).with_input("b", 1), 0)
            .expect("a");
        let b = ctx
            .go(named(&add, "b").with_input("a", a).with_input("b", 1), 0)
            .expect("b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let b = ctx.go(b, 1).expect("force b only");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        ctx.go(b, -1).expect("force chain");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn unaddressed_cells_are_not_memoized() {
        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let mut ctx = Context::new();
        let cell = Cell::new(add).with_input("a", 1).with_input("b", 1);
        ctx.go(cell, 0).expect("go");
        assert!(ctx.memo().is_empty());
        assert!(ctx.dag().is_empty());
    }

    #[test]
    fn extra_fields_fill_parameters() {
        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let mut ctx = Context::new();
        let cell = named(&add, "x").with_input("a", 1).with_extra("b", 10);
        assert_eq!(ctx.go(cell, 0).expect("go").value().expect("value"), Value::Int(11));
    }

    #[test]
    fn load_modes() {
        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let mut ctx = Context::new();
        let bare = named(&add, "x").with_input("a", 1).with_input("b", 2);

        assert!(ctx.load(bare.clone(), LoadMode::IfExists).expect("load").run());
        assert!(matches!(
            ctx.load(bare.clone(), LoadMode::Required),
            Err(CellError::NotFound { .. })
        ));

        ctx.go(bare.clone(), 0).expect("go");
        let loaded = ctx.load(bare.clone(), LoadMode::Required).expect("load");
        assert_eq!(loaded.value().expect("value"), Value::Int(3));

        ctx.load(bare.clone(), LoadMode::Evict).expect("evict");
        assert!(ctx.load(bare, LoadMode::IfExists).expect("load").run());
    }

    #[test]
    fn pull_tracks_input_changes() {
        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let (mut ctx, _) = clocked();
        let a = ctx
            .go(named(&add, "a").with_input("a", 1).with_input("b", 1), 0)
            .expect("a");
        let z = ctx
            .go(named(&add, "z").with_input("a", 5).with_input("b", 5), 0)
            .expect("z");
        let mut c = ctx
            .go(named(&add, "c").with_input("a", a.clone()).with_input("b", a.clone()), 0)
            .expect("c");

        let a_addr = a.address().expect("a").expect("addr");
        let z_addr = z.address().expect("z").expect("addr");
        let c_addr = c.address().expect("c").expect("addr");
        let label = ctx.dag().parents(&c_addr).remove(&a_addr).expect("edge");
        assert_eq!(label.len(), 2);

        c.set_input("b", z);
        assert_eq!(ctx.pull(&c).expect("pull"), (1, 0));
        assert!(ctx.dag().contains_edge(&z_addr, &c_addr));

        c.set_input("a", 0);
        assert_eq!(ctx.pull(&c).expect("pull"), (0, 1));
        assert!(!ctx.dag().contains_edge(&a_addr, &c_addr));
    }

    #[test]
    fn push_recomputes_descendants_in_memory() {
        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let (mut ctx, clock) = clocked();

        let mut a = ctx
            .go(named(&add, "a").with_input("a", 1).with_input("b", 1), 0)
            .expect("a");
        let b = ctx
            .go(named(&add, "b").with_input("a", a.clone()).with_input("b", 1), 0)
            .expect("b");
        assert_eq!(b.value().expect("value"), Value::Int(3));

        clock.advance(10);
        a.set_input("a", 10);
        ctx.push(a).expect("push");

        let b = ctx.load(b, LoadMode::Required).expect("load");
        assert_eq!(b.value().expect("value"), Value::Int(12));
        assert!(ctx.dirty().is_empty());
    }

    #[test]
    fn failed_push_leaves_dirty_for_reconcile() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fail.clone();
        let fragile = Function::new("fragile", ["x"], move |args| {
            if flag.load(Ordering::SeqCst) {
                return Err(args.fail("unavailable"));
            }
            Ok(Value::Int(args.int("x")?.saturating_mul(2)))
        });
        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let (mut ctx, clock) = clocked();

        let mut a = ctx
            .go(named(&add, "a").with_input("a", 1).with_input("b", 1), 0)
            .expect("a");
        let b = ctx
            .go(named(&fragile, "b").with_input("x", a.clone()), 0)
            .expect("b");

        fail.store(true, Ordering::SeqCst);
        clock.advance(10);
        a.set_input("a", 2);
        assert!(ctx.push(a).is_err());
        let b_addr = b.address().expect("b").expect("addr");
        assert!(ctx.dirty().contains(&b_addr));

        fail.store(false, Ordering::SeqCst);
        assert_eq!(ctx.reconcile().expect("reconcile"), 1);
        assert!(ctx.dirty().is_empty());
        let b = ctx.fetch(&b_addr).expect("fetch");
        assert_eq!(b.value().expect("value"), Value::Int(6));
        assert_eq!(ctx.reconcile().expect("nothing left"), 0);
    }

    #[test]
    fn repeated_push_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let (mut ctx, clock) = clocked();

        let mut a = ctx
            .go(named(&add, "a").with_input("a", 1).with_input("b", 1), 0)
            .expect("a");
        let b = ctx
            .go(named(&add, "b").with_input("a", a.clone()).with_input("b", 1), 0)
            .expect("b");
        let b_addr = b.address().expect("b").expect("addr");

        clock.advance(10);
        a.set_input("a", 5);
        let a = ctx.push(a).expect("first push");
        let after_first = calls.load(Ordering::SeqCst);
        let stamp = ctx.fetch(&b_addr).expect("b").updated_at;

        clock.advance(10);
        let again = ctx.push(a.clone()).expect("second push");
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
        assert_eq!(again.outputs, a.outputs);
        assert_eq!(ctx.fetch(&b_addr).expect("b").updated_at, stamp);
        assert!(ctx.dirty().is_empty());
    }

    #[test]
    fn unchanged_outputs_stop_propagation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let (mut ctx, clock) = clocked();

        let mut a = ctx
            .go(named(&add, "a").with_input("a", 1).with_input("b", 2), 0)
            .expect("a");
        let b = ctx
            .go(named(&add, "b").with_input("a", a.clone()).with_input("b", 1), 0)
            .expect("b");
        ctx.go(named(&add, "c").with_input("a", b).with_input("b", 1), 0)
            .expect("c");
        let before = calls.load(Ordering::SeqCst);

        // 2 + 1 still sums to 3, so nothing downstream changes.
        clock.advance(10);
        a.set_input("a", 2);
        a.set_input("b", 1);
        ctx.push(a).expect("push");
        assert_eq!(calls.load(Ordering::SeqCst), before + 1);
        assert!(ctx.dirty().is_empty());
    }

    #[test]
    fn unregistered_descendant_stays_dirty() {
        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let mut ctx = Context::new().with_store(MemoryStore::new());

        let mut a = ctx
            .go(
                named(&add, "a").with_input("a", 1).with_input("b", 1).stored_in("adds"),
                0,
            )
            .expect("a");
        let b = ctx
            .go(
                named(&add, "b").with_input("a", a.clone()).with_input("b", 1).stored_in("adds"),
                0,
            )
            .expect("b");
        let b_addr = b.address().expect("b").expect("addr");

        // Only the persisted record remains, and no registry can revive it.
        ctx.load(b, LoadMode::Evict).expect("evict");
        a.set_input("a", 5);
        let err = ctx.push(a).expect_err("b cannot be recomputed");
        assert!(matches!(err, CellError::UnknownFunction(_)));
        assert!(ctx.dirty().contains(&b_addr));
    }

    #[test]
    fn marked_descendants_are_reconciled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let (mut ctx, _clock) = clocked();

        let a = ctx
            .go(named(&add, "a").with_input("a", 1).with_input("b", 1), 0)
            .expect("a");
        let a_addr = a.address().expect("a").expect("addr");
        let b = ctx
            .go(named(&add, "b").with_input("a", a).with_input("b", 1), 0)
            .expect("b");
        ctx.go(named(&add, "c").with_input("a", b).with_input("b", 1), 0)
            .expect("c");
        let before = calls.load(Ordering::SeqCst);

        let generations = ctx.mark_descendants(&a_addr).expect("mark");
        assert_eq!(generations.len(), 2);
        assert_eq!(ctx.dirty().len(), 2);

        assert_eq!(ctx.reconcile().expect("reconcile"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), before + 2);
        assert!(ctx.dirty().is_empty());
    }

    #[test]
    fn persisted_inputs_are_rehydrated_by_reference() {
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let mut registry = Registry::new();
        registry.register(add.clone());

        let store = MemoryStore::new();
        let mut ctx = Context::new().with_store(store).with_registry(registry);
        let a = ctx
            .go(
                named(&add, "a").with_input("a", 1).with_input("b", 1).stored_in("adds"),
                0,
            )
            .expect("a");
        let b = ctx
            .go(
                named(&add, "b").with_input("a", a).with_input("b", 1).stored_in("adds"),
                0,
            )
            .expect("b");
        let b_addr = b.address().expect("b").expect("addr");

        // Forget everything in memory; only persistence remains.
        ctx.clear();
        let b = ctx.fetch(&b_addr).expect("fetch");
        assert!(matches!(b.inputs.get("a"), Some(Input::Ref(_))));

        let b = ctx.go(b, -1).expect("recompute chain");
        assert_eq!(b.value().expect("value"), Value::Int(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(b.inputs.get("a"), Some(Input::Cell(_))));
    }

    #[test]
    fn as_of_without_persistence_is_not_found() {
        let mut ctx = Context::new();
        let address = Address::new(Some("x".into()), [("k".to_string(), Value::Int(1))]);
        assert!(matches!(
            ctx.load_as_of(&address, Timestamp(1)),
            Err(CellError::NotFound { as_of: Some(_), .. })
        ));
    }
}
