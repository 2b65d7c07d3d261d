//! # cellgraph-core
//!
//! Memoized computation cells chained into a dependency graph.
//!
//! A [`Cell`] wraps a function, its named inputs (plain data or other
//! cells) and its computed outputs. A [`Context`] evaluates cells, memoizes
//! them by [`Address`], records which cells read which in a [`Dag`], and
//! optionally persists every computed version through [`Versioned`].
//!
//! ## Layers
//!
//! - `types`, `primitives`: values, errors, reserved field names
//! - `cell`, `address`, `function`: the computation unit and its identity
//! - `dag`, `memo`, `context`: evaluation, caching, push/pull invalidation
//! - `query`, `storage`, `formats`, `record`: the document store seam
//! - `versioned`: append-only history with point-in-time reads
//! - `asynchronous` (feature `async`): the same over a suspending store
//!
//! ## Constraints
//!
//! - Deterministic: ordered collections only, addresses are totally ordered
//! - No globals: every cache is owned by a `Context`
//! - Graph walking is synchronous; only the store boundary may suspend

// =============================================================================
// MODULES
// =============================================================================

pub mod address;
#[cfg(feature = "async")]
pub mod asynchronous;
pub mod cell;
pub mod clock;
pub mod config;
pub mod context;
pub mod dag;
pub mod fields;
pub mod formats;
pub mod function;
pub mod memo;
pub mod primitives;
pub mod query;
pub mod record;
pub mod storage;
pub mod types;
pub mod versioned;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{CellError, NumArray, Table, Timestamp, Value, ValueKind};

// =============================================================================
// RE-EXPORTS: Cells and Evaluation
// =============================================================================

pub use address::Address;
pub use cell::{Cell, Input};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use context::{Context, LoadMode, Persistence};
pub use dag::{Dag, EdgeLabel, Generations};
pub use fields::resolve_fields;
pub use function::{Args, Function, Param, Registry};
pub use memo::MemoStore;

// =============================================================================
// RE-EXPORTS: Persistence
// =============================================================================

pub use formats::{CodecRegistry, DocumentHeader, document_from_bytes, document_to_bytes};
pub use query::{FieldFilter, Filter, Pattern, Predicate};
pub use storage::{
    BlobStore, Document, DocumentStore, FsBlobStore, MemoryBlobStore, MemoryStore, PathTemplate,
    RedbStore,
};
pub use versioned::{VersionPolicy, Versioned};

#[cfg(feature = "async")]
pub use asynchronous::{AsyncContext, AsyncDocumentStore, AsyncVersioned, Shared};
