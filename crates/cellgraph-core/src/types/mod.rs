//! # Core Type Definitions
//!
//! This module contains the plain-data types every other module builds on:
//! - Time (`Timestamp`)
//! - Data flowing through cells (`Value`, `ValueKind`, `NumArray`, `Table`)
//! - Error types (`CellError`)
//!
//! ## Ordering Guarantees
//!
//! `Value` implements a total order (floats compare with `f64::total_cmp`)
//! so that values can be part of an `Address` and live in `BTreeMap` keys.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

// =============================================================================
// TIME
// =============================================================================

/// A point in time, in microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Create a timestamp from raw microseconds.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Get the raw microsecond value.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// =============================================================================
// STRUCTURED PAYLOADS
// =============================================================================

/// A dense numeric array with an explicit shape (row-major).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NumArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NumArray {
    /// Create a one-dimensional array.
    #[must_use]
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A minimal column-oriented table: named columns and rows of values.
///
/// Bulk table manipulation lives outside this crate; cells only need to
/// carry, persist and offload tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Create an empty table with the given columns.
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row. Rows shorter or longer than the header are rejected.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), CellError> {
        if row.len() != self.columns.len() {
            return Err(CellError::SerializationError(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// `(rows, columns)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }
}

// =============================================================================
// VALUE
// =============================================================================

/// The kind of a `Value`, used by type-match predicates and codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Time,
    List,
    Map,
    Array,
    Table,
}

impl ValueKind {
    /// Lowercase name, also used as the default codec tag.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "blob",
            Self::Time => "time",
            Self::List => "list",
            Self::Map => "map",
            Self::Array => "array",
            Self::Table => "table",
        }
    }
}

/// Plain data carried by cell inputs, outputs and persisted documents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Time(Timestamp),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Array(NumArray),
    Table(Table),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Time(_) => ValueKind::Time,
            Self::List(_) => ValueKind::List,
            Self::Map(_) => ValueKind::Map,
            Self::Array(_) => ValueKind::Array,
            Self::Table(_) => ValueKind::Table,
        }
    }

    /// Scalars are the only values allowed in an address.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            Self::List(_) | Self::Map(_) | Self::Array(_) | Self::Table(_)
        )
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Comparison used by query predicates.
    ///
    /// Unlike `Ord`, integers and floats compare numerically and values of
    /// unrelated kinds are incomparable.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                self.as_float()?.partial_cmp(&other.as_float()?)
            }
            _ if self.kind() == other.kind() => Some(self.cmp(other)),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        self.kind() as u8
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Map(a), Self::Map(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a.shape.cmp(&b.shape).then_with(|| {
                a.data
                    .iter()
                    .zip(&b.data)
                    .map(|(x, y)| x.total_cmp(y))
                    .find(|o| o.is_ne())
                    .unwrap_or_else(|| a.data.len().cmp(&b.data.len()))
            }),
            (Self::Table(a), Self::Table(b)) => a.columns.cmp(&b.columns).then_with(|| a.rows.cmp(&b.rows)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::Time(t) => t.hash(state),
            Self::List(l) => l.hash(state),
            Self::Map(m) => m.hash(state),
            Self::Array(a) => {
                a.shape.hash(state);
                for x in &a.data {
                    x.to_bits().hash(state);
                }
            }
            Self::Table(t) => {
                t.columns.hash(state);
                t.rows.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Time(t) => write!(f, "{t}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Array(a) => write!(f, "<array {:?}>", a.shape),
            Self::Table(t) => {
                let (rows, cols) = t.shape();
                write!(f, "<table {rows}x{cols}>")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Self::Time(t)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl From<NumArray> for Value {
    fn from(a: NumArray) -> Self {
        Self::Array(a)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Self::Table(t)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the cellgraph system.
///
/// - No silent failures: `go` on a function-less cell and `load` in
///   `IfExists` mode are the only places that degrade instead of failing
/// - Messages carry the address and the key set involved
#[derive(Debug, Error)]
pub enum CellError {
    /// A primary-key field required for persistence is absent.
    #[error("Missing key field(s) {missing:?} for {address} (primary key {keys:?})")]
    MissingKey {
        address: String,
        keys: Vec<String>,
        missing: Vec<String>,
    },

    /// More than one live record matches a primary-key value set.
    #[error("{count} live records in '{collection}' for key {key}")]
    Ambiguity {
        collection: String,
        key: String,
        count: usize,
    },

    /// Nothing found for a required load or a point-in-time query.
    #[error("Not found: {address}{}", as_of_suffix(.as_of))]
    NotFound {
        address: String,
        as_of: Option<Timestamp>,
    },

    /// The primary-key declaration cannot produce a comparable identity.
    #[error("Identity error on field '{field}' (primary key {keys:?}): {reason}")]
    Identity {
        field: String,
        keys: Vec<String>,
        reason: String,
    },

    /// Derived fields depend on each other in a loop, or the DAG has a cycle.
    #[error("Circular dependency between {0:?}")]
    CircularDependency(Vec<String>),

    /// A declared parameter has neither an input nor a default.
    #[error("Function '{function}' is missing argument '{param}'")]
    MissingArgument { function: String, param: String },

    /// A multi-output function did not return a mapping with every key.
    #[error("Function '{function}' output does not provide keys {expected:?}")]
    OutputShape {
        function: String,
        expected: Vec<String>,
    },

    /// A cell's value was requested before it was computed.
    #[error("Cell {0} has no computed outputs")]
    NotComputed(String),

    /// A cell read back from persistence must be recomputed, but the
    /// function its record names is not registered.
    #[error("No registered function to recompute {0}")]
    UnknownFunction(String),

    /// A wrapped function reported a failure.
    #[error("Function '{function}' failed: {message}")]
    Function { function: String, message: String },

    /// A regular expression predicate could not be compiled.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// The document store backend failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

fn as_of_suffix(as_of: &Option<Timestamp>) -> String {
    as_of.map(|t| format!(" as of {t}")).unwrap_or_default()
}

// =============================================================================
// TESTS
// =============================================================================
