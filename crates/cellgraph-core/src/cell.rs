//! # Cells
//!
//! A `Cell` is one computation unit: a function, its named inputs, the keys
//! its result is stored under, and the memoized outputs.
//!
//! Cells are plain values. Evaluation, caching and persistence happen in the
//! `Context`, which owns the memo store and the dependency graph; a cell only
//! knows how to describe itself and how to unpack a raw result.
//!
//! ## States
//!
//! - **bare**: some declared output key is missing (`run()` is true)
//! - **computed**: every output key is present
//! - **stale-persisted**: a cached or persisted copy exists that may predate
//!   the in-hand inputs; `load` resolves it with the merge rule

use crate::address::{self, Address};
use crate::function::Function;
use crate::primitives::DEFAULT_OUTPUT_KEY;
use crate::{CellError, Timestamp, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// INPUT
// =============================================================================

/// A named input: plain data, another cell, or a container of either.
#[derive(Debug, Clone)]
pub enum Input {
    /// Plain data.
    Data(Value),
    /// An upstream cell, materialized before the function runs.
    Cell(Box<Cell>),
    /// An upstream cell known only by address (rehydrated records).
    Ref(Address),
    /// A list of inputs.
    List(Vec<Input>),
    /// A mapping of inputs.
    Map(BTreeMap<String, Input>),
}

impl Input {
    /// The value handed to a function for this input.
    ///
    /// Upstream cells contribute their value; a `Ref` must have been
    /// materialized into a `Cell` first.
    pub fn value(&self) -> Result<Value, CellError> {
        match self {
            Self::Data(value) => Ok(value.clone()),
            Self::Cell(cell) => cell.value(),
            Self::Ref(address) => Err(CellError::NotComputed(address.to_string())),
            Self::List(items) => items
                .iter()
                .map(Self::value)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Self::Map(items) => items
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.value()?)))
                .collect::<Result<BTreeMap<_, _>, CellError>>()
                .map(Value::Map),
        }
    }

    /// Addresses of every upstream cell this input refers to.
    ///
    /// Unaddressable upstream cells are not shared and contribute nothing.
    pub fn upstream(&self, out: &mut BTreeSet<Address>) -> Result<(), CellError> {
        match self {
            Self::Data(_) => {}
            Self::Cell(cell) => {
                if let Some(address) = cell.address()? {
                    out.insert(address);
                }
            }
            Self::Ref(address) => {
                out.insert(address.clone());
            }
            Self::List(items) => {
                for item in items {
                    item.upstream(out)?;
                }
            }
            Self::Map(items) => {
                for item in items.values() {
                    item.upstream(out)?;
                }
            }
        }
        Ok(())
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<i64> for Input {
    fn from(i: i64) -> Self {
        Self::Data(Value::Int(i))
    }
}

impl From<i32> for Input {
    fn from(i: i32) -> Self {
        Self::Data(Value::from(i))
    }
}

impl From<f64> for Input {
    fn from(x: f64) -> Self {
        Self::Data(Value::Float(x))
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Self::Data(Value::from(s))
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Self::Data(Value::Text(s))
    }
}

impl From<Cell> for Input {
    fn from(cell: Cell) -> Self {
        Self::Cell(Box::new(cell))
    }
}

impl From<&Cell> for Input {
    fn from(cell: &Cell) -> Self {
        Self::Cell(Box::new(cell.clone()))
    }
}

impl From<Address> for Input {
    fn from(address: Address) -> Self {
        Self::Ref(address)
    }
}

impl From<Vec<Cell>> for Input {
    fn from(cells: Vec<Cell>) -> Self {
        Self::List(cells.into_iter().map(Self::from).collect())
    }
}

// =============================================================================
// CELL
// =============================================================================

/// A memoized computation.
#[derive(Debug, Clone)]
pub struct Cell {
    /// The wrapped function; `None` makes the cell a literal data holder.
    pub function: Option<Arc<Function>>,
    /// Named inputs.
    pub inputs: BTreeMap<String, Input>,
    /// Field names forming the identity; `None` means unaddressable.
    pub primary_key: Option<BTreeSet<String>>,
    /// Keys the function result is stored under.
    pub output_keys: Vec<String>,
    /// Computed outputs, empty until computed.
    pub outputs: BTreeMap<String, Value>,
    /// When the outputs were computed.
    pub updated_at: Option<Timestamp>,
    /// Caller-defined fields, usable as primary-key fields.
    pub extra: BTreeMap<String, Value>,
    /// Persistence collection.
    pub locator: Option<String>,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            function: None,
            inputs: BTreeMap::new(),
            primary_key: None,
            output_keys: vec![DEFAULT_OUTPUT_KEY.to_string()],
            outputs: BTreeMap::new(),
            updated_at: None,
            extra: BTreeMap::new(),
            locator: None,
        }
    }
}

impl Cell {
    /// A bare cell wrapping `function`.
    #[must_use]
    pub fn new(function: Arc<Function>) -> Self {
        Self {
            function: Some(function),
            ..Self::default()
        }
    }

    /// A function-less cell holding `value` under the default output key.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        let mut cell = Self::default();
        cell.outputs
            .insert(DEFAULT_OUTPUT_KEY.to_string(), value.into());
        cell
    }

    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, input: impl Into<Input>) -> Self {
        self.inputs.insert(name.into(), input.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_primary_key<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_output_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        if self.output_keys.is_empty() {
            self.output_keys.push(DEFAULT_OUTPUT_KEY.to_string());
        }
        self
    }

    /// Persist this cell in `collection`.
    #[must_use]
    pub fn stored_in(mut self, collection: impl Into<String>) -> Self {
        self.locator = Some(collection.into());
        self
    }

    /// Replace one input. Outputs are kept: use `push` or a forcing `go`
    /// to recompute.
    pub fn set_input(&mut self, name: impl Into<String>, input: impl Into<Input>) {
        self.inputs.insert(name.into(), input.into());
    }

    pub fn set_extra(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(name.into(), value.into());
    }

    /// True iff some declared output key is absent.
    #[must_use]
    pub fn run(&self) -> bool {
        self.output_keys
            .iter()
            .any(|key| !self.outputs.contains_key(key))
    }

    /// The cell's address, if it has a primary key.
    pub fn address(&self) -> Result<Option<Address>, CellError> {
        address::resolve(self)
    }

    #[must_use]
    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// Name of the wrapped function, if any.
    #[must_use]
    pub fn function_name(&self) -> Option<&str> {
        self.function.as_deref().map(Function::name)
    }

    /// The single output, or a map of all outputs for multi-output cells.
    pub fn value(&self) -> Result<Value, CellError> {
        if self.run() {
            return Err(CellError::NotComputed(self.describe()));
        }
        match self.output_keys.as_slice() {
            [key] => Ok(self.outputs.get(key).cloned().unwrap_or_default()),
            keys => Ok(Value::Map(
                keys.iter()
                    .filter_map(|k| self.outputs.get(k).map(|v| (k.clone(), v.clone())))
                    .collect(),
            )),
        }
    }

    /// Store a raw function result under the declared output keys.
    ///
    /// One key stores the result wholesale; several keys require a map
    /// containing each of them.
    pub fn unpack(&mut self, raw: Value) -> Result<(), CellError> {
        if let [key] = self.output_keys.as_slice() {
            self.outputs.insert(key.clone(), raw);
            return Ok(());
        }

        let shape_error = || CellError::OutputShape {
            function: self.function_name().unwrap_or("<literal>").to_string(),
            expected: self.output_keys.clone(),
        };
        let Value::Map(mut map) = raw else {
            return Err(shape_error());
        };
        if self.output_keys.iter().any(|k| !map.contains_key(k)) {
            return Err(shape_error());
        }
        let outputs = self
            .output_keys
            .iter()
            .filter_map(|k| map.remove(k).map(|v| (k.clone(), v)))
            .collect();
        self.outputs = outputs;
        Ok(())
    }

    /// Combine a cached copy with the copy in hand.
    ///
    /// The copy with the more recent `updated_at` wins. Without a decisive
    /// timestamp the cached copy wins. The winner keeps the other copy's
    /// function when its own is unset.
    #[must_use]
    pub fn merge(cached: Cell, in_hand: Cell) -> Cell {
        let in_hand_newer = match (cached.updated_at, in_hand.updated_at) {
            (Some(c), Some(h)) => h > c,
            (None, Some(_)) => true,
            _ => false,
        };
        let (mut winner, loser) = if in_hand_newer {
            (in_hand, cached)
        } else {
            (cached, in_hand)
        };
        if winner.function.is_none() {
            winner.function = loser.function;
        }
        winner
    }

    /// Human-readable identity for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.address() {
            Ok(Some(address)) => address.to_string(),
            _ => format!("<unaddressed {}>", self.function_name().unwrap_or("literal")),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
