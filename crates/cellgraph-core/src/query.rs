//! # Query Predicate Builder
//!
//! Composable filters over persisted documents.
//!
//! - Building is pure: no backend is touched until a store evaluates it
//! - `and`/`or` flatten nested combinators of the same kind, drop
//!   duplicates and collapse trivial cases
//! - `Filter::matches` evaluates in-process (used by the bundled stores)
//! - `Filter::to_native` renders the Mongo-style structure as a `Value`
//!
//! Field names may be dotted (`"stats.mean"`) to reach into nested maps.

use crate::storage::Document;
use crate::{CellError, Value, ValueKind};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

// =============================================================================
// PATTERN
// =============================================================================

/// A compiled regular expression that remembers its source.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    compiled: Regex,
}

impl Pattern {
    /// Compile `source`, failing with `CellError::InvalidPattern`.
    pub fn new(source: impl Into<String>) -> Result<Self, CellError> {
        let source = source.into();
        let compiled = Regex::new(&source).map_err(|e| CellError::InvalidPattern {
            pattern: source.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { source, compiled })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.is_match(text)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

// =============================================================================
// PREDICATE
// =============================================================================

/// A test applied to one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    /// `true`: the field is present. `false`: the field is absent.
    Exists(bool),
    Regex(Pattern),
    Mod { divisor: i64, remainder: i64 },
    Type(ValueKind),
}

impl Predicate {
    /// Evaluate against a field value (`None` when the field is absent).
    #[must_use]
    pub fn test(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Eq(target) => equals(value, target),
            Self::Ne(target) => !equals(value, target),
            Self::Gt(target) => ordered(value, target, |o| o == Ordering::Greater),
            Self::Gte(target) => ordered(value, target, |o| o != Ordering::Less),
            Self::Lt(target) => ordered(value, target, |o| o == Ordering::Less),
            Self::Lte(target) => ordered(value, target, |o| o != Ordering::Greater),
            Self::In(targets) => targets.iter().any(|t| equals(value, t)),
            Self::Nin(targets) => !targets.iter().any(|t| equals(value, t)),
            Self::Exists(present) => value.is_some() == *present,
            Self::Regex(pattern) => value
                .and_then(Value::as_str)
                .is_some_and(|text| pattern.is_match(text)),
            Self::Mod { divisor, remainder } => value
                .and_then(Value::as_int)
                .and_then(|n| n.checked_rem(*divisor))
                .is_some_and(|r| r == *remainder),
            Self::Type(kind) => value.is_some_and(|v| v.kind() == *kind),
        }
    }

    fn to_native(&self) -> Value {
        let (op, operand) = match self {
            Self::Eq(v) => ("$eq", v.clone()),
            Self::Ne(v) => ("$ne", v.clone()),
            Self::Gt(v) => ("$gt", v.clone()),
            Self::Gte(v) => ("$gte", v.clone()),
            Self::Lt(v) => ("$lt", v.clone()),
            Self::Lte(v) => ("$lte", v.clone()),
            Self::In(vs) => ("$in", Value::List(vs.clone())),
            Self::Nin(vs) => ("$nin", Value::List(vs.clone())),
            Self::Exists(b) => ("$exists", Value::Bool(*b)),
            Self::Regex(p) => ("$regex", Value::from(p.as_str())),
            Self::Mod { divisor, remainder } => (
                "$mod",
                Value::List(vec![Value::Int(*divisor), Value::Int(*remainder)]),
            ),
            Self::Type(kind) => ("$type", Value::from(kind.name())),
        };
        single(op, operand)
    }
}

/// Missing fields equal `Null`, like a document database treats them.
fn equals(value: Option<&Value>, target: &Value) -> bool {
    match value {
        Some(v) => v.compare(target) == Some(Ordering::Equal),
        None => matches!(target, Value::Null),
    }
}

fn ordered(value: Option<&Value>, target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    value.and_then(|v| v.compare(target)).is_some_and(accept)
}

fn single(key: &str, value: Value) -> Value {
    Value::Map(BTreeMap::from([(key.to_string(), value)]))
}

// =============================================================================
// FILTER
// =============================================================================

/// A composable document filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Filter {
    /// Matches every document.
    #[default]
    Everything,
    /// Matches no document.
    Nothing,
    Field(String, Predicate),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Start a predicate on `name`.
    #[must_use]
    pub fn field(name: impl Into<String>) -> FieldFilter {
        FieldFilter { name: name.into() }
    }

    /// Conjunction of equalities.
    pub fn by_keyword<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::and(
            pairs
                .into_iter()
                .map(|(k, v)| Self::Field(k.into(), Predicate::Eq(v.into()))),
        )
    }

    /// Conjunction, flattened and deduplicated.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut parts = Vec::new();
        for filter in filters {
            match filter {
                Self::Everything => {}
                Self::Nothing => return Self::Nothing,
                Self::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        collapse(dedup(parts), Self::Everything, Self::And)
    }

    /// Disjunction, flattened and deduplicated.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut parts = Vec::new();
        for filter in filters {
            match filter {
                Self::Nothing => {}
                Self::Everything => return Self::Everything,
                Self::Or(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        collapse(dedup(parts), Self::Nothing, Self::Or)
    }

    /// Negation. Double negation cancels.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Everything => Self::Nothing,
            Self::Nothing => Self::Everything,
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// Evaluate against a document.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::Everything => true,
            Self::Nothing => false,
            Self::Field(name, predicate) => predicate.test(lookup(document, name)),
            Self::And(parts) => parts.iter().all(|f| f.matches(document)),
            Self::Or(parts) => parts.iter().any(|f| f.matches(document)),
            Self::Not(inner) => !inner.matches(document),
        }
    }

    /// Mongo-style rendering of this filter.
    #[must_use]
    pub fn to_native(&self) -> Value {
        match self {
            Self::Everything => Value::Map(BTreeMap::new()),
            Self::Nothing => single("$expr", Value::Bool(false)),
            Self::Field(name, predicate) => single(name, predicate.to_native()),
            Self::And(parts) => single("$and", natives(parts)),
            Self::Or(parts) => single("$or", natives(parts)),
            Self::Not(inner) => single("$nor", Value::List(vec![inner.to_native()])),
        }
    }
}

fn natives(parts: &[Filter]) -> Value {
    Value::List(parts.iter().map(Filter::to_native).collect())
}

fn dedup(parts: Vec<Filter>) -> Vec<Filter> {
    let mut unique: Vec<Filter> = Vec::with_capacity(parts.len());
    for part in parts {
        if !unique.contains(&part) {
            unique.push(part);
        }
    }
    unique
}

fn collapse(mut parts: Vec<Filter>, empty: Filter, wrap: fn(Vec<Filter>) -> Filter) -> Filter {
    match parts.len() {
        0 => empty,
        1 => parts.pop().unwrap_or(empty),
        _ => wrap(parts),
    }
}

/// Resolve a dotted path inside a document.
fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    if let Some(value) = document.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_map()?.get(part)?;
    }
    Some(current)
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Self) -> Self::Output {
        Filter::and([self, rhs])
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Self) -> Self::Output {
        Filter::or([self, rhs])
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Self::Output {
        self.negate()
    }
}

// =============================================================================
// FIELD BUILDER
// =============================================================================

/// Builder returned by [`Filter::field`].
#[derive(Debug, Clone)]
pub struct FieldFilter {
    name: String,
}

impl FieldFilter {
    fn with(self, predicate: Predicate) -> Filter {
        Filter::Field(self.name, predicate)
    }

    #[must_use]
    pub fn eq(self, value: impl Into<Value>) -> Filter {
        self.with(Predicate::Eq(value.into()))
    }

    #[must_use]
    pub fn ne(self, value: impl Into<Value>) -> Filter {
        self.with(Predicate::Ne(value.into()))
    }

    #[must_use]
    pub fn gt(self, value: impl Into<Value>) -> Filter {
        self.with(Predicate::Gt(value.into()))
    }

    #[must_use]
    pub fn gte(self, value: impl Into<Value>) -> Filter {
        self.with(Predicate::Gte(value.into()))
    }

    #[must_use]
    pub fn lt(self, value: impl Into<Value>) -> Filter {
        self.with(Predicate::Lt(value.into()))
    }

    #[must_use]
    pub fn lte(self, value: impl Into<Value>) -> Filter {
        self.with(Predicate::Lte(value.into()))
    }

    #[must_use]
    pub fn is_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Filter {
        self.with(Predicate::In(values.into_iter().map(Into::into).collect()))
    }

    #[must_use]
    pub fn not_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Filter {
        self.with(Predicate::Nin(values.into_iter().map(Into::into).collect()))
    }

    #[must_use]
    pub fn exists(self) -> Filter {
        self.with(Predicate::Exists(true))
    }

    #[must_use]
    pub fn missing(self) -> Filter {
        self.with(Predicate::Exists(false))
    }

    /// Text match; the pattern is compiled here, not at evaluation.
    pub fn regex(self, pattern: impl Into<String>) -> Result<Filter, CellError> {
        Ok(self.with(Predicate::Regex(Pattern::new(pattern)?)))
    }

    /// Integer fields with `value % divisor == remainder`.
    #[must_use]
    pub fn modulo(self, divisor: i64, remainder: i64) -> Filter {
        self.with(Predicate::Mod { divisor, remainder })
    }

    #[must_use]
    pub fn of_type(self, kind: ValueKind) -> Filter {
        self.with(Predicate::Type(kind))
    }
}

// =============================================================================
// TESTS
// =============================================================================
