//! # Functions
//!
//! A `Function` is an opaque callable with an explicit parameter manifest:
//! its name, the parameter names it reads, and optional defaults. The
//! manifest is fixed at construction, so a cell never has to inspect a
//! callable to know which inputs to hand it.
//!
//! The `Registry` maps function names back to callables so that persisted
//! records (which only carry the name) can be rehydrated into live cells.

use crate::{CellError, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Signature of a wrapped computation.
pub type Body = dyn Fn(&Args) -> Result<Value, CellError> + Send + Sync;

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }
}

/// A named computation with its parameter manifest.
pub struct Function {
    name: String,
    params: Vec<Param>,
    body: Box<Body>,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Function {
    /// Wrap a closure whose parameters have no defaults.
    pub fn new<I, S, F>(name: impl Into<String>, params: I, body: F) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Args) -> Result<Value, CellError> + Send + Sync + 'static,
    {
        Self::with_params(name, params.into_iter().map(Param::new).collect(), body)
    }

    /// Wrap a closure with a full parameter manifest.
    pub fn with_params<F>(name: impl Into<String>, params: Vec<Param>, body: F) -> Arc<Self>
    where
        F: Fn(&Args) -> Result<Value, CellError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            params,
            body: Box::new(body),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Call with the resolved input values.
    ///
    /// Only declared parameters are passed; inputs the manifest does not
    /// mention are ignored.
    pub fn call(&self, inputs: &BTreeMap<String, Value>) -> Result<Value, CellError> {
        let mut values = BTreeMap::new();
        for param in &self.params {
            let value = inputs
                .get(&param.name)
                .or(param.default.as_ref())
                .ok_or_else(|| CellError::MissingArgument {
                    function: self.name.clone(),
                    param: param.name.clone(),
                })?;
            values.insert(param.name.clone(), value.clone());
        }

        let args = Args {
            function: self.name.clone(),
            values,
        };
        (self.body)(&args)
    }
}

/// Arguments handed to a function body.
#[derive(Debug, Clone)]
pub struct Args {
    function: String,
    values: BTreeMap<String, Value>,
}

impl Args {
    pub fn get(&self, name: &str) -> Result<&Value, CellError> {
        self.values
            .get(name)
            .ok_or_else(|| CellError::MissingArgument {
                function: self.function.clone(),
                param: name.to_string(),
            })
    }

    pub fn int(&self, name: &str) -> Result<i64, CellError> {
        let value = self.get(name)?;
        value.as_int().ok_or_else(|| self.mismatch(name, value, "int"))
    }

    pub fn float(&self, name: &str) -> Result<f64, CellError> {
        let value = self.get(name)?;
        value
            .as_float()
            .ok_or_else(|| self.mismatch(name, value, "float"))
    }

    pub fn text(&self, name: &str) -> Result<&str, CellError> {
        let value = self.get(name)?;
        value.as_str().ok_or_else(|| self.mismatch(name, value, "text"))
    }

    /// Build a failure attributed to this function.
    #[must_use]
    pub fn fail(&self, message: impl Into<String>) -> CellError {
        CellError::Function {
            function: self.function.clone(),
            message: message.into(),
        }
    }

    fn mismatch(&self, name: &str, value: &Value, expected: &str) -> CellError {
        self.fail(format!(
            "argument '{name}' is {}, expected {expected}",
            value.kind().name()
        ))
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Name → function lookup used to rehydrate persisted cells.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    functions: BTreeMap<String, Arc<Function>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under its own name, replacing any previous entry.
    pub fn register(&mut self, function: Arc<Function>) {
        self.functions.insert(function.name().to_string(), function);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Function>> {
        self.functions.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> Arc<Function> {
        Function::with_params(
            "add",
            vec![Param::new("a"), Param::with_default("b", 10)],
            |args| {
                let sum = args
                    .int("a")?
                    .checked_add(args.int("b")?)
                    .ok_or_else(|| args.fail("overflow"))?;
                Ok(Value::Int(sum))
            },
        )
    }

    #[test]
    fn defaults_fill_missing_inputs() {
        let inputs = BTreeMap::from([("a".to_string(), Value::Int(1))]);
        assert_eq!(add().call(&inputs).expect("call"), Value::Int(11));
    }

    #[test]
    fn undeclared_inputs_are_ignored() {
        let inputs = BTreeMap::from([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
            ("key".to_string(), Value::from("a")),
        ]);
        assert_eq!(add().call(&inputs).expect("call"), Value::Int(3));
    }

    #[test]
    fn missing_argument_is_reported() {
        let err = add().call(&BTreeMap::new()).expect_err("missing a");
        assert!(matches!(err, CellError::MissingArgument { ref param, .. } if param == "a"));
    }

    #[test]
    fn type_mismatch_is_a_function_error() {
        let inputs = BTreeMap::from([("a".to_string(), Value::from("one"))]);
        let err = add().call(&inputs).expect_err("text is not int");
        assert!(matches!(err, CellError::Function { .. }));
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = Registry::new();
        registry.register(add());
        assert!(registry.contains("add"));
        assert_eq!(registry.get("add").map(|f| f.params().len()), Some(2));
        assert!(registry.get("sub").is_none());
    }
}
