//! # Derived Fields
//!
//! Compute named fields from other fields. Each derived field is a
//! `Function` whose parameters name the fields it reads, which may be plain
//! values or other derived fields. Evaluation follows dependency order.

use crate::function::Function;
use crate::{CellError, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Resolve `derived` on top of `values`.
///
/// Returns `values` extended with every derived field. A derived field
/// shadows a plain value of the same name. Fails with
/// `CellError::CircularDependency` when derived fields read each other in
/// a loop.
pub fn resolve_fields(
    values: &BTreeMap<String, Value>,
    derived: &BTreeMap<String, Arc<Function>>,
) -> Result<BTreeMap<String, Value>, CellError> {
    let mut resolved = values.clone();
    for name in derived.keys() {
        resolved.remove(name);
    }
    let mut pending: BTreeSet<&String> = derived.keys().collect();

    while !pending.is_empty() {
        let ready: Vec<&String> = pending
            .iter()
            .copied()
            .filter(|name| {
                derived[*name]
                    .params()
                    .iter()
                    .all(|p| !pending.contains(&p.name) || p.name == **name)
            })
            .collect();

        if ready.is_empty() {
            return Err(CellError::CircularDependency(
                pending.into_iter().cloned().collect(),
            ));
        }

        for name in ready {
            let function = &derived[name];
            if function.params().iter().any(|p| p.name == *name) {
                return Err(CellError::CircularDependency(vec![name.clone()]));
            }
            let value = function.call(&resolved)?;
            resolved.insert(name.clone(), value);
            pending.remove(name);
        }
    }

    Ok(resolved)
}
