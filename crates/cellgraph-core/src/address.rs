//! # Address Resolver
//!
//! An `Address` is the identity of a cell: the sorted `(key, value)` pairs of
//! its declared primary-key fields, prefixed by the persistence locator when
//! the cell is stored in a collection.
//!
//! Two cells with the same locator and the same key values share one memo
//! slot and one live record. A cell without a primary key has no address.

use crate::cell::{Cell, Input};
use crate::{CellError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Persistence collection, if the cell is persisted.
    pub locator: Option<String>,
    /// Primary-key pairs, sorted by key.
    pub fields: Vec<(String, Value)>,
}

impl Address {
    /// Build an address, sorting the pairs by key.
    #[must_use]
    pub fn new(
        locator: Option<String>,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        let mut fields: Vec<_> = fields.into_iter().collect();
        fields.sort();
        fields.dedup_by(|a, b| a.0 == b.0);
        Self { locator, fields }
    }

    /// Value of one key field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Key names in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.fields.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Encode as a plain value so it can be embedded in a document.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "locator".to_string(),
            self.locator.clone().map(Value::Text).unwrap_or(Value::Null),
        );
        map.insert(
            "fields".to_string(),
            Value::List(
                self.fields
                    .iter()
                    .map(|(k, v)| Value::List(vec![Value::Text(k.clone()), v.clone()]))
                    .collect(),
            ),
        );
        Value::Map(map)
    }

    /// Decode an address produced by [`Address::to_value`].
    pub fn from_value(value: &Value) -> Result<Self, CellError> {
        let bad = || CellError::DeserializationError(format!("not an address: {value}"));
        let map = value.as_map().ok_or_else(bad)?;
        let locator = match map.get("locator") {
            Some(Value::Text(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(_) => return Err(bad()),
        };
        let Some(Value::List(pairs)) = map.get("fields") else {
            return Err(bad());
        };
        let mut fields = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match pair {
                Value::List(kv) if kv.len() == 2 => {
                    let key = kv[0].as_str().ok_or_else(bad)?;
                    fields.push((key.to_string(), kv[1].clone()));
                }
                _ => return Err(bad()),
            }
        }
        Ok(Self::new(locator, fields))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(locator) = &self.locator {
            write!(f, "{locator}")?;
        }
        write!(f, "[")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "]")
    }
}

/// Resolve the address of a cell.
///
/// Key values come from the cell's data inputs first, then from its `extra`
/// fields. Declared keys that are absent are skipped here; persistence
/// rejects them later with `MissingKey`.
///
/// Fails with `CellError::Identity` when a key field holds a non-scalar
/// value or an input cell.
pub fn resolve(cell: &Cell) -> Result<Option<Address>, CellError> {
    let Some(keys) = &cell.primary_key else {
        return Ok(None);
    };

    let mut fields = Vec::with_capacity(keys.len());
    for key in keys {
        let value = match cell.inputs.get(key) {
            Some(Input::Data(value)) => Some(value),
            Some(_) => {
                return Err(CellError::Identity {
                    field: key.clone(),
                    keys: keys.iter().cloned().collect(),
                    reason: "key input refers to a cell or a container of inputs".to_string(),
                });
            }
            None => cell.extra.get(key),
        };

        if let Some(value) = value {
            if !value.is_scalar() {
                return Err(CellError::Identity {
                    field: key.clone(),
                    keys: keys.iter().cloned().collect(),
                    reason: format!("{} values are not comparable keys", value.kind().name()),
                });
            }
            fields.push((key.clone(), value.clone()));
        }
    }

    Ok(Some(Address::new(cell.locator.clone(), fields)))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;

    fn identity() -> std::sync::Arc<Function> {
        Function::new("identity", ["x"], |args| Ok(args.get("x")?.clone()))
    }

    #[test]
    fn no_primary_key_means_no_address() {
        let cell = Cell::new(identity()).with_input("x", 1);
        assert_eq!(resolve(&cell).expect("resolve"), None);
    }

    #[test]
    fn address_is_sorted_and_prefixed() {
        let cell = Cell::new(identity())
            .with_input("x", 1)
            .with_extra("name", "b")
            .with_extra("region", "eu")
            .with_primary_key(["region", "name"])
            .stored_in("things");

        let address = resolve(&cell).expect("resolve").expect("address");
        assert_eq!(address.locator.as_deref(), Some("things"));
        assert_eq!(address.keys(), vec!["name".to_string(), "region".to_string()]);
        assert_eq!(address.to_string(), "things[name=b, region=eu]");
    }

    #[test]
    fn equal_keys_share_an_address() {
        let a = Cell::new(identity())
            .with_input("x", 1)
            .with_extra("key", "k")
            .with_primary_key(["key"]);
        let b = Cell::new(identity())
            .with_input("x", 99)
            .with_extra("key", "k")
            .with_primary_key(["key"]);
        assert_eq!(resolve(&a).expect("a"), resolve(&b).expect("b"));
    }

    #[test]
    fn non_key_mutation_keeps_the_address() {
        let mut cell = Cell::new(identity())
            .with_input("x", 1)
            .with_extra("key", "k")
            .with_extra("note", "first")
            .with_primary_key(["key"])
            .stored_in("things");
        let before = resolve(&cell).expect("before");

        cell.set_input("x", 2);
        cell.set_extra("note", "second");
        assert_eq!(resolve(&cell).expect("after"), before);

        cell.set_extra("key", "other");
        assert_ne!(resolve(&cell).expect("rekeyed"), before);
    }

    #[test]
    fn collection_key_is_an_identity_error() {
        let cell = Cell::new(identity())
            .with_input("x", Value::List(vec![Value::Int(1)]))
            .with_primary_key(["x"]);
        assert!(matches!(resolve(&cell), Err(CellError::Identity { .. })));
    }

    #[test]
    fn cell_valued_key_is_an_identity_error() {
        let upstream = Cell::literal(1);
        let cell = Cell::new(identity())
            .with_input("x", upstream)
            .with_primary_key(["x"]);
        assert!(matches!(resolve(&cell), Err(CellError::Identity { .. })));
    }

    #[test]
    fn value_round_trip() {
        let address = Address::new(
            Some("adds".into()),
            [("key".to_string(), Value::from("a")), ("n".to_string(), Value::Int(2))],
        );
        let decoded = Address::from_value(&address.to_value()).expect("decode");
        assert_eq!(decoded, address);
    }
}
