//! # Cell Records
//!
//! Mapping between a `Cell` and the document persisted for it.
//!
//! Layout of a record:
//! - primary-key fields, top level, plain values (so filters can match them)
//! - one top-level field per output key, holding a tagged payload
//! - `_fn`, `_pk`, `_outputs`: the cell's shape
//! - `_inputs`: encoded inputs; upstream cells become `{_ref: address}`
//! - `_extra`: caller fields that are not part of the primary key
//!
//! `_updated`, `deleted` and `_id` belong to the versioning layer.

use crate::address::Address;
use crate::cell::{Cell, Input};
use crate::formats::{CodecRegistry, is_tagged};
use crate::function::Registry;
use crate::primitives::{
    DELETED_FIELD, EXTRA_FIELD, FUNCTION_FIELD, ID_FIELD, INPUTS_FIELD, OUTPUTS_FIELD,
    PRIMARY_KEY_FIELD, REF_MARKER, UPDATED_FIELD,
};
use crate::storage::Document;
use crate::{CellError, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Wrapper key marking a mapping of inputs inside `_inputs`.
const INPUT_MAP_MARKER: &str = "_m";

const RESERVED: [&str; 9] = [
    ID_FIELD,
    DELETED_FIELD,
    UPDATED_FIELD,
    FUNCTION_FIELD,
    PRIMARY_KEY_FIELD,
    OUTPUTS_FIELD,
    INPUTS_FIELD,
    EXTRA_FIELD,
    REF_MARKER,
];

/// True for field names the record layout reserves.
#[must_use]
pub fn is_reserved(field: &str) -> bool {
    RESERVED.contains(&field)
}

fn text_list<'a>(items: impl IntoIterator<Item = &'a String>) -> Value {
    Value::List(items.into_iter().cloned().map(Value::Text).collect())
}

// =============================================================================
// ENCODE
// =============================================================================

/// Build the document for `cell`, whose resolved address is `address`.
pub fn encode_cell(
    cell: &Cell,
    address: &Address,
    codecs: &CodecRegistry,
) -> Result<Document, CellError> {
    let mut document = Document::new();

    for (key, value) in &address.fields {
        document.insert(key.clone(), value.clone());
    }

    for key in &cell.output_keys {
        if is_reserved(key) || document.contains_key(key) {
            return Err(CellError::SerializationError(format!(
                "output key '{key}' collides with a key or reserved field of {address}"
            )));
        }
        let value = cell
            .outputs
            .get(key)
            .ok_or_else(|| CellError::NotComputed(address.to_string()))?;
        document.insert(key.clone(), codecs.encode(value)?);
    }

    document.insert(
        FUNCTION_FIELD.to_string(),
        cell.function_name()
            .map_or(Value::Null, |name| Value::from(name)),
    );
    document.insert(
        PRIMARY_KEY_FIELD.to_string(),
        text_list(cell.primary_key.iter().flatten()),
    );
    document.insert(OUTPUTS_FIELD.to_string(), text_list(&cell.output_keys));

    let inputs = cell
        .inputs
        .iter()
        .map(|(name, input)| Ok((name.clone(), encode_input(input, codecs)?)))
        .collect::<Result<BTreeMap<_, _>, CellError>>()?;
    document.insert(INPUTS_FIELD.to_string(), Value::Map(inputs));

    let key_names: BTreeSet<&str> = address.fields.iter().map(|(k, _)| k.as_str()).collect();
    let extra = cell
        .extra
        .iter()
        .filter(|(name, _)| !key_names.contains(name.as_str()))
        .map(|(name, value)| Ok((name.clone(), codecs.encode(value)?)))
        .collect::<Result<BTreeMap<_, _>, CellError>>()?;
    document.insert(EXTRA_FIELD.to_string(), Value::Map(extra));

    Ok(document)
}

/// Encode one input.
///
/// Addressed upstream cells are stored by reference only. An unaddressed
/// upstream cell cannot be found again, so its current value is stored.
pub fn encode_input(input: &Input, codecs: &CodecRegistry) -> Result<Value, CellError> {
    match input {
        Input::Data(value) => codecs.encode(value),
        Input::Cell(cell) => match cell.address()? {
            Some(address) => Ok(reference(&address)),
            None => codecs.encode(&cell.value()?),
        },
        Input::Ref(address) => Ok(reference(address)),
        Input::List(items) => items
            .iter()
            .map(|item| encode_input(item, codecs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Input::Map(items) => {
            let encoded = items
                .iter()
                .map(|(k, v)| Ok((k.clone(), encode_input(v, codecs)?)))
                .collect::<Result<BTreeMap<_, _>, CellError>>()?;
            Ok(Value::Map(BTreeMap::from([(
                INPUT_MAP_MARKER.to_string(),
                Value::Map(encoded),
            )])))
        }
    }
}

fn reference(address: &Address) -> Value {
    Value::Map(BTreeMap::from([(
        REF_MARKER.to_string(),
        address.to_value(),
    )]))
}

// =============================================================================
// DECODE
// =============================================================================

/// Rebuild a cell from its persisted record.
///
/// The function is looked up by name in `registry`. An unknown name leaves
/// the cell without a function: its stored outputs stay readable but it
/// cannot be recomputed.
pub fn decode_cell(
    collection: &str,
    document: &Document,
    registry: &Registry,
    codecs: &CodecRegistry,
) -> Result<Cell, CellError> {
    let names = |field: &str| -> Result<Vec<String>, CellError> {
        match document.get(field) {
            Some(Value::List(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        CellError::DeserializationError(format!("'{field}' holds {v}"))
                    })
                })
                .collect(),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(CellError::DeserializationError(format!(
                "'{field}' holds {other}"
            ))),
        }
    };

    let function = match document.get(FUNCTION_FIELD) {
        Some(Value::Text(name)) => {
            let found = registry.get(name);
            if found.is_none() {
                warn!(function = %name, collection, "record names an unregistered function");
            }
            found
        }
        _ => None,
    };

    let primary_key: BTreeSet<String> = names(PRIMARY_KEY_FIELD)?.into_iter().collect();
    let output_keys = names(OUTPUTS_FIELD)?;

    let mut outputs = BTreeMap::new();
    for key in &output_keys {
        if let Some(encoded) = document.get(key) {
            outputs.insert(key.clone(), codecs.decode(encoded)?);
        }
    }

    let inputs = match document.get(INPUTS_FIELD) {
        Some(Value::Map(encoded)) => encoded
            .iter()
            .map(|(name, value)| Ok((name.clone(), decode_input(value, codecs)?)))
            .collect::<Result<BTreeMap<_, _>, CellError>>()?,
        _ => BTreeMap::new(),
    };

    let mut extra = match document.get(EXTRA_FIELD) {
        Some(Value::Map(encoded)) => encoded
            .iter()
            .map(|(name, value)| Ok((name.clone(), codecs.decode(value)?)))
            .collect::<Result<BTreeMap<_, _>, CellError>>()?,
        _ => BTreeMap::new(),
    };
    for key in &primary_key {
        if inputs.contains_key(key) {
            continue;
        }
        if let Some(value) = document.get(key) {
            extra.insert(key.clone(), value.clone());
        }
    }

    let updated_at = match document.get(UPDATED_FIELD) {
        Some(Value::Time(t)) => Some(*t),
        _ => None,
    };

    let mut cell = Cell {
        function,
        inputs,
        primary_key: (!primary_key.is_empty()).then_some(primary_key),
        outputs,
        updated_at,
        extra,
        locator: Some(collection.to_string()),
        ..Cell::default()
    };
    if !output_keys.is_empty() {
        cell.output_keys = output_keys;
    }
    Ok(cell)
}

/// Decode one input written by [`encode_input`].
pub fn decode_input(value: &Value, codecs: &CodecRegistry) -> Result<Input, CellError> {
    if is_tagged(value) {
        return codecs.decode(value).map(Input::Data);
    }
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| decode_input(item, codecs))
            .collect::<Result<Vec<_>, _>>()
            .map(Input::List),
        Value::Map(map) => {
            if let Some(address) = map.get(REF_MARKER) {
                return Address::from_value(address).map(Input::Ref);
            }
            if let Some(Value::Map(items)) = map.get(INPUT_MAP_MARKER) {
                return items
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), decode_input(v, codecs)?)))
                    .collect::<Result<BTreeMap<_, _>, CellError>>()
                    .map(Input::Map);
            }
            Err(CellError::DeserializationError(format!(
                "unrecognised input encoding: {value}"
            )))
        }
        other => Err(CellError::DeserializationError(format!(
            "unrecognised input encoding: {other}"
        ))),
    }
}

// =============================================================================
// TESTS
// =============================================================================
