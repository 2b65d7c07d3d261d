//! # CLI Command Implementations
//!
//! Each command returns a JSON report; `print_report` renders it as JSON or
//! as indented text.

use crate::config::AppConfig;
use cellgraph_core::primitives::{DELETED_FIELD, FUNCTION_FIELD, OUTPUTS_FIELD, UPDATED_FIELD};
use cellgraph_core::storage::document_id;
use cellgraph_core::{
    Address, AsyncContext, AsyncVersioned, Cell, CellError, Document, Filter, Function, LoadMode,
    RedbStore, Registry, Shared, Timestamp, Value, VersionPolicy, Versioned,
};
use serde_json::json;
use std::sync::Arc;

/// Cell names of the demo chain, in dependency order.
pub const DEMO_CELLS: [&str; 5] = ["A", "B", "C", "D", "E"];

// =============================================================================
// RENDERING
// =============================================================================

/// Plain JSON rendering of a cell value.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(x) => serde_json::Number::from_f64(*x)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => json!(s),
        Value::Bytes(bytes) => json!({ "bytes": bytes.len() }),
        Value::Time(t) => json!(t.as_micros()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        Value::Array(array) => json!({ "shape": array.shape, "data": array.data }),
        Value::Table(table) => json!({
            "columns": table.columns,
            "rows": table
                .rows
                .iter()
                .map(|row| row.iter().map(value_to_json).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        }),
    }
}

/// Id, timestamps, function and decoded outputs of a stored version.
pub fn record_json(policy: &VersionPolicy, document: &Document) -> Result<serde_json::Value, CellError> {
    let document = policy.restore(document.clone())?;

    let mut outputs = serde_json::Map::new();
    if let Some(Value::List(keys)) = document.get(OUTPUTS_FIELD) {
        for key in keys.iter().filter_map(Value::as_str) {
            if let Some(encoded) = document.get(key) {
                let decoded = policy.codecs().decode(encoded)?;
                outputs.insert(key.to_string(), value_to_json(&decoded));
            }
        }
    }

    Ok(json!({
        "id": document_id(&document),
        "updated": document.get(UPDATED_FIELD).map(value_to_json),
        "deleted": document.get(DELETED_FIELD).map(value_to_json),
        "function": document.get(FUNCTION_FIELD).and_then(Value::as_str),
        "outputs": outputs,
    }))
}

fn key_label(keys: &[(String, Value)]) -> String {
    Address::new(None, keys.iter().cloned()).to_string()
}

/// Print a report as pretty JSON or indented `key: value` text.
pub fn print_report(report: &serde_json::Value, json_mode: bool) {
    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
        return;
    }
    let mut out = String::new();
    render_text(report, 0, &mut out);
    print!("{out}");
}

fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Object(_) | serde_json::Value::Array(_) => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => Some("-".to_string()),
        other => Some(other.to_string()),
    }
}

/// Indented text rendering used when `--json-mode` is off.
pub fn render_text(value: &serde_json::Value, indent: usize, out: &mut String) {
    let pad = " ".repeat(indent);
    match value {
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                match scalar_text(item) {
                    Some(text) => out.push_str(&format!("{pad}{key}: {text}\n")),
                    None => {
                        out.push_str(&format!("{pad}{key}:\n"));
                        render_text(item, indent + 2, out);
                    }
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                match scalar_text(item) {
                    Some(text) => out.push_str(&format!("{pad}- {text}\n")),
                    None => {
                        out.push_str(&format!("{pad}-\n"));
                        render_text(item, indent + 2, out);
                    }
                }
            }
        }
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                out.push_str(&format!("{pad}{text}\n"));
            }
        }
    }
}

// =============================================================================
// DEMO COMMAND
// =============================================================================

/// `add(a, b) = a + b`, the function every demo cell wraps.
pub fn add_function() -> Arc<Function> {
    Function::new("add", ["a", "b"], |args| {
        Ok(Value::Int(args.int("a")?.saturating_add(args.int("b")?)))
    })
}

/// Build `A = add(1,2)`, `B = add(A,2)`, `C = add(A,B)`, `D = add(C,B)`,
/// `E = add(D,B)` in `collection`, then push `value` into A.
pub async fn cmd_demo(
    config: &AppConfig,
    collection: &str,
    value: i64,
) -> Result<serde_json::Value, CellError> {
    tracing::info!("Running demo in {:?} (collection: {})", config.database, collection);

    let store = RedbStore::open(&config.database)?;
    let versioned = AsyncVersioned::from_config(Shared::new(store), &config.store);
    let add = add_function();
    let mut registry = Registry::new();
    registry.register(Arc::clone(&add));
    let mut ctx = AsyncContext::new(versioned).with_registry(registry);

    let cell = |name: &str| {
        Cell::new(Arc::clone(&add))
            .with_extra("name", name)
            .with_primary_key(["name"])
            .stored_in(collection)
    };

    let a = ctx.go(cell("A").with_input("a", 1).with_input("b", 2), 0).await?;
    let b = ctx.go(cell("B").with_input("a", &a).with_input("b", 2), 0).await?;
    let c = ctx.go(cell("C").with_input("a", &a).with_input("b", &b), 0).await?;
    let d = ctx.go(cell("D").with_input("a", &c).with_input("b", &b), 0).await?;
    let e = ctx.go(cell("E").with_input("a", &d).with_input("b", &b), 0).await?;

    let mut before = serde_json::Map::new();
    for (name, cell) in DEMO_CELLS.iter().zip([&a, &b, &c, &d, &e]) {
        before.insert((*name).to_string(), value_to_json(&cell.value()?));
    }

    let mut recomputed = Vec::new();
    if let Some(address) = a.address()? {
        for descendant in ctx.context().descendants(&address)? {
            recomputed.push(descendant.get("name").map(value_to_json).unwrap_or_default());
        }
    }

    let mut a = a;
    a.set_input("a", value);
    ctx.push(a).await?;

    let mut after = serde_json::Map::new();
    for name in DEMO_CELLS {
        let cell = ctx.load(cell(name), LoadMode::Required).await?;
        after.insert(name.to_string(), value_to_json(&cell.value()?));
    }

    Ok(json!({
        "database": config.database.to_string_lossy(),
        "collection": collection,
        "before": before,
        "pushed": { "A.a": value },
        "recomputed": recomputed,
        "after": after,
    }))
}

// =============================================================================
// RECORD COMMANDS
// =============================================================================

fn open_versioned(config: &AppConfig) -> Result<Versioned<RedbStore>, CellError> {
    let store = RedbStore::open(&config.database)?;
    Ok(Versioned::from_config(store, &config.store))
}

/// The live version of a record, or the one visible at `as_of`.
pub fn cmd_show(
    config: &AppConfig,
    collection: &str,
    keys: &[(String, Value)],
    as_of: Option<i64>,
) -> Result<serde_json::Value, CellError> {
    let mut versioned = open_versioned(config)?;
    let document = versioned.load(collection, keys, as_of.map(Timestamp::from_micros))?;
    Ok(json!({
        "collection": collection,
        "key": key_label(keys),
        "as_of": as_of,
        "record": record_json(versioned.policy(), &document)?,
    }))
}

/// Every version of a record, oldest first.
pub fn cmd_history(
    config: &AppConfig,
    collection: &str,
    keys: &[(String, Value)],
) -> Result<serde_json::Value, CellError> {
    let versioned = open_versioned(config)?;
    let versions = versioned
        .history(collection, keys)?
        .iter()
        .map(|document| record_json(versioned.policy(), document))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "collection": collection,
        "key": key_label(keys),
        "versions": versions,
    }))
}

/// Soft-delete the live version of a record.
pub fn cmd_delete(
    config: &AppConfig,
    collection: &str,
    keys: &[(String, Value)],
) -> Result<serde_json::Value, CellError> {
    let mut versioned = open_versioned(config)?;
    let deleted = versioned.delete(collection, keys)?;
    if !deleted {
        tracing::warn!("No live record for {} in {}", key_label(keys), collection);
    }
    Ok(json!({
        "collection": collection,
        "key": key_label(keys),
        "deleted": deleted,
    }))
}

/// Backend-native form of an equality filter.
pub fn cmd_filter(pairs: &[(String, Value)]) -> serde_json::Value {
    let filter = Filter::by_keyword(pairs.iter().cloned());
    json!({ "filter": value_to_json(&filter.to_native()) })
}
