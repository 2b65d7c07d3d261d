//! Integration tests for the cellgraph commands, run against a temporary
//! redb file.

use cellgraph::cli::{
    Cli, Commands, cmd_delete, cmd_demo, cmd_filter, cmd_history, cmd_show, parse_key,
    render_text,
};
use cellgraph::config::AppConfig;
use cellgraph_core::{CellError, Value};
use clap::Parser;
use serde_json::json;

fn temp_config() -> (tempfile::TempDir, AppConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig {
        database: dir.path().join("cells.redb"),
        ..AppConfig::default()
    };
    (dir, config)
}

fn key(name: &str) -> Vec<(String, Value)> {
    vec![("name".to_string(), Value::from(name))]
}

// =============================================================================
// ARGUMENT PARSING
// =============================================================================

#[test]
fn test_parse_key_types() {
    assert_eq!(
        parse_key("n=3").expect("int").1.as_int(),
        Some(3)
    );
    assert_eq!(
        parse_key("name=E").expect("text").1.as_str(),
        Some("E")
    );
    assert!(matches!(parse_key("on=true").expect("bool").1, Value::Bool(true)));
    assert!(parse_key("missing").is_err());
    assert!(parse_key("=3").is_err());
}

#[test]
fn test_cli_parses_show_with_as_of() {
    let cli = Cli::try_parse_from([
        "cellgraph", "--json-mode", "-D", "x.redb", "show", "demo", "name=E", "--as-of", "42",
    ])
    .expect("parse");
    assert!(cli.json_mode);
    match cli.command {
        Some(Commands::Show {
            collection,
            keys,
            as_of,
        }) => {
            assert_eq!(collection, "demo");
            assert_eq!(keys.len(), 1);
            assert_eq!(as_of, Some(42));
        }
        other => assert!(other.is_none(), "unexpected command {other:?}"),
    }
}

#[test]
fn test_cli_requires_keys_for_show() {
    assert!(Cli::try_parse_from(["cellgraph", "show", "demo"]).is_err());
}

// =============================================================================
// DEMO
// =============================================================================

#[tokio::test]
async fn test_demo_pushes_through_the_chain() {
    let (_dir, config) = temp_config();
    let report = cmd_demo(&config, "demo", 6).await.expect("demo");

    assert_eq!(report["before"]["E"], json!(18));
    assert_eq!(report["after"]["A"], json!(8));
    assert_eq!(report["after"]["E"], json!(38));
    assert_eq!(report["recomputed"], json!(["B", "C", "D", "E"]));
}

// =============================================================================
// RECORD COMMANDS
// =============================================================================

#[tokio::test]
async fn test_history_show_and_delete() {
    let (_dir, config) = temp_config();
    cmd_demo(&config, "demo", 6).await.expect("demo");

    let history = cmd_history(&config, "demo", &key("E")).expect("history");
    let versions = history["versions"].as_array().expect("versions");
    assert_eq!(versions.len(), 2);
    assert!(!versions[0]["deleted"].is_null());
    assert!(versions[1]["deleted"].is_null());
    assert_eq!(versions[0]["outputs"]["data"], json!(18));
    assert_eq!(versions[1]["function"], json!("add"));

    let live = cmd_show(&config, "demo", &key("E"), None).expect("show live");
    assert_eq!(live["record"]["outputs"]["data"], json!(38));

    let first_written = versions[0]["updated"].as_i64().expect("updated");
    let old = cmd_show(&config, "demo", &key("E"), Some(first_written)).expect("show as of");
    assert_eq!(old["record"]["outputs"]["data"], json!(18));

    let deleted = cmd_delete(&config, "demo", &key("E")).expect("delete");
    assert_eq!(deleted["deleted"], json!(true));
    let again = cmd_delete(&config, "demo", &key("E")).expect("delete again");
    assert_eq!(again["deleted"], json!(false));

    assert!(matches!(
        cmd_show(&config, "demo", &key("E"), None),
        Err(CellError::NotFound { .. })
    ));
    let history = cmd_history(&config, "demo", &key("E")).expect("history");
    assert_eq!(history["versions"].as_array().map(Vec::len), Some(2));
}

#[test]
fn test_show_unknown_record_is_not_found() {
    let (_dir, config) = temp_config();
    assert!(matches!(
        cmd_show(&config, "demo", &key("nobody"), None),
        Err(CellError::NotFound { .. })
    ));
}

// =============================================================================
// FILTER AND RENDERING
// =============================================================================

#[test]
fn test_filter_renders_native_form() {
    let single = cmd_filter(&key("E"));
    assert_eq!(single["filter"], json!({ "name": { "$eq": "E" } }));

    let pairs = vec![
        ("name".to_string(), Value::from("E")),
        ("region".to_string(), Value::from("eu")),
    ];
    let both = cmd_filter(&pairs);
    assert_eq!(both["filter"]["$and"].as_array().map(Vec::len), Some(2));

    assert_eq!(cmd_filter(&[])["filter"], json!({}));
}

#[test]
fn test_render_text_indents_nested_values() {
    let mut out = String::new();
    render_text(
        &json!({ "key": "[name=E]", "record": { "outputs": { "data": 38 } }, "tags": ["a"] }),
        0,
        &mut out,
    );
    assert!(out.contains("key: [name=E]\n"));
    assert!(out.contains("record:\n  outputs:\n    data: 38\n"));
    assert!(out.contains("tags:\n  - a\n"));
}
