//! # cellgraph CLI Module
//!
//! ## Available Commands
//!
//! - `demo` - Build the add chain, evaluate it, push a new input
//! - `show` - Print the live (or as-of) version of a record
//! - `history` - List every version of a record
//! - `delete` - Soft-delete the live version of a record
//! - `filter` - Render a keyword filter in backend-native form
//!
//! Records are addressed by collection plus `key=value` pairs.

mod commands;

use crate::config::{AppConfig, DATABASE_ENV};
use cellgraph_core::{CellError, Value};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// cellgraph - memoized computation cells with versioned persistence
#[derive(Parser, Debug)]
#[command(name = "cellgraph")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress informational output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the redb database (overrides config and CELLGRAPH_DB)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build A..E over `add`, evaluate, then push a new value into A
    Demo {
        /// Collection the chain is stored in
        #[arg(short = 'C', long, default_value = "demo")]
        collection: String,

        /// New value for A's first input
        #[arg(short, long, default_value = "6")]
        value: i64,
    },

    /// Show one record
    Show {
        /// Collection name
        collection: String,

        /// Primary-key pairs, `key=value`
        #[arg(required = true, value_parser = parse_key)]
        keys: Vec<(String, Value)>,

        /// Show the version visible at this instant (microseconds)
        #[arg(long)]
        as_of: Option<i64>,
    },

    /// List every version of a record, oldest first
    History {
        /// Collection name
        collection: String,

        /// Primary-key pairs, `key=value`
        #[arg(required = true, value_parser = parse_key)]
        keys: Vec<(String, Value)>,
    },

    /// Soft-delete the live version of a record
    Delete {
        /// Collection name
        collection: String,

        /// Primary-key pairs, `key=value`
        #[arg(required = true, value_parser = parse_key)]
        keys: Vec<(String, Value)>,
    },

    /// Render `key=value` equality pairs as a backend-native filter
    Filter {
        /// Field pairs, `key=value`
        #[arg(value_parser = parse_key)]
        pairs: Vec<(String, Value)>,
    },
}

/// Parse `key=value`. Values that read as integers, floats or booleans
/// become those; anything else is text.
pub fn parse_key(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }

    let value = if let Ok(i) = value.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(x) = value.parse::<f64>() {
        Value::Float(x)
    } else if let Ok(b) = value.parse::<bool>() {
        Value::Bool(b)
    } else {
        Value::Text(value.to_string())
    };
    Ok((key.to_string(), value))
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), CellError> {
    let config = AppConfig::load(cli.config.as_deref())?
        .with_overrides(std::env::var(DATABASE_ENV).ok(), cli.database);
    let json_mode = cli.json_mode;

    let report = match cli.command {
        Some(Commands::Demo { collection, value }) => {
            cmd_demo(&config, &collection, value).await?
        }
        Some(Commands::Show {
            collection,
            keys,
            as_of,
        }) => cmd_show(&config, &collection, &keys, as_of)?,
        Some(Commands::History { collection, keys }) => cmd_history(&config, &collection, &keys)?,
        Some(Commands::Delete { collection, keys }) => cmd_delete(&config, &collection, &keys)?,
        Some(Commands::Filter { pairs }) => cmd_filter(&pairs),
        None => {
            if !cli.quiet {
                println!("cellgraph {}: no command given, see --help", env!("CARGO_PKG_VERSION"));
            }
            return Ok(());
        }
    };

    print_report(&report, json_mode);
    Ok(())
}
