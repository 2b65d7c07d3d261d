//! # Application Configuration
//!
//! Loaded from an optional TOML file:
//!
//! ```toml
//! database = "cells.redb"
//!
//! [store]
//! self_heal = true
//! blob_threshold = 65536
//! blob_root = "blobs"
//! ```
//!
//! Precedence, lowest first: defaults, the file, `CELLGRAPH_DB`, the
//! `--database` flag.

use cellgraph_core::{CellError, Config};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the database path.
pub const DATABASE_ENV: &str = "CELLGRAPH_DB";

/// Default database file.
pub const DEFAULT_DATABASE: &str = "cellgraph.redb";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// redb file holding every collection.
    pub database: PathBuf,
    /// Persistence tunables handed to the core.
    pub store: Config,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            store: Config::default(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, CellError> {
        toml::from_str(text).map_err(|e| CellError::SerializationError(format!("config: {e}")))
    }

    /// Read `path` if given, else start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, CellError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    CellError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
                })?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply the environment override, then the command-line flag.
    #[must_use]
    pub fn with_overrides(mut self, env: Option<String>, flag: Option<PathBuf>) -> Self {
        if let Some(database) = env.filter(|v| !v.is_empty()) {
            self.database = PathBuf::from(database);
        }
        if let Some(database) = flag {
            self.database = database;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_means_defaults() {
        let config = AppConfig::from_toml("").expect("parse");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn store_table_reaches_the_core() {
        let config = AppConfig::from_toml(
            r#"
            database = "cells.redb"

            [store]
            self_heal = false
            blob_threshold = 1024
            "#,
        )
        .expect("parse");
        assert_eq!(config.database, PathBuf::from("cells.redb"));
        assert!(!config.store.self_heal);
        assert_eq!(config.store.blob_threshold, 1024);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(AppConfig::from_toml("databse = \"typo\"").is_err());
    }

    #[test]
    fn flag_beats_env_beats_file() {
        let base = AppConfig::default();
        let env_only = base
            .clone()
            .with_overrides(Some("env.redb".to_string()), None);
        assert_eq!(env_only.database, PathBuf::from("env.redb"));

        let both = base.with_overrides(
            Some("env.redb".to_string()),
            Some(PathBuf::from("flag.redb")),
        );
        assert_eq!(both.database, PathBuf::from("flag.redb"));
    }
}
