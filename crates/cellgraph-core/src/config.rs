//! # Configuration
//!
//! Tunables of the persistence layer. Every field has a default, so an
//! empty TOML table (or no file at all) is a valid configuration.

use crate::primitives::DEFAULT_BLOB_THRESHOLD;
use crate::storage::PathTemplate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Supersede duplicate live records on load instead of failing.
    pub self_heal: bool,
    /// Encoded size in bytes above which array and table outputs are
    /// offloaded to the blob store.
    pub blob_threshold: usize,
    /// Root directory of the filesystem blob store. `None` keeps every
    /// payload inline.
    pub blob_root: Option<PathBuf>,
    /// Blob path pattern, see `PathTemplate`.
    pub blob_template: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            self_heal: true,
            blob_threshold: DEFAULT_BLOB_THRESHOLD,
            blob_root: None,
            blob_template: PathTemplate::DEFAULT.to_string(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn path_template(&self) -> PathTemplate {
        PathTemplate::new(self.blob_template.clone())
    }
}
