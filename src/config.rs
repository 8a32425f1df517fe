//! Configuration: `strata.yaml` discovery and merging with CLI arguments.
//!
//! The file is searched upward from the working directory. CLI arguments
//! win over the file, the file wins over built-in defaults; the database
//! URI additionally falls back to `DATABASE_URL`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::{CONFIG_FILENAME, DEFAULT_MIGRATION_TABLE};
use crate::error::{Error, Result};

/// `sources` accepts either a single space-separated string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourcesSpec {
    One(String),
    Many(Vec<String>),
}

impl SourcesSpec {
    pub fn into_paths(self) -> Vec<PathBuf> {
        match self {
            SourcesSpec::One(s) => s.split_whitespace().map(PathBuf::from).collect(),
            SourcesSpec::Many(items) => items.into_iter().map(PathBuf::from).collect(),
        }
    }
}

/// The raw contents of `strata.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub sources: Option<SourcesSpec>,
    pub database: Option<String>,
    pub migration_table: Option<String>,
    pub verbosity: Option<u8>,
    pub batch_mode: Option<bool>,
    pub editor: Option<String>,
    pub prefix: Option<String>,
    pub post_create_command: Option<String>,
}

/// Fully resolved settings the commands run with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sources: Vec<PathBuf>,
    pub database: Option<String>,
    pub migration_table: String,
    pub verbosity: u8,
    pub batch_mode: bool,
    pub editor: Option<String>,
    pub prefix: String,
    pub post_create_command: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            sources: Vec::new(),
            database: None,
            migration_table: DEFAULT_MIGRATION_TABLE.to_string(),
            verbosity: 0,
            batch_mode: false,
            editor: None,
            prefix: String::new(),
            post_create_command: None,
        }
    }
}

impl Settings {
    /// Layer a config file over the defaults. The `DATABASE_URL`
    /// environment variable fills the database when the file does not.
    pub fn from_file(file: FileConfig) -> Self {
        let defaults = Settings::default();
        Settings {
            sources: file.sources.map(SourcesSpec::into_paths).unwrap_or_default(),
            database: file.database.or_else(|| std::env::var("DATABASE_URL").ok()),
            migration_table: file.migration_table.unwrap_or(defaults.migration_table),
            verbosity: file.verbosity.unwrap_or(defaults.verbosity),
            batch_mode: file.batch_mode.unwrap_or(defaults.batch_mode),
            editor: file.editor,
            prefix: file.prefix.unwrap_or(defaults.prefix),
            post_create_command: file.post_create_command,
        }
    }
}

/// Find the closest config file in the working directory or a parent.
pub fn find_config() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        let candidate = dir.join(CONFIG_FILENAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Read and parse a config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text)
        .map_err(|e| Error::InvalidArgument(format!("{}: {e}", path.display())))
}
