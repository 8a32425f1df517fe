use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the migration engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A migration source could not be parsed, its dependencies could not
    /// be resolved, or the dependency graph contains a cycle.
    #[error("bad migration: {0}")]
    BadMigration(String),

    /// Two migrations share the same id.
    #[error("migration id conflict: {0}")]
    MigrationConflict(String),

    /// The advisory lock could not be acquired within the timeout.
    #[error("{0}")]
    LockTimeout(String),

    /// A driver-reported database failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// The connection URI could not be understood.
    #[error("invalid connection URI: {0}")]
    BadConnectionUri(String),

    /// An invalid command invocation (bad revision selector, missing
    /// sources, ...). The CLI maps this to a usage-error exit code.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// True for errors raised by the database driver, which step-level
    /// `ignore-errors` policies are allowed to swallow.
    pub fn is_database_error(&self) -> bool {
        matches!(self, Error::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
