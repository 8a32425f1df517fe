use std::time::Duration;

// Configuration file name, searched upward from the working directory
pub const CONFIG_FILENAME: &str = "strata.yaml";

// Default bookkeeping table names. Only the migration table is configurable
// at the command line; the rest are fixed.
pub const DEFAULT_MIGRATION_TABLE: &str = "_strata_migration";
pub const LOG_TABLE: &str = "_strata_log";
pub const VERSION_TABLE: &str = "_strata_version";
pub const LOCK_TABLE: &str = "strata_lock";

// Migration file naming conventions
pub const MIGRATION_EXTENSION: &str = "sql";
pub const POST_APPLY_PREFIX: &str = "post-apply";
pub const SCAFFOLD_TEMP_PREFIX: &str = "_tmp_stratanew";

// Directive marker recognized inside migration files
pub const DIRECTIVE_PREFIX: &str = "-- strata:";

// Lock polling
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
