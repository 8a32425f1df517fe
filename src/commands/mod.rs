//! Command orchestration: work selection and the per-subcommand entry
//! points the CLI dispatches to.

pub mod new;

use std::path::PathBuf;

use console::style;
use itertools::Itertools;
use regex::Regex;
use tracing::warn;

use crate::backend::DatabaseBackend;
use crate::config::Settings;
use crate::connections::{backend_for_uri, parse_uri};
use crate::constants::DEFAULT_LOCK_TIMEOUT;
use crate::error::{Error, Result};
use crate::migration::sort::DependencyGraph;
use crate::migration::step::plural;
use crate::migration::{MigrationSet, read_migrations};
use crate::prompts;

/// What a subcommand does with its selection; drives the applied-status
/// restriction and the direction of revision expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Rollback,
    Reapply,
    Mark,
    Unmark,
}

impl Operation {
    fn verb(self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Rollback => "rollback",
            Operation::Reapply => "reapply",
            Operation::Mark => "mark",
            Operation::Unmark => "unmark",
        }
    }

    /// Selecting forward (outstanding migrations) or backward (applied
    /// migrations)?
    fn selects_unapplied(self) -> bool {
        matches!(self, Operation::Apply | Operation::Mark)
    }
}

/// Everything the migration subcommands need, resolved from the config
/// file and CLI arguments.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub sources: Vec<PathBuf>,
    pub database: Option<String>,
    pub match_pattern: Option<String>,
    pub all: bool,
    pub force: bool,
    pub prompt_password: bool,
    pub migration_table: String,
    pub revision: Option<String>,
    pub batch_mode: bool,
}

impl MigrationOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        MigrationOptions {
            sources: settings.sources.clone(),
            database: settings.database.clone(),
            match_pattern: None,
            all: false,
            force: false,
            prompt_password: false,
            migration_table: settings.migration_table.clone(),
            revision: None,
            batch_mode: settings.batch_mode,
        }
    }
}

/// Connect to the configured database, prompting for the password when
/// requested.
pub async fn connect_backend(options: &MigrationOptions) -> Result<DatabaseBackend> {
    let database = options.database.as_deref().ok_or_else(|| {
        Error::InvalidArgument(
            "no database specified (use --database or the config file)".to_string(),
        )
    })?;
    let mut parsed = parse_uri(database)?;
    if options.prompt_password {
        parsed = parsed.with_password(prompts::password("Password")?);
    }
    backend_for_uri(parsed, &options.migration_table).await
}

/// Read, filter and order the migrations a command operates on.
async fn get_migrations(
    options: &MigrationOptions,
    backend: &mut DatabaseBackend,
    operation: Operation,
) -> Result<MigrationSet> {
    if options.sources.is_empty() {
        return Err(Error::InvalidArgument(
            "please specify the migration source directory".to_string(),
        ));
    }
    let mut migrations = read_migrations(&options.sources)?;
    migrations.load_all()?;

    if let Some(pattern) = &options.match_pattern {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::InvalidArgument(format!("bad --match pattern: {e}")))?;
        migrations = migrations.filter(|m| regex.is_match(m.id()));
    }

    if !options.all {
        migrations = if operation.selects_unapplied() {
            backend.to_apply(&migrations).await?
        } else {
            backend.to_rollback(&migrations).await?
        };
    }

    if let Some(revision) = &options.revision {
        migrations = select_revision(&migrations, revision, operation)?;
    }

    if options.batch_mode
        && options.revision.is_none()
        && !options.all
        && operation == Operation::Rollback
        && migrations.len() > 1
    {
        warn!(
            "only rolling back a single migration; to roll back more, use \
             --revision or --all"
        );
        migrations.truncate(1);
    }

    if !options.batch_mode && !migrations.is_empty() {
        println!();
        println!(
            "Selected {}",
            plural(migrations.len(), "%d migration:", "%d migrations:")
        );
        for migration in &migrations {
            println!("  [{}]", migration.id());
        }
        let question = format!(
            "{} {} to {}",
            capitalize(operation.verb()),
            plural(migrations.len(), "this migration", "these %d migrations"),
            backend.uri()
        );
        if !prompts::confirm(&question, true)? {
            return migrations.replace(Vec::new());
        }
    }

    Ok(migrations)
}

/// Expand a `--revision` substring selector: the unique matching migration
/// plus its ancestors (apply/mark) or descendants (rollback/reapply/
/// unmark).
fn select_revision(
    migrations: &MigrationSet,
    revision: &str,
    operation: Operation,
) -> Result<MigrationSet> {
    let targets: Vec<_> = migrations
        .iter()
        .filter(|m| m.id().contains(revision))
        .collect();
    let target = match targets.as_slice() {
        [] => {
            return Err(Error::InvalidArgument(format!(
                "{revision:?} doesn't match any revisions"
            )));
        }
        [target] => (*target).clone(),
        many => {
            return Err(Error::InvalidArgument(format!(
                "{revision:?} matches multiple revisions. Please specify one of {}",
                many.iter().map(|m| m.id()).join(", ")
            )));
        }
    };

    let graph = DependencyGraph::new(migrations)?;
    let mut wanted = if operation.selects_unapplied() {
        graph.ancestors(target.id())
    } else {
        graph.descendants(target.id())
    };
    wanted.insert(target.id().to_string());
    Ok(migrations.filter(|m| wanted.contains(m.id())))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `strata apply`
pub async fn apply(options: &MigrationOptions) -> Result<()> {
    let mut backend = connect_backend(options).await?;
    let token = backend.lock(Some(DEFAULT_LOCK_TIMEOUT)).await?;
    let result = async {
        let migrations = get_migrations(options, &mut backend, Operation::Apply).await?;
        backend.apply_migrations(&migrations, options.force).await
    }
    .await;
    let unlocked = backend.unlock(token).await;
    result?;
    unlocked
}

/// `strata rollback`
pub async fn rollback(options: &MigrationOptions) -> Result<()> {
    let mut backend = connect_backend(options).await?;
    let token = backend.lock(Some(DEFAULT_LOCK_TIMEOUT)).await?;
    let result = async {
        let migrations = get_migrations(options, &mut backend, Operation::Rollback).await?;
        backend
            .rollback_migrations(&migrations, options.force)
            .await
    }
    .await;
    let unlocked = backend.unlock(token).await;
    result?;
    unlocked
}

/// `strata reapply`: roll the selection back, then apply what is now
/// outstanding.
pub async fn reapply(options: &MigrationOptions) -> Result<()> {
    let mut backend = connect_backend(options).await?;
    let token = backend.lock(Some(DEFAULT_LOCK_TIMEOUT)).await?;
    let result = async {
        let migrations = get_migrations(options, &mut backend, Operation::Reapply).await?;
        backend
            .rollback_migrations(&migrations, options.force)
            .await?;
        let migrations = backend.to_apply(&migrations).await?;
        backend.apply_migrations(&migrations, options.force).await
    }
    .await;
    let unlocked = backend.unlock(token).await;
    result?;
    unlocked
}

/// `strata mark`
pub async fn mark(options: &MigrationOptions) -> Result<()> {
    let mut backend = connect_backend(options).await?;
    let token = backend.lock(Some(DEFAULT_LOCK_TIMEOUT)).await?;
    let result = async {
        let migrations = get_migrations(options, &mut backend, Operation::Mark).await?;
        backend.mark_migrations(&migrations).await
    }
    .await;
    let unlocked = backend.unlock(token).await;
    result?;
    unlocked
}

/// `strata unmark`
pub async fn unmark(options: &MigrationOptions) -> Result<()> {
    let mut backend = connect_backend(options).await?;
    let token = backend.lock(Some(DEFAULT_LOCK_TIMEOUT)).await?;
    let result = async {
        let migrations = get_migrations(options, &mut backend, Operation::Unmark).await?;
        backend.unmark_migrations(&migrations).await
    }
    .await;
    let unlocked = backend.unlock(token).await;
    result?;
    unlocked
}

/// `strata showmigrations`: a two-column report of id and applied status,
/// most recent first.
pub async fn show_migrations(options: &MigrationOptions) -> Result<()> {
    if options.sources.is_empty() {
        return Err(Error::InvalidArgument(
            "please specify the migration source directory".to_string(),
        ));
    }
    let mut backend = connect_backend(options).await?;
    let token = backend.lock(Some(DEFAULT_LOCK_TIMEOUT)).await?;
    let result: Result<()> = async {
        let mut migrations = read_migrations(&options.sources)?;
        migrations.load_all()?;
        if let Some(pattern) = &options.match_pattern {
            let regex = Regex::new(pattern)
                .map_err(|e| Error::InvalidArgument(format!("bad --match pattern: {e}")))?;
            migrations = migrations.filter(|m| regex.is_match(m.id()));
        }
        let statuses = backend.migrations_with_applied_status(&migrations).await?;

        let width = statuses
            .iter()
            .map(|s| s.migration.id().len())
            .max()
            .unwrap_or(0)
            .max("Migration".len());
        println!("{:<width$}  Applied", "Migration");
        println!("{}  -------", "-".repeat(width));
        for status in &statuses {
            let applied = if status.applied {
                style("Yes").green()
            } else {
                style("No").red()
            };
            println!("{:<width$}  {}", status.migration.id(), applied);
        }
        Ok(())
    }
    .await;
    let unlocked = backend.unlock(token).await;
    result?;
    unlocked
}

/// `strata break-lock`
pub async fn break_lock(options: &MigrationOptions) -> Result<()> {
    let mut backend = connect_backend(options).await?;
    backend.break_lock().await
}
