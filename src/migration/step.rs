//! The step model: atomic apply/rollback pairs, transaction wrappers and
//! step groups.
//!
//! A step's execution contract is direction-parameterized: apply and
//! rollback share one executor selected by [`Direction`]. Wrappers decide
//! whether the inner step runs inside a transaction (an outer transaction
//! or a nested savepoint, chosen by the backend) and whether database
//! errors in a given direction are swallowed.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{info, warn};

use crate::backend::DatabaseBackend;
use crate::backend::driver::StatementOutput;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Rollback,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Apply => Direction::Rollback,
            Direction::Rollback => Direction::Apply,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Apply => "apply",
            Direction::Rollback => "rollback",
        }
    }
}

/// Which direction's database errors a wrapper swallows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreErrors {
    Apply,
    Rollback,
    All,
}

impl IgnoreErrors {
    pub fn matches(self, direction: Direction) -> bool {
        match self {
            IgnoreErrors::All => true,
            IgnoreErrors::Apply => direction == Direction::Apply,
            IgnoreErrors::Rollback => direction == Direction::Rollback,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "apply" => Ok(IgnoreErrors::Apply),
            "rollback" => Ok(IgnoreErrors::Rollback),
            "all" => Ok(IgnoreErrors::All),
            other => Err(Error::BadMigration(format!(
                "invalid ignore-errors value {other:?} (expected apply, rollback or all)"
            ))),
        }
    }
}

/// An opaque callback invoked with the live backend connection.
pub type StepFn =
    Arc<dyn for<'a> Fn(&'a mut DatabaseBackend) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// What an atomic step runs: SQL text or an opaque callback.
#[derive(Clone)]
pub enum StepDirective {
    Sql(String),
    Callback(StepFn),
}

impl fmt::Debug for StepDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepDirective::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            StepDirective::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<&str> for StepDirective {
    fn from(sql: &str) -> Self {
        StepDirective::Sql(sql.to_string())
    }
}

impl From<String> for StepDirective {
    fn from(sql: String) -> Self {
        StepDirective::Sql(sql)
    }
}

/// An apply directive with an optional rollback directive. A missing
/// rollback makes rolling the step back a no-op.
#[derive(Debug, Clone)]
pub struct AtomicStep {
    pub id: u64,
    pub apply: StepDirective,
    pub rollback: Option<StepDirective>,
}

impl AtomicStep {
    async fn execute(&self, backend: &mut DatabaseBackend, direction: Direction) -> Result<()> {
        let directive = match direction {
            Direction::Apply => {
                info!(" - applying step {}", self.id);
                Some(&self.apply)
            }
            Direction::Rollback => {
                info!(" - rolling back step {}", self.id);
                self.rollback.as_ref()
            }
        };
        let Some(directive) = directive else {
            return Ok(());
        };
        match directive {
            StepDirective::Sql(sql) => {
                let output = backend.execute(sql, &[]).await?;
                if !output.rows.is_empty() {
                    print!("{}", render_result(&output));
                }
                Ok(())
            }
            StepDirective::Callback(callback) => callback(backend).await,
        }
    }
}

/// The step sum type.
#[derive(Debug, Clone)]
pub enum Step {
    Atomic(AtomicStep),
    /// Run the inner step within a transaction (or a nested savepoint when
    /// one is already open).
    Transaction {
        step: Box<Step>,
        ignore_errors: Option<IgnoreErrors>,
    },
    /// Same error-tolerance contract, but no enclosing transaction.
    Transactionless {
        step: Box<Step>,
        ignore_errors: Option<IgnoreErrors>,
    },
    /// An ordered sequence of steps executed as a unit.
    Group { steps: Vec<Step> },
}

impl Step {
    pub fn execute<'a>(
        &'a self,
        backend: &'a mut DatabaseBackend,
        direction: Direction,
        force: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self {
                Step::Atomic(atomic) => atomic.execute(backend, direction).await,
                Step::Transaction {
                    step,
                    ignore_errors,
                } => {
                    let tx = backend.begin_tx().await?;
                    match step.execute(backend, direction, force).await {
                        Ok(()) => backend.commit_tx(tx).await,
                        Err(e)
                            if e.is_database_error() && swallow(*ignore_errors, direction, force) =>
                        {
                            warn!("ignored error in step: {e}");
                            backend.rollback_tx(tx).await?;
                            Ok(())
                        }
                        Err(e) => {
                            let _ = backend.rollback_tx(tx).await;
                            Err(e)
                        }
                    }
                }
                Step::Transactionless {
                    step,
                    ignore_errors,
                } => match step.execute(backend, direction, force).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_database_error() && swallow(*ignore_errors, direction, force) => {
                        warn!("ignored error in step: {e}");
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                // A group walks its children forward and re-invokes apply
                // in either direction; undoing applied work happens through
                // the migration-level compensation path, not the children's
                // rollback directives.
                Step::Group { steps } => {
                    for step in steps {
                        step.execute(backend, Direction::Apply, force).await?;
                    }
                    Ok(())
                }
            }
        })
    }
}

fn swallow(ignore_errors: Option<IgnoreErrors>, direction: Direction, force: bool) -> bool {
    force || ignore_errors.is_some_and(|policy| policy.matches(direction))
}

/// "(1 row)" vs "(N rows)".
pub fn plural(quantity: usize, one: &str, many: &str) -> String {
    if quantity == 1 {
        one.replace("%d", &quantity.to_string())
    } else {
        many.replace("%d", &quantity.to_string())
    }
}

/// Tabulate a result set the way interactive SQL shells do.
fn render_result(output: &StatementOutput) -> String {
    let rows: Vec<Vec<String>> = output
        .rows
        .iter()
        .map(|row| row.iter().map(|v| v.display()).collect())
        .collect();

    let mut widths: Vec<usize> = output.columns.iter().map(String::len).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() && cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let format_row = |cells: &[String]| {
        cells
            .iter()
            .zip(widths.iter().copied())
            .map(|(cell, width)| format!(" {cell:<width$} "))
            .collect::<Vec<_>>()
            .join("|")
    };

    let mut out = String::new();
    out.push_str(&format_row(&output.columns));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+"),
    );
    out.push('\n');
    for row in &rows {
        out.push_str(&format_row(row));
        out.push('\n');
    }
    out.push_str(&plural(rows.len(), "(%d row)", "(%d rows)"));
    out.push('\n');
    out
}
