use anyhow::Result;
use strata::error::Error;
use strata::migration::step::{
    AtomicStep, Direction, IgnoreErrors, Step, StepDirective,
};

use crate::helpers::db::{TestDb, count_rows};

fn atomic(id: u64, apply: &str, rollback: Option<&str>) -> Step {
    Step::Atomic(AtomicStep {
        id,
        apply: StepDirective::from(apply),
        rollback: rollback.map(StepDirective::from),
    })
}

fn in_transaction(step: Step, ignore_errors: Option<IgnoreErrors>) -> Step {
    Step::Transaction {
        step: Box::new(step),
        ignore_errors,
    }
}

#[tokio::test]
async fn test_transaction_wrapper_commits_on_success() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    backend
        .execute("CREATE TABLE t (id INT PRIMARY KEY)", &[])
        .await?;

    let step = in_transaction(atomic(0, "INSERT INTO t (id) VALUES (1)", None), None);
    step.execute(&mut backend, Direction::Apply, false).await?;
    assert_eq!(count_rows(&mut backend, "t").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_transaction_wrapper_propagates_errors() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    let step = in_transaction(atomic(0, "INSERT INTO missing VALUES (1)", None), None);
    let err = step
        .execute(&mut backend, Direction::Apply, false)
        .await
        .unwrap_err();
    assert!(err.is_database_error());
    assert!(!backend.in_transaction());
    Ok(())
}

#[tokio::test]
async fn test_ignore_errors_swallows_matching_direction() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    let step = in_transaction(
        atomic(0, "INSERT INTO missing VALUES (1)", None),
        Some(IgnoreErrors::Apply),
    );
    step.execute(&mut backend, Direction::Apply, false).await?;
    Ok(())
}

#[tokio::test]
async fn test_ignore_errors_other_direction_still_raises() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    let step = in_transaction(
        atomic(
            0,
            "SELECT 1",
            Some("DELETE FROM missing"),
        ),
        Some(IgnoreErrors::Apply),
    );
    let err = step
        .execute(&mut backend, Direction::Rollback, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Database(_)));
    Ok(())
}

#[tokio::test]
async fn test_force_swallows_any_database_error() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    let step = in_transaction(atomic(0, "INSERT INTO missing VALUES (1)", None), None);
    step.execute(&mut backend, Direction::Apply, true).await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_rollback_is_noop() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    let step = in_transaction(atomic(0, "SELECT 1", None), None);
    step.execute(&mut backend, Direction::Rollback, false)
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_group_applies_children_in_order() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    backend
        .execute("CREATE TABLE log (seq INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT)", &[])
        .await?;

    let group = in_transaction(
        Step::Group {
            steps: vec![
                in_transaction(
                    atomic(0, "INSERT INTO log (label) VALUES ('first')", None),
                    None,
                ),
                in_transaction(
                    atomic(1, "INSERT INTO log (label) VALUES ('second')", None),
                    None,
                ),
            ],
        },
        None,
    );
    group
        .execute(&mut backend, Direction::Apply, false)
        .await?;

    let output = backend
        .execute("SELECT label FROM log ORDER BY seq", &[])
        .await?;
    assert_eq!(output.first_column_strings(), ["first", "second"]);
    Ok(())
}

#[tokio::test]
async fn test_group_rollback_reapplies_children_in_order() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    backend
        .execute("CREATE TABLE log (seq INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT)", &[])
        .await?;

    let group = in_transaction(
        Step::Group {
            steps: vec![
                in_transaction(
                    atomic(
                        0,
                        "INSERT INTO log (label) VALUES ('first')",
                        Some("INSERT INTO log (label) VALUES ('undo-first')"),
                    ),
                    None,
                ),
                in_transaction(
                    atomic(
                        1,
                        "INSERT INTO log (label) VALUES ('second')",
                        Some("INSERT INTO log (label) VALUES ('undo-second')"),
                    ),
                    None,
                ),
            ],
        },
        None,
    );
    group
        .execute(&mut backend, Direction::Rollback, false)
        .await?;

    // A group rollback re-runs the children's apply directives in their
    // original order; the rollback directives are not consulted.
    let output = backend
        .execute("SELECT label FROM log ORDER BY seq", &[])
        .await?;
    assert_eq!(output.first_column_strings(), ["first", "second"]);
    Ok(())
}

#[tokio::test]
async fn test_callback_directive_receives_backend() -> Result<()> {
    use std::sync::Arc;

    use futures_util::future::BoxFuture;
    use strata::DatabaseBackend;

    fn insert_row(backend: &mut DatabaseBackend) -> BoxFuture<'_, strata::Result<()>> {
        Box::pin(async move {
            backend
                .execute("INSERT INTO t (id) VALUES (99)", &[])
                .await?;
            Ok(())
        })
    }

    let db = TestDb::new();
    let mut backend = db.backend().await?;
    backend
        .execute("CREATE TABLE t (id INT PRIMARY KEY)", &[])
        .await?;

    let callback: strata::migration::step::StepFn = Arc::new(insert_row);
    let step = in_transaction(
        Step::Atomic(AtomicStep {
            id: 0,
            apply: StepDirective::Callback(callback),
            rollback: None,
        }),
        None,
    );
    step.execute(&mut backend, Direction::Apply, false).await?;
    assert_eq!(count_rows(&mut backend, "t").await?, 1);
    Ok(())
}
