use anyhow::Result;
use strata::backend::driver::Value;

use crate::helpers::db::{TestDb, count_rows};

#[tokio::test]
async fn test_execute_with_named_params() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    backend
        .execute("CREATE TABLE t (id INT PRIMARY KEY, name TEXT)", &[])
        .await?;
    backend
        .execute(
            "INSERT INTO t (id, name) VALUES (:id, :name)",
            &[("id", Value::Int(1)), ("name", Value::from("fred"))],
        )
        .await?;

    let output = backend
        .execute(
            "SELECT name FROM t WHERE id = :id",
            &[("id", Value::Int(1))],
        )
        .await?;
    assert_eq!(output.columns, ["name"]);
    assert_eq!(output.rows, vec![vec![Value::from("fred")]]);
    Ok(())
}

#[tokio::test]
async fn test_savepoint_nesting() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    backend
        .execute("CREATE TABLE t (id INT PRIMARY KEY)", &[])
        .await?;

    let outer = backend.begin_tx().await?;
    backend
        .execute("INSERT INTO t (id) VALUES (1)", &[])
        .await?;

    // The nested scope is a savepoint; rolling it back keeps the outer
    // transaction's work.
    let inner = backend.begin_tx().await?;
    backend
        .execute("INSERT INTO t (id) VALUES (2)", &[])
        .await?;
    backend.rollback_tx(inner).await?;

    backend.commit_tx(outer).await?;
    assert_eq!(count_rows(&mut backend, "t").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_outer_rollback_discards_work() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    backend
        .execute("CREATE TABLE t (id INT PRIMARY KEY)", &[])
        .await?;

    let outer = backend.begin_tx().await?;
    backend
        .execute("INSERT INTO t (id) VALUES (1)", &[])
        .await?;
    backend.rollback_tx(outer).await?;

    assert_eq!(count_rows(&mut backend, "t").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_has_transactional_ddl() -> Result<()> {
    let db = TestDb::new();
    let backend = db.backend().await?;
    assert!(backend.has_transactional_ddl());
    Ok(())
}

#[tokio::test]
async fn test_probe_leaves_no_scratch_table() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    let leftovers: Vec<String> = backend
        .list_tables()
        .await?
        .into_iter()
        .filter(|t| t.starts_with("strata_tmp_"))
        .collect();
    assert!(leftovers.is_empty(), "probe left {leftovers:?}");
    Ok(())
}

#[tokio::test]
async fn test_quote_identifier() -> Result<()> {
    let db = TestDb::new();
    let backend = db.backend().await?;
    assert_eq!(backend.quote_identifier("plain"), "\"plain\"");
    assert_eq!(backend.quote_identifier("wei\"rd"), "\"wei\"\"rd\"");
    Ok(())
}

#[tokio::test]
async fn test_database_errors_surface() -> Result<()> {
    let db = TestDb::new();
    let mut backend = db.backend().await?;
    let err = backend
        .execute("SELECT * FROM no_such_table", &[])
        .await
        .unwrap_err();
    assert!(err.is_database_error());
    Ok(())
}
