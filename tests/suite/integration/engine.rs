use anyhow::Result;
use strata::backend::driver::Value;
use strata::error::Error;
use strata::migration::migration_hash;

use crate::helpers::db::{TestDb, count_rows, migration_ids, table_names};

#[tokio::test]
async fn test_apply_creates_table_and_bookkeeping() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "m1",
        "-- strata:step\nCREATE TABLE t (id INT)\n-- strata:rollback\nDROP TABLE t\n",
    );
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    assert_eq!(migration_ids(&to_apply), ["m1"]);
    backend.apply_migrations(&to_apply, false).await?;

    let tables = table_names(&mut backend).await?;
    assert!(tables.iter().any(|t| t == "t"), "{tables:?}");
    assert!(tables.iter().any(|t| t == "_strata_migration"));

    assert_eq!(
        backend.get_applied_migration_hashes().await?,
        [migration_hash("m1")]
    );
    let registry = backend
        .execute("SELECT migration_id FROM _strata_migration", &[])
        .await?;
    assert_eq!(registry.first_column_strings(), ["m1"]);

    let log = backend
        .execute(
            "SELECT migration_id FROM _strata_log WHERE operation = 'apply'",
            &[],
        )
        .await?;
    assert_eq!(log.first_column_strings(), ["m1"]);
    Ok(())
}

#[tokio::test]
async fn test_dependencies_apply_before_dependents() -> Result<()> {
    let db = TestDb::new();
    // discovery order puts the dependent first
    db.write_migration(
        "a_child",
        "-- strata:depends b_parent\nCREATE TABLE child (id INT)\n",
    );
    db.write_migration("b_parent", "CREATE TABLE parent (id INT)\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    assert_eq!(migration_ids(&to_apply), ["b_parent", "a_child"]);
    backend.apply_migrations(&to_apply, false).await?;

    let mut hashes = backend.get_applied_migration_hashes().await?;
    hashes.sort_unstable();
    let mut expected = vec![migration_hash("a_child"), migration_hash("b_parent")];
    expected.sort_unstable();
    assert_eq!(hashes, expected);
    Ok(())
}

#[tokio::test]
async fn test_failed_migration_leaves_no_trace() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m1", "CREATE TABLE t (id INT)\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;
    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;

    // second migration: a good step followed by a bad one
    db.write_migration(
        "m2",
        "-- strata:step\nINSERT INTO t VALUES (1)\n\
         -- strata:step\nINSERT INTO t VALUES ('x', 'y')\n",
    );
    let migrations = db.read_migrations()?;
    let to_apply = backend.to_apply(&migrations).await?;
    assert_eq!(migration_ids(&to_apply), ["m2"]);

    let err = backend.apply_migrations(&to_apply, false).await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));

    // the whole migration rolled back: no rows, no registry entry
    assert_eq!(count_rows(&mut backend, "t").await?, 0);
    assert_eq!(
        backend.get_applied_migration_hashes().await?,
        [migration_hash("m1")]
    );
    Ok(())
}

#[tokio::test]
async fn test_apply_then_rollback_round_trip() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "m1",
        "-- strata:step\nCREATE TABLE t (id INT)\n-- strata:rollback\nDROP TABLE t\n",
    );
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;
    assert!(table_names(&mut backend).await?.iter().any(|t| t == "t"));

    let to_rollback = backend.to_rollback(&migrations).await?;
    assert_eq!(migration_ids(&to_rollback), ["m1"]);
    backend.rollback_migrations(&to_rollback, false).await?;

    assert!(!table_names(&mut backend).await?.iter().any(|t| t == "t"));
    assert!(backend.get_applied_migration_hashes().await?.is_empty());

    let log = backend
        .execute(
            "SELECT migration_id FROM _strata_log WHERE operation = 'rollback'",
            &[],
        )
        .await?;
    assert_eq!(log.first_column_strings(), ["m1"]);
    Ok(())
}

#[tokio::test]
async fn test_rollback_order_is_reversed() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "a_child",
        "-- strata:depends b_parent\n\
         -- strata:step\nCREATE TABLE child (id INT)\n-- strata:rollback\nDROP TABLE child\n",
    );
    db.write_migration(
        "b_parent",
        "-- strata:step\nCREATE TABLE parent (id INT)\n-- strata:rollback\nDROP TABLE parent\n",
    );
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;
    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;

    let to_rollback = backend.to_rollback(&migrations).await?;
    assert_eq!(migration_ids(&to_rollback), ["a_child", "b_parent"]);
    backend.rollback_migrations(&to_rollback, false).await?;
    assert!(backend.get_applied_migration_hashes().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_mark_and_unmark_do_not_execute_steps() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m1", "CREATE TABLE t (id INT)\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    backend.mark_migrations(&to_apply).await?;

    // marked as applied, but the table was never created
    assert_eq!(
        backend.get_applied_migration_hashes().await?,
        [migration_hash("m1")]
    );
    assert!(!table_names(&mut backend).await?.iter().any(|t| t == "t"));

    let to_rollback = backend.to_rollback(&migrations).await?;
    backend.unmark_migrations(&to_rollback).await?;
    assert!(backend.get_applied_migration_hashes().await?.is_empty());

    let log = backend
        .execute(
            "SELECT operation FROM _strata_log ORDER BY created_at_utc",
            &[],
        )
        .await?;
    let operations = log.first_column_strings();
    assert!(operations.contains(&"mark".to_string()), "{operations:?}");
    assert!(operations.contains(&"unmark".to_string()), "{operations:?}");
    Ok(())
}

#[tokio::test]
async fn test_post_apply_hooks_run_every_apply_and_are_untracked() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m1", "CREATE TABLE audit (id INTEGER PRIMARY KEY AUTOINCREMENT)\n");
    db.write_migration("post-apply-audit", "INSERT INTO audit DEFAULT VALUES\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    assert_eq!(migration_ids(&to_apply), ["m1"]);
    backend.apply_migrations(&to_apply, false).await?;
    assert_eq!(count_rows(&mut backend, "audit").await?, 1);

    // the hook is not in the applied registry
    assert_eq!(
        backend.get_applied_migration_hashes().await?,
        [migration_hash("m1")]
    );

    // nothing outstanding: hooks do not run again
    let to_apply = backend.to_apply(&migrations).await?;
    assert!(to_apply.is_empty());
    backend.apply_migrations(&to_apply, false).await?;
    assert_eq!(count_rows(&mut backend, "audit").await?, 1);

    // a new outstanding migration triggers the hook again
    db.write_migration("m2", "-- strata:depends m1\nSELECT 1\n");
    let migrations = db.read_migrations()?;
    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;
    assert_eq!(count_rows(&mut backend, "audit").await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_apply_migrations_only_skips_hooks() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m1", "CREATE TABLE audit (id INTEGER PRIMARY KEY AUTOINCREMENT)\n");
    db.write_migration("post-apply-audit", "INSERT INTO audit DEFAULT VALUES\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations_only(&to_apply, false).await?;
    assert_eq!(count_rows(&mut backend, "audit").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_reapply() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "m1",
        "-- strata:step\nCREATE TABLE t (id INT)\n-- strata:rollback\nDROP TABLE t\n",
    );
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;

    let selected = backend.to_rollback(&migrations).await?;
    backend.rollback_migrations(&selected, false).await?;
    let selected = backend.to_apply(&selected).await?;
    backend.apply_migrations(&selected, false).await?;

    assert!(table_names(&mut backend).await?.iter().any(|t| t == "t"));
    assert_eq!(
        backend.get_applied_migration_hashes().await?,
        [migration_hash("m1")]
    );
    let log = backend
        .execute(
            "SELECT operation FROM _strata_log ORDER BY created_at_utc",
            &[],
        )
        .await?;
    assert_eq!(
        log.first_column_strings(),
        ["apply", "rollback", "apply"]
    );
    Ok(())
}

#[tokio::test]
async fn test_empty_migration_set_is_a_noop() -> Result<()> {
    let db = TestDb::new();
    std::fs::create_dir_all(db.migrations_dir())?;
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;
    let to_rollback = backend.to_rollback(&migrations).await?;
    backend.rollback_migrations(&to_rollback, false).await?;
    backend.mark_migrations(&to_apply).await?;
    backend.unmark_migrations(&to_rollback).await?;
    Ok(())
}

#[tokio::test]
async fn test_force_records_migration_despite_errors() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m_bad", "INSERT INTO missing VALUES (1)\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, true).await?;
    assert_eq!(
        backend.get_applied_migration_hashes().await?,
        [migration_hash("m_bad")]
    );
    Ok(())
}

#[tokio::test]
async fn test_ignore_errors_step_does_not_fail_migration() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "m1",
        "-- strata:step ignore-errors=\"apply\"\nINSERT INTO missing VALUES (1)\n\
         -- strata:step\nCREATE TABLE t (id INT)\n",
    );
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;
    assert!(table_names(&mut backend).await?.iter().any(|t| t == "t"));
    assert_eq!(
        backend.get_applied_migration_hashes().await?,
        [migration_hash("m1")]
    );
    Ok(())
}

#[tokio::test]
async fn test_non_transactional_migration_compensates_on_failure() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "m1",
        "-- strata:transactional false\n\
         -- strata:step\nCREATE TABLE c1 (id INT)\n-- strata:rollback\nDROP TABLE c1\n\
         -- strata:step\nINSERT INTO missing VALUES (1)\n",
    );
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let to_apply = backend.to_apply(&migrations).await?;
    let err = backend.apply_migrations(&to_apply, false).await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));

    // the first step's committed work was undone by its rollback directive
    assert!(!table_names(&mut backend).await?.iter().any(|t| t == "c1"));
    assert!(backend.get_applied_migration_hashes().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_is_applied_and_status_report() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m1", "CREATE TABLE t (id INT)\n");
    db.write_migration("m2", "-- strata:depends m1\nSELECT 1\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let only_m1 = migrations.filter(|m| m.id() == "m1");
    let to_apply = backend.to_apply(&only_m1).await?;
    backend.apply_migrations(&to_apply, false).await?;

    assert!(backend.is_applied(migrations.get("m1").unwrap()).await?);
    assert!(!backend.is_applied(migrations.get("m2").unwrap()).await?);

    let statuses = backend.migrations_with_applied_status(&migrations).await?;
    // reverse topological order: dependents first
    assert_eq!(statuses[0].migration.id(), "m2");
    assert!(!statuses[0].applied);
    assert_eq!(statuses[1].migration.id(), "m1");
    assert!(statuses[1].applied);
    Ok(())
}

#[tokio::test]
async fn test_row_returning_step_is_not_an_error() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "m1",
        "-- strata:step\nCREATE TABLE t (id INT, name TEXT)\n\
         -- strata:step\nINSERT INTO t VALUES (1, 'one')\n\
         -- strata:step\nSELECT id, name FROM t\n",
    );
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;
    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;
    Ok(())
}

#[tokio::test]
async fn test_mark_then_unmark_leaves_registry_unchanged() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m1", "CREATE TABLE t (id INT)\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;

    let before = backend.get_applied_migration_hashes().await?;
    let to_apply = backend.to_apply(&migrations).await?;
    backend.mark_migrations(&to_apply).await?;
    let to_rollback = backend.to_rollback(&migrations).await?;
    backend.unmark_migrations(&to_rollback).await?;
    assert_eq!(backend.get_applied_migration_hashes().await?, before);
    Ok(())
}

#[tokio::test]
async fn test_registry_hash_matches_id_hash() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("20240101_01_users", "CREATE TABLE users (id INT)\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;
    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;

    let rows = backend
        .execute(
            "SELECT migration_hash, migration_id FROM _strata_migration",
            &[],
        )
        .await?;
    let hash = rows.rows[0][0].as_str().unwrap().to_string();
    let id = rows.rows[0][1].as_str().unwrap();
    assert_eq!(hash, migration_hash(id));
    assert_eq!(hash.len(), 64);
    Ok(())
}

#[tokio::test]
async fn test_log_entries_carry_user_and_host() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("m1", "CREATE TABLE t (id INT)\n");
    let migrations = db.read_migrations()?;
    let mut backend = db.backend().await?;
    let to_apply = backend.to_apply(&migrations).await?;
    backend.apply_migrations(&to_apply, false).await?;

    let log = backend
        .execute(
            "SELECT username, hostname FROM _strata_log WHERE operation = :op",
            &[("op", Value::from("apply"))],
        )
        .await?;
    assert_eq!(log.rows.len(), 1);
    assert!(log.rows[0][0].as_str().is_some_and(|u| !u.is_empty()));
    assert!(log.rows[0][1].as_str().is_some_and(|h| !h.is_empty()));
    Ok(())
}
