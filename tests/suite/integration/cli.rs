use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;

use crate::helpers::db::TestDb;

fn strata() -> Command {
    let mut command = Command::cargo_bin("strata").expect("binary builds");
    command.env_remove("DATABASE_URL");
    command
}

#[test]
fn test_no_subcommand_is_a_usage_error() {
    strata().assert().failure().code(2);
}

#[test]
fn test_missing_sources_is_a_usage_error() {
    let db = TestDb::new();
    strata()
        .args(["apply", "--batch", "--no-config-file", "-d", &db.db_uri()])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("source"));
}

#[test]
fn test_missing_database_is_a_usage_error() {
    let db = TestDb::new();
    let sources = db.migrations_dir();
    strata()
        .args(["apply", "--batch", "--no-config-file"])
        .arg(&sources)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("database"));
}

#[test]
fn test_apply_and_showmigrations_end_to_end() -> Result<()> {
    let db = TestDb::new();
    db.write_migration(
        "0001_users",
        "-- strata:step\nCREATE TABLE users (id INT)\n-- strata:rollback\nDROP TABLE users\n",
    );
    let sources = db.migrations_dir();

    strata()
        .args(["apply", "--batch", "--no-config-file", "-d", &db.db_uri()])
        .arg(&sources)
        .assert()
        .success();

    strata()
        .args([
            "showmigrations",
            "--batch",
            "--no-config-file",
            "-d",
            &db.db_uri(),
        ])
        .arg(&sources)
        .assert()
        .success()
        .stdout(predicate::str::contains("0001_users").and(predicate::str::contains("Yes")));

    strata()
        .args([
            "rollback",
            "--batch",
            "--no-config-file",
            "-a",
            "-d",
            &db.db_uri(),
        ])
        .arg(&sources)
        .assert()
        .success();

    strata()
        .args([
            "showmigrations",
            "--batch",
            "--no-config-file",
            "-d",
            &db.db_uri(),
        ])
        .arg(&sources)
        .assert()
        .success()
        .stdout(predicate::str::contains("0001_users").and(predicate::str::contains("No")));
    Ok(())
}

#[test]
fn test_new_scaffolds_a_migration_in_batch_mode() -> Result<()> {
    let db = TestDb::new();
    db.write_migration("0001_users", "CREATE TABLE users (id INT)\n");
    let sources = db.migrations_dir();

    strata()
        .args([
            "new",
            "--batch",
            "--no-config-file",
            "-m",
            "add orders",
        ])
        .arg(&sources)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created file"));

    let created: Vec<_> = std::fs::read_dir(&sources)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("add-orders"))
        .collect();
    assert_eq!(created.len(), 1);
    let content = std::fs::read_to_string(sources.join(&created[0]))?;
    assert!(content.contains("-- strata:depends 0001_users"), "{content}");
    Ok(())
}

#[test]
fn test_break_lock_subcommand() {
    let db = TestDb::new();
    strata()
        .args(["break-lock", "--no-config-file", "-d", &db.db_uri()])
        .assert()
        .success();
}

#[test]
fn test_bad_revision_is_a_usage_error() {
    let db = TestDb::new();
    db.write_migration("0001_users", "CREATE TABLE users (id INT)\n");
    let sources = db.migrations_dir();
    strata()
        .args([
            "apply",
            "--batch",
            "--no-config-file",
            "-d",
            &db.db_uri(),
            "-r",
            "nonexistent",
        ])
        .arg(&sources)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("doesn't match any revisions"));
}
