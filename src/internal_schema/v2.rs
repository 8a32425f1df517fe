//! Version 2: the current registry/log/version layout.
//!
//! The 1→2 upgrade replaces the legacy migration table but carries every
//! row forward: each legacy `(id, ctime)` row becomes a synthesized
//! `apply` log entry, and the new registry is rebuilt from the log with
//! freshly computed hashes.

use uuid::Uuid;

use crate::backend::DatabaseBackend;
use crate::backend::driver::Value;
use crate::backend::operations::{current_hostname, current_username};
use crate::error::Result;
use crate::migration::migration_hash;

const UPGRADE_COMMENT: &str =
    "this log entry created automatically by an internal schema upgrade";

pub(super) async fn upgrade(backend: &mut DatabaseBackend) -> Result<()> {
    create_log_table(backend).await?;
    create_version_table(backend).await?;

    let legacy = backend
        .execute(
            &format!(
                "SELECT id, ctime FROM {}",
                backend.migration_table_quoted()
            ),
            &[],
        )
        .await?;
    let insert_log = format!(
        "INSERT INTO {} (id, migration_hash, migration_id, operation, \
         created_at_utc, username, hostname, comment) \
         VALUES (:id, :migration_hash, :migration_id, 'apply', \
         :created_at_utc, :username, :hostname, :comment)",
        backend.log_table_quoted()
    );
    for row in &legacy.rows {
        let migration_id = row.first().map_or(Value::Null, Clone::clone);
        let created_at = row.get(1).map_or(Value::Null, Clone::clone);
        let hash = migration_id
            .as_str()
            .map_or(Value::Null, |id| Value::Text(migration_hash(id)));
        backend
            .execute(
                &insert_log,
                &[
                    ("id", Value::Text(Uuid::new_v4().to_string())),
                    ("migration_hash", hash),
                    ("migration_id", migration_id),
                    ("created_at_utc", created_at),
                    ("username", Value::Text(current_username())),
                    ("hostname", Value::Text(current_hostname())),
                    ("comment", Value::from(UPGRADE_COMMENT)),
                ],
            )
            .await?;
    }

    backend
        .execute(
            &format!("DROP TABLE {}", backend.migration_table_quoted()),
            &[],
        )
        .await?;
    create_migration_table(backend).await?;
    backend
        .execute(
            &format!(
                "INSERT INTO {} SELECT migration_hash, migration_id, created_at_utc FROM {}",
                backend.migration_table_quoted(),
                backend.log_table_quoted()
            ),
            &[],
        )
        .await?;
    Ok(())
}

async fn create_migration_table(backend: &mut DatabaseBackend) -> Result<()> {
    let sql = format!(
        "CREATE TABLE {} ( \
         migration_hash VARCHAR(64), \
         migration_id VARCHAR(255), \
         applied_at_utc TIMESTAMP, \
         PRIMARY KEY (migration_hash))",
        backend.migration_table_quoted()
    );
    backend.execute(&sql, &[]).await?;
    Ok(())
}

async fn create_log_table(backend: &mut DatabaseBackend) -> Result<()> {
    let sql = format!(
        "CREATE TABLE {} ( \
         id VARCHAR(36), \
         migration_hash VARCHAR(64), \
         migration_id VARCHAR(255), \
         operation VARCHAR(10), \
         username VARCHAR(255), \
         hostname VARCHAR(255), \
         comment VARCHAR(255), \
         created_at_utc TIMESTAMP, \
         PRIMARY KEY (id))",
        backend.log_table_quoted()
    );
    backend.execute(&sql, &[]).await?;
    Ok(())
}

async fn create_version_table(backend: &mut DatabaseBackend) -> Result<()> {
    let sql = format!(
        "CREATE TABLE {} ( \
         version INT NOT NULL PRIMARY KEY, \
         installed_at_utc TIMESTAMP)",
        backend.version_table_quoted()
    );
    backend.execute(&sql, &[]).await?;
    Ok(())
}
