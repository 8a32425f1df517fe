//! Versioning for the engine's own bookkeeping tables.
//!
//! Version 0 is an empty database, version 1 the legacy single-table
//! layout, version 2 the current registry/log/version layout. Upgrades are
//! forward-only and run one version at a time inside a transaction.

mod v1;
mod v2;

use chrono::Utc;

use crate::backend::DatabaseBackend;
use crate::backend::driver::Value;
use crate::constants::VERSION_TABLE;
use crate::error::{Error, Result};

/// The current internal schema version.
pub const LATEST_VERSION: i64 = 2;

/// The version table only exists from this version on; earlier versions
/// skip the version insert.
const USE_VERSION_TABLE_FROM: i64 = 2;

pub async fn needs_upgrading(backend: &mut DatabaseBackend) -> Result<bool> {
    Ok(get_current_version(backend).await? < LATEST_VERSION)
}

/// Infer the installed version from which tables exist.
pub async fn get_current_version(backend: &mut DatabaseBackend) -> Result<i64> {
    let tables = backend.list_tables().await?;
    if !tables.iter().any(|t| t == backend.migration_table()) {
        return Ok(0);
    }
    if !tables.iter().any(|t| t == VERSION_TABLE) {
        return Ok(1);
    }
    let sql = format!(
        "SELECT max(version) FROM {}",
        backend.version_table_quoted()
    );
    let tx = backend.begin_tx().await?;
    let result = backend.execute(&sql, &[]).await;
    match result {
        Ok(output) => {
            backend.commit_tx(tx).await?;
            let version = output
                .scalar()
                .and_then(Value::as_int)
                .ok_or_else(|| bad_version("the version table is empty".to_string()))?;
            if !(0..=LATEST_VERSION).contains(&version) {
                return Err(bad_version(format!("unknown version {version}")));
            }
            Ok(version)
        }
        Err(e) => {
            let _ = backend.rollback_tx(tx).await;
            Err(e)
        }
    }
}

fn bad_version(detail: String) -> Error {
    Error::BadMigration(format!("cannot read the internal schema version: {detail}"))
}

/// Bring the internal schema up to `target` (default: latest), applying
/// one version upgrade at a time.
pub async fn upgrade(backend: &mut DatabaseBackend, target: Option<i64>) -> Result<()> {
    let desired = target.unwrap_or(LATEST_VERSION);
    let mut current = get_current_version(backend).await?;
    let tx = backend.begin_tx().await?;
    let result = async {
        while current < desired {
            let next = current + 1;
            match next {
                1 => v1::upgrade(backend).await?,
                2 => v2::upgrade(backend).await?,
                other => return Err(bad_version(format!("no upgrade path to version {other}"))),
            }
            current = next;
            mark_schema_version(backend, current).await?;
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => backend.commit_tx(tx).await,
        Err(e) => {
            let _ = backend.rollback_tx(tx).await;
            Err(e)
        }
    }
}

/// Record `version` as installed.
async fn mark_schema_version(backend: &mut DatabaseBackend, version: i64) -> Result<()> {
    if version < USE_VERSION_TABLE_FROM {
        return Ok(());
    }
    let sql = format!(
        "INSERT INTO {} VALUES (:version, :when)",
        backend.version_table_quoted()
    );
    backend
        .execute(
            &sql,
            &[
                ("version", Value::Int(version)),
                ("when", Value::Timestamp(Utc::now().naive_utc())),
            ],
        )
        .await?;
    Ok(())
}
