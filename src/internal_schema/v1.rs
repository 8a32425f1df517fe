//! Version 1: the legacy single-table layout.

use crate::backend::DatabaseBackend;
use crate::error::Result;

pub(super) async fn upgrade(backend: &mut DatabaseBackend) -> Result<()> {
    create_migration_table(backend).await
}

async fn create_migration_table(backend: &mut DatabaseBackend) -> Result<()> {
    let sql = format!(
        "CREATE TABLE {} (id VARCHAR(191) NOT NULL PRIMARY KEY, ctime TIMESTAMP)",
        backend.migration_table_quoted()
    );
    backend.execute(&sql, &[]).await?;
    Ok(())
}
