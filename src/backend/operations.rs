//! The engine protocol: selection of work, the apply/rollback/mark/unmark
//! operations and the operation log.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::DatabaseBackend;
use super::driver::Value;
use crate::error::{Error, Result};
use crate::migration::sort::topological_sort;
use crate::migration::step::Direction;
use crate::migration::{Migration, MigrationSet, MigrationStatus};

pub(crate) fn current_username() -> String {
    whoami::username()
}

pub(crate) fn current_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl DatabaseBackend {
    /// Hashes of applied migrations, in application order.
    pub async fn get_applied_migration_hashes(&mut self) -> Result<Vec<String>> {
        self.ensure_internal_schema_updated().await?;
        let sql = format!(
            "SELECT migration_hash FROM {} ORDER BY applied_at_utc",
            self.migration_table_quoted()
        );
        Ok(self.execute(&sql, &[]).await?.first_column_strings())
    }

    pub async fn is_applied(&mut self, migration: &Migration) -> Result<bool> {
        Ok(self
            .get_applied_migration_hashes()
            .await?
            .iter()
            .any(|hash| hash == migration.hash()))
    }

    /// The subset of `migrations` not yet applied, in dependency order.
    pub async fn to_apply(&mut self, migrations: &MigrationSet) -> Result<MigrationSet> {
        let applied = self.get_applied_migration_hashes().await?;
        let outstanding = migrations.filter(|m| !applied.iter().any(|h| h == m.hash()));
        migrations.replace(topological_sort(&outstanding)?)
    }

    /// The subset of `migrations` already applied, in reverse dependency
    /// order.
    pub async fn to_rollback(&mut self, migrations: &MigrationSet) -> Result<MigrationSet> {
        let applied = self.get_applied_migration_hashes().await?;
        let applied_set = migrations.filter(|m| applied.iter().any(|h| h == m.hash()));
        let mut sorted = topological_sort(&applied_set)?;
        sorted.reverse();
        migrations.replace(sorted)
    }

    /// Every migration with its applied status, in reverse dependency
    /// order (most recent first).
    pub async fn migrations_with_applied_status(
        &mut self,
        migrations: &MigrationSet,
    ) -> Result<Vec<MigrationStatus>> {
        let applied = self.get_applied_migration_hashes().await?;
        let mut sorted = topological_sort(migrations)?;
        sorted.reverse();
        Ok(sorted
            .into_iter()
            .map(|migration| MigrationStatus {
                applied: applied.iter().any(|h| h == migration.hash()),
                migration,
            })
            .collect())
    }

    /// Apply `migrations` in order, then run any post-apply hooks.
    pub async fn apply_migrations(
        &mut self,
        migrations: &MigrationSet,
        force: bool,
    ) -> Result<()> {
        if migrations.is_empty() {
            return Ok(());
        }
        self.apply_migrations_only(migrations, force).await?;
        self.run_post_apply(migrations, force).await
    }

    /// Apply `migrations` without running post-apply hooks.
    pub async fn apply_migrations_only(
        &mut self,
        migrations: &MigrationSet,
        force: bool,
    ) -> Result<()> {
        for migration in migrations {
            match self.apply_one(migration, force, true).await {
                Ok(()) => {}
                Err(Error::BadMigration(reason)) => {
                    warn!("skipping {}: {reason}", migration.id());
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run the post-apply hooks carried by `migrations`. Hooks execute
    /// every time and are never recorded as applied.
    pub async fn run_post_apply(&mut self, migrations: &MigrationSet, force: bool) -> Result<()> {
        for hook in migrations.post_apply() {
            self.apply_one(hook, force, false).await?;
        }
        Ok(())
    }

    pub async fn rollback_migrations(
        &mut self,
        migrations: &MigrationSet,
        force: bool,
    ) -> Result<()> {
        self.ensure_internal_schema_updated().await?;
        for migration in migrations {
            match self.rollback_one(migration, force).await {
                Ok(()) => {}
                Err(Error::BadMigration(reason)) => {
                    warn!("skipping {}: {reason}", migration.id());
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Record `migrations` as applied without executing their steps.
    pub async fn mark_migrations(&mut self, migrations: &MigrationSet) -> Result<()> {
        self.ensure_internal_schema_updated().await?;
        let tx = self.begin_tx().await?;
        for migration in migrations {
            if let Err(e) = self.mark_one(migration, true).await {
                let _ = self.rollback_tx(tx).await;
                return Err(e);
            }
        }
        self.commit_tx(tx).await
    }

    /// Remove `migrations` from the applied registry without executing
    /// their rollback steps.
    pub async fn unmark_migrations(&mut self, migrations: &MigrationSet) -> Result<()> {
        self.ensure_internal_schema_updated().await?;
        let tx = self.begin_tx().await?;
        for migration in migrations {
            if let Err(e) = self.unmark_one(migration, true).await {
                let _ = self.rollback_tx(tx).await;
                return Err(e);
            }
        }
        self.commit_tx(tx).await
    }

    /// Apply a single migration: run its steps, log the operation and
    /// (unless `mark` is false) insert the applied-registry row.
    pub async fn apply_one(
        &mut self,
        migration: &Arc<Migration>,
        force: bool,
        mark: bool,
    ) -> Result<()> {
        info!("applying {}", migration.id());
        self.ensure_internal_schema_updated().await?;
        migration
            .process_steps(self, Direction::Apply, force)
            .await?;
        self.log_migration(Some(migration), "apply", None).await?;
        if mark {
            let tx = self.begin_tx().await?;
            match self.mark_one(migration, false).await {
                Ok(()) => self.commit_tx(tx).await?,
                Err(e) => {
                    let _ = self.rollback_tx(tx).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Roll back a single migration and delete its registry row.
    pub async fn rollback_one(&mut self, migration: &Arc<Migration>, force: bool) -> Result<()> {
        info!("rolling back {}", migration.id());
        self.ensure_internal_schema_updated().await?;
        migration
            .process_steps(self, Direction::Rollback, force)
            .await?;
        self.log_migration(Some(migration), "rollback", None).await?;
        let tx = self.begin_tx().await?;
        match self.unmark_one(migration, false).await {
            Ok(()) => self.commit_tx(tx).await,
            Err(e) => {
                let _ = self.rollback_tx(tx).await;
                Err(e)
            }
        }
    }

    pub async fn mark_one(&mut self, migration: &Arc<Migration>, log: bool) -> Result<()> {
        info!("marking {} applied", migration.id());
        let sql = format!(
            "INSERT INTO {} (migration_hash, migration_id, applied_at_utc) \
             VALUES (:migration_hash, :migration_id, :when)",
            self.migration_table_quoted()
        );
        self.execute(
            &sql,
            &[
                ("migration_hash", Value::from(migration.hash())),
                ("migration_id", Value::from(migration.id())),
                ("when", Value::Timestamp(Utc::now().naive_utc())),
            ],
        )
        .await?;
        if log {
            self.log_migration(Some(migration), "mark", None).await?;
        }
        Ok(())
    }

    pub async fn unmark_one(&mut self, migration: &Arc<Migration>, log: bool) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE migration_hash = :migration_hash",
            self.migration_table_quoted()
        );
        self.execute(&sql, &[("migration_hash", Value::from(migration.hash()))])
            .await?;
        if log {
            self.log_migration(Some(migration), "unmark", None).await?;
        }
        Ok(())
    }

    /// Append a row to the operation log.
    pub async fn log_migration(
        &mut self,
        migration: Option<&Arc<Migration>>,
        operation: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        debug_assert!(matches!(operation, "apply" | "rollback" | "mark" | "unmark"));
        let sql = format!(
            "INSERT INTO {} (id, migration_hash, migration_id, operation, \
             username, hostname, comment, created_at_utc) \
             VALUES (:id, :migration_hash, :migration_id, :operation, \
             :username, :hostname, :comment, :created_at_utc)",
            self.log_table_quoted()
        );
        let hash = migration.map_or(Value::Null, |m| Value::from(m.hash()));
        let id = migration.map_or(Value::Null, |m| Value::from(m.id()));
        let comment = comment.map_or(Value::Null, Value::from);
        self.execute(
            &sql,
            &[
                ("id", Value::Text(Uuid::new_v4().to_string())),
                ("migration_hash", hash),
                ("migration_id", id),
                ("operation", Value::from(operation)),
                ("username", Value::Text(current_username())),
                ("hostname", Value::Text(current_hostname())),
                ("comment", comment),
                ("created_at_utc", Value::Timestamp(Utc::now().naive_utc())),
            ],
        )
        .await?;
        Ok(())
    }
}
