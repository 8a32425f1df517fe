//! The shared database backend.
//!
//! [`DatabaseBackend`] implements everything the engine needs on top of a
//! per-database [`driver::Driver`]: explicit transactions with savepoint
//! nesting, named-parameter execution, the advisory lock protocol, the
//! transactional-DDL probe and (in [`operations`]) the apply/rollback
//! bookkeeping protocol.

pub mod driver;
pub mod mysql;
pub mod operations;
pub mod paramstyle;
pub mod postgres;
pub mod sqlite;

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::connections::DatabaseUri;
use crate::constants::{LOCK_POLL_INTERVAL, LOCK_TABLE, LOG_TABLE, VERSION_TABLE};
use crate::error::{Error, Result};
use driver::{Driver, StatementOutput, Value};
use paramstyle::change_param_style;

/// A transaction scope handle returned by [`DatabaseBackend::begin_tx`].
///
/// The first scope opens a real transaction; nested scopes open savepoints.
/// Committing a savepoint scope is a no-op rather than a `RELEASE`: on
/// engines where DDL commits the enclosing transaction the savepoint is
/// already gone and releasing it would itself error.
#[derive(Debug)]
#[must_use = "a transaction scope must be committed or rolled back"]
pub struct Transaction {
    kind: TxKind,
}

#[derive(Debug)]
enum TxKind {
    Outer,
    Savepoint(String),
}

/// Token handed out by [`DatabaseBackend::lock`]; give it back to
/// [`DatabaseBackend::unlock`]. Reentrant acquisitions receive a token that
/// unlocks nothing.
#[derive(Debug)]
#[must_use = "the lock token must be passed back to unlock()"]
pub struct LockToken {
    owned: bool,
}

pub struct DatabaseBackend {
    driver: Box<dyn Driver>,
    uri: DatabaseUri,
    migration_table: String,
    in_transaction: bool,
    is_locked: bool,
    internal_schema_updated: bool,
    has_transactional_ddl: bool,
    savepoint_seq: u64,
}

impl std::fmt::Debug for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBackend")
            .field("uri", &self.uri)
            .field("migration_table", &self.migration_table)
            .field("in_transaction", &self.in_transaction)
            .field("is_locked", &self.is_locked)
            .field("internal_schema_updated", &self.internal_schema_updated)
            .field("has_transactional_ddl", &self.has_transactional_ddl)
            .field("savepoint_seq", &self.savepoint_seq)
            .finish()
    }
}

impl DatabaseBackend {
    /// Wrap a connected driver: runs per-connection setup, creates the lock
    /// table if missing and probes for transactional DDL.
    pub async fn new(
        mut driver: Box<dyn Driver>,
        uri: DatabaseUri,
        migration_table: &str,
    ) -> Result<Self> {
        driver.init_connection().await?;
        let mut backend = DatabaseBackend {
            driver,
            uri,
            migration_table: migration_table.to_string(),
            in_transaction: false,
            is_locked: false,
            internal_schema_updated: false,
            has_transactional_ddl: false,
            savepoint_seq: 0,
        };
        backend.create_lock_table().await?;
        backend.has_transactional_ddl = backend.check_transactional_ddl().await?;
        Ok(backend)
    }

    pub fn uri(&self) -> &DatabaseUri {
        &self.uri
    }

    pub fn migration_table(&self) -> &str {
        &self.migration_table
    }

    /// Whether DDL statements participate in transactions on this backend.
    /// The probe result is advisory.
    pub fn has_transactional_ddl(&self) -> bool {
        self.has_transactional_ddl
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn quote_identifier(&self, ident: &str) -> String {
        self.driver.quote_identifier(ident)
    }

    pub(crate) fn migration_table_quoted(&self) -> String {
        self.driver.quote_identifier(&self.migration_table)
    }

    pub(crate) fn log_table_quoted(&self) -> String {
        self.driver.quote_identifier(LOG_TABLE)
    }

    pub(crate) fn version_table_quoted(&self) -> String {
        self.driver.quote_identifier(VERSION_TABLE)
    }

    pub(crate) fn lock_table_quoted(&self) -> String {
        self.driver.quote_identifier(LOCK_TABLE)
    }

    /// Execute one statement. Named `:param` references in `sql` are
    /// rewritten to the driver's placeholder style.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[(&str, Value)],
    ) -> Result<StatementOutput> {
        let (translated, values) = change_param_style(self.driver.paramstyle(), sql, params);
        debug!(" - executing {translated:?}");
        self.driver
            .query(&translated, &values.into_positional())
            .await
    }

    pub async fn list_tables(&mut self) -> Result<Vec<String>> {
        self.driver.list_tables().await
    }

    // -- explicit transaction control -----------------------------------

    pub async fn begin(&mut self) -> Result<()> {
        self.in_transaction = true;
        self.execute("BEGIN", &[]).await?;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK", &[]).await?;
        self.driver.init_connection().await?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn savepoint(&mut self, id: &str) -> Result<()> {
        self.execute(&format!("SAVEPOINT {id}"), &[]).await?;
        Ok(())
    }

    pub async fn savepoint_release(&mut self, id: &str) -> Result<()> {
        self.execute(&format!("RELEASE SAVEPOINT {id}"), &[]).await?;
        Ok(())
    }

    pub async fn savepoint_rollback(&mut self, id: &str) -> Result<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {id}"), &[])
            .await?;
        Ok(())
    }

    /// Open a transaction scope: an outer transaction, or a savepoint when
    /// one is already open.
    pub async fn begin_tx(&mut self) -> Result<Transaction> {
        if !self.in_transaction {
            self.begin().await?;
            Ok(Transaction {
                kind: TxKind::Outer,
            })
        } else {
            self.savepoint_seq += 1;
            let id = format!("sp_{}", self.savepoint_seq);
            self.savepoint(&id).await?;
            Ok(Transaction {
                kind: TxKind::Savepoint(id),
            })
        }
    }

    pub async fn commit_tx(&mut self, tx: Transaction) -> Result<()> {
        match tx.kind {
            TxKind::Outer => self.commit().await,
            TxKind::Savepoint(_) => Ok(()),
        }
    }

    pub async fn rollback_tx(&mut self, tx: Transaction) -> Result<()> {
        match tx.kind {
            TxKind::Outer => self.rollback().await,
            TxKind::Savepoint(id) => self.savepoint_rollback(&id).await,
        }
    }

    /// Leave any open transaction so subsequent statements auto-commit
    /// (non-transactional migrations run this way).
    pub async fn ensure_autocommit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.rollback().await?;
        }
        Ok(())
    }

    // -- construction-time probes ---------------------------------------

    async fn create_lock_table(&mut self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE {} (locked INT DEFAULT 1, ctime TIMESTAMP, \
             pid INT NOT NULL, PRIMARY KEY (locked))",
            self.lock_table_quoted()
        );
        let tx = self.begin_tx().await?;
        match self.execute(&sql, &[]).await {
            Ok(_) => self.commit_tx(tx).await,
            // Already exists
            Err(Error::Database(_)) => {
                let _ = self.rollback_tx(tx).await;
                Ok(())
            }
            Err(e) => {
                let _ = self.rollback_tx(tx).await;
                Err(e)
            }
        }
    }

    /// Create a throwaway table inside a rolled-back transaction, then try
    /// to drop it. If the drop succeeds the table survived the rollback
    /// and DDL is not transactional.
    async fn check_transactional_ddl(&mut self) -> Result<bool> {
        let suffix = Uuid::new_v4().simple().to_string();
        let table = self.quote_identifier(&format!("strata_tmp_{}", &suffix[..10]));

        let tx = self.begin_tx().await?;
        self.execute(&format!("CREATE TABLE {table} (id INT PRIMARY KEY)"), &[])
            .await?;
        self.rollback_tx(tx).await?;

        let tx = self.begin_tx().await?;
        match self.execute(&format!("DROP TABLE {table}"), &[]).await {
            Ok(_) => {
                self.commit_tx(tx).await?;
                Ok(false)
            }
            Err(Error::Database(_)) => {
                let _ = self.rollback_tx(tx).await;
                Ok(true)
            }
            Err(e) => {
                let _ = self.rollback_tx(tx).await;
                Err(e)
            }
        }
    }

    // -- advisory lock ---------------------------------------------------

    /// Acquire the cross-process lock, polling until `timeout` elapses
    /// (`None` waits forever). Reentrant within this backend.
    pub async fn lock(&mut self, timeout: Option<Duration>) -> Result<LockToken> {
        if self.is_locked {
            return Ok(LockToken { owned: false });
        }
        let pid = std::process::id() as i64;
        self.insert_lock_row(pid, timeout).await?;
        self.is_locked = true;
        Ok(LockToken { owned: true })
    }

    pub async fn unlock(&mut self, token: LockToken) -> Result<()> {
        if !token.owned {
            return Ok(());
        }
        let pid = std::process::id() as i64;
        self.delete_lock_row(pid).await?;
        self.is_locked = false;
        Ok(())
    }

    async fn insert_lock_row(&mut self, pid: i64, timeout: Option<Duration>) -> Result<()> {
        let poll_interval = match timeout {
            Some(timeout) => LOCK_POLL_INTERVAL.min(timeout),
            None => LOCK_POLL_INTERVAL,
        };
        let sql = format!(
            "INSERT INTO {} (locked, ctime, pid) VALUES (1, :when, :pid)",
            self.lock_table_quoted()
        );
        let started = Instant::now();
        loop {
            let tx = self.begin_tx().await?;
            match self
                .execute(
                    &sql,
                    &[
                        ("when", Value::Timestamp(Utc::now().naive_utc())),
                        ("pid", Value::Int(pid)),
                    ],
                )
                .await
            {
                Ok(_) => {
                    self.commit_tx(tx).await?;
                    return Ok(());
                }
                Err(Error::Database(_)) => {
                    let _ = self.rollback_tx(tx).await;
                    if let Some(timeout) = timeout {
                        if started.elapsed() > timeout {
                            return Err(self.lock_timeout_error().await);
                        }
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => {
                    let _ = self.rollback_tx(tx).await;
                    return Err(e);
                }
            }
        }
    }

    async fn lock_timeout_error(&mut self) -> Error {
        let sql = format!("SELECT pid FROM {}", self.lock_table_quoted());
        let holder = match self.execute(&sql, &[]).await {
            Ok(output) => output.scalar().and_then(|v| v.as_int()),
            Err(_) => None,
        };
        match holder {
            Some(pid) => Error::LockTimeout(format!(
                "process {pid} has locked this database \
                 (run strata break-lock to remove this lock)"
            )),
            None => Error::LockTimeout(
                "database locked (run strata break-lock to remove this lock)".to_string(),
            ),
        }
    }

    async fn delete_lock_row(&mut self, pid: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE pid = :pid",
            self.lock_table_quoted()
        );
        let tx = self.begin_tx().await?;
        match self.execute(&sql, &[("pid", Value::Int(pid))]).await {
            Ok(_) => self.commit_tx(tx).await,
            Err(e) => {
                let _ = self.rollback_tx(tx).await;
                Err(e)
            }
        }
    }

    /// Unconditionally clear the lock table.
    pub async fn break_lock(&mut self) -> Result<()> {
        let sql = format!("DELETE FROM {}", self.lock_table_quoted());
        let tx = self.begin_tx().await?;
        match self.execute(&sql, &[]).await {
            Ok(_) => self.commit_tx(tx).await,
            Err(e) => {
                let _ = self.rollback_tx(tx).await;
                Err(e)
            }
        }
    }

    /// Upgrade the engine's own bookkeeping tables if needed. Runs under
    /// the advisory lock; checked once per backend.
    pub async fn ensure_internal_schema_updated(&mut self) -> Result<()> {
        if self.internal_schema_updated {
            return Ok(());
        }
        if crate::internal_schema::needs_upgrading(self).await? {
            debug_assert!(!self.in_transaction);
            let token = self.lock(Some(crate::constants::DEFAULT_LOCK_TIMEOUT)).await?;
            let upgraded = crate::internal_schema::upgrade(self, None).await;
            let unlocked = self.unlock(token).await;
            upgraded?;
            unlocked?;
        }
        self.internal_schema_updated = true;
        Ok(())
    }
}
