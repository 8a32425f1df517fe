//! The per-database adapter contract.
//!
//! A [`Driver`] owns a single live connection. Everything above this layer
//! (transactions, locking, bookkeeping, the apply/rollback protocol) is
//! shared across databases in [`super::DatabaseBackend`]; a driver only
//! supplies connection setup, statement execution, identifier quoting and
//! its placeholder style.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::paramstyle::ParamStyle;
use crate::error::Result;

/// A parameter or result value passing through the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Render for the tabulated row dump.
    pub fn display(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Timestamp(t) => t.to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(t: NaiveDateTime) -> Self {
        Value::Timestamp(t)
    }
}

/// The outcome of executing one statement (or a `;`-separated batch).
#[derive(Debug, Default)]
pub struct StatementOutput {
    /// Column names, when the statement produced a result set.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl StatementOutput {
    /// First column of every row, as text.
    pub fn first_column_strings(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.first())
            .map(Value::display)
            .collect()
    }

    /// The single value of a one-row, one-column result.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

#[async_trait]
pub trait Driver: Send {
    /// The placeholder style this driver's prepared statements use.
    fn paramstyle(&self) -> ParamStyle;

    /// Quote `ident` for use in SQL.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Per-connection setup, run after connect and after every rollback
    /// (PostgreSQL re-applies `search_path` here; MySQL re-probes its
    /// `sql_mode`).
    async fn init_connection(&mut self) -> Result<()>;

    /// Execute one statement. `params` are positional values matching the
    /// placeholders already translated into `sql`; with no params the
    /// statement is sent over the unprepared path and may contain multiple
    /// `;`-separated statements.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput>;

    /// Tables visible in the current schema/database.
    async fn list_tables(&mut self) -> Result<Vec<String>>;
}
