use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Either, Executor, Row, TypeInfo, ValueRef};

use super::driver::{Driver, StatementOutput, Value};
use super::paramstyle::ParamStyle;
use crate::connections::DatabaseUri;
use crate::error::{Error, Result};

/// SQLite adapter. The database path comes from the URI's database part;
/// the file is created on first connect.
pub struct SqliteDriver {
    conn: SqliteConnection,
}

impl SqliteDriver {
    pub async fn connect(uri: &DatabaseUri) -> Result<Self> {
        let path = uri
            .database
            .as_deref()
            .ok_or_else(|| Error::BadConnectionUri("no database file in sqlite URI".into()))?;
        let conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .connect()
            .await?;
        Ok(Self { conn })
    }

    /// An in-memory database, used by the test suite.
    pub async fn in_memory() -> Result<Self> {
        let conn = SqliteConnectOptions::new().connect().await?;
        Ok(Self { conn })
    }
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        // SQLite values are dynamically typed; dispatch on the value's
        // runtime type, not the column declaration.
        let value = match raw.type_info().name() {
            "INTEGER" | "BOOLEAN" => Value::Int(row.try_get(i)?),
            "REAL" => Value::Float(row.try_get(i)?),
            "BLOB" => {
                let bytes: Vec<u8> = row.try_get(i)?;
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Value::Text(row.try_get(i)?),
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl Driver for SqliteDriver {
    fn paramstyle(&self) -> ParamStyle {
        ParamStyle::Qmark
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    async fn init_connection(&mut self) -> Result<()> {
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput> {
        let mut output = StatementOutput::default();
        if params.is_empty() {
            let mut stream = self.conn.fetch_many(sql);
            while let Some(item) = stream.try_next().await? {
                collect(&mut output, item)?;
            }
        } else {
            let mut query = sqlx::query(sql);
            for value in params {
                query = match value {
                    Value::Null => query.bind(None::<String>),
                    Value::Int(i) => query.bind(*i),
                    Value::Float(f) => query.bind(*f),
                    Value::Text(s) => query.bind(s.clone()),
                    Value::Timestamp(t) => query.bind(*t),
                };
            }
            let mut stream = query.fetch_many(&mut self.conn);
            while let Some(item) = stream.try_next().await? {
                collect(&mut output, item)?;
            }
        }
        Ok(output)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let output = self
            .query("SELECT name FROM sqlite_master WHERE type = 'table'", &[])
            .await?;
        Ok(output.first_column_strings())
    }
}

fn collect(
    output: &mut StatementOutput,
    item: Either<sqlx::sqlite::SqliteQueryResult, SqliteRow>,
) -> Result<()> {
    match item {
        Either::Left(done) => output.rows_affected += done.rows_affected(),
        Either::Right(row) => {
            if output.columns.is_empty() {
                output.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            output.rows.push(decode_row(&row)?);
        }
    }
    Ok(())
}
