use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Either, Executor, Row, TypeInfo, ValueRef};

use super::driver::{Driver, StatementOutput, Value};
use super::paramstyle::ParamStyle;
use crate::connections::DatabaseUri;
use crate::error::Result;

/// MySQL adapter.
///
/// Identifier quoting follows the session's `sql_mode`: backticks by
/// default, double quotes when `ANSI_QUOTES` is active. The mode is probed
/// at `init_connection` time and cached so that quoting stays a pure
/// function.
pub struct MySqlDriver {
    conn: MySqlConnection,
    database: Option<String>,
    ansi_quotes: bool,
}

impl MySqlDriver {
    pub async fn connect(uri: &DatabaseUri) -> Result<Self> {
        let mut options = MySqlConnectOptions::new();
        if let Some(host) = &uri.hostname {
            options = options.host(host);
        }
        if let Some(port) = uri.port {
            options = options.port(port);
        }
        if let Some(user) = &uri.username {
            options = options.username(user);
        }
        if let Some(password) = &uri.password {
            options = options.password(password);
        }
        if let Some(database) = &uri.database {
            options = options.database(database);
        }
        if let Some(socket) = uri.args.get("unix_socket") {
            options = options.socket(socket);
        }
        let conn = options.connect().await?;
        Ok(Self {
            conn,
            database: uri.database.clone(),
            ansi_quotes: false,
        })
    }
}

fn decode_row(row: &MySqlRow) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        let value = match raw.type_info().name() {
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
                Value::Int(row.try_get::<i64, _>(i)?)
            }
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" => Value::Int(row.try_get::<u64, _>(i)? as i64),
            "FLOAT" | "DOUBLE" => Value::Float(row.try_get::<f64, _>(i)?),
            "BOOLEAN" => Value::Int(row.try_get::<bool, _>(i)? as i64),
            "DATETIME" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(i)?),
            "TIMESTAMP" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(i)?.naive_utc()),
            other => match row.try_get::<String, _>(i) {
                Ok(s) => Value::Text(s),
                Err(_) => Value::Text(format!("<{other}>")),
            },
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl Driver for MySqlDriver {
    fn paramstyle(&self) -> ParamStyle {
        ParamStyle::Qmark
    }

    fn quote_identifier(&self, ident: &str) -> String {
        if self.ansi_quotes {
            format!("\"{}\"", ident.replace('"', "\"\""))
        } else {
            format!("`{}`", ident.replace('`', "``"))
        }
    }

    async fn init_connection(&mut self) -> Result<()> {
        let output = self.query("SHOW VARIABLES LIKE 'sql_mode'", &[]).await?;
        self.ansi_quotes = output
            .rows
            .first()
            .and_then(|row| row.get(1))
            .and_then(|v| v.as_str().map(str::to_lowercase))
            .is_some_and(|mode| mode.contains("ansi_quotes"));
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
        let database = self.database.clone().unwrap_or_default();
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = ?",
        )
        .bind(database)
        .fetch_all(&mut self.conn)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Into::into))
            .collect()
    }
}

fn collect(
    output: &mut StatementOutput,
    item: Either<sqlx::mysql::MySqlQueryResult, MySqlRow>,
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
