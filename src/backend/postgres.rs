use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, ConnectOptions, Either, Executor, Row, TypeInfo, ValueRef};

use super::driver::{Driver, StatementOutput, Value};
use super::paramstyle::ParamStyle;
use crate::connections::DatabaseUri;
use crate::error::Result;

/// PostgreSQL adapter. A `schema` query argument on the URI pins the
/// connection's `search_path`, re-applied after every rollback.
pub struct PostgresDriver {
    conn: PgConnection,
    schema: Option<String>,
}

impl PostgresDriver {
    pub async fn connect(uri: &DatabaseUri) -> Result<Self> {
        let mut options = PgConnectOptions::new();
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
        let conn = options.connect().await?;
        Ok(Self {
            conn,
            schema: uri.args.get("schema").cloned(),
        })
    }
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }
        let value = match raw.type_info().name() {
            "INT2" => Value::Int(row.try_get::<i16, _>(i)? as i64),
            "INT4" => Value::Int(row.try_get::<i32, _>(i)? as i64),
            "INT8" => Value::Int(row.try_get::<i64, _>(i)?),
            "FLOAT4" => Value::Float(row.try_get::<f32, _>(i)? as f64),
            "FLOAT8" => Value::Float(row.try_get::<f64, _>(i)?),
            "BOOL" => Value::Int(row.try_get::<bool, _>(i)? as i64),
            "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(i)?),
            "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(i)?.naive_utc()),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
                Value::Text(row.try_get::<String, _>(i)?)
            }
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
impl Driver for PostgresDriver {
    fn paramstyle(&self) -> ParamStyle {
        ParamStyle::Dollar
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    async fn init_connection(&mut self) -> Result<()> {
        if let Some(schema) = self.schema.clone() {
            self.query(&format!("SET search_path TO {schema}"), &[])
                .await?;
        }
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
        let schema = self.schema.clone().unwrap_or_else(|| "public".to_string());
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&mut self.conn)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Into::into))
            .collect()
    }
}

fn collect(
    output: &mut StatementOutput,
    item: Either<sqlx::postgres::PgQueryResult, PgRow>,
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
