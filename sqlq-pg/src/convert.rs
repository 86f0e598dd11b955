//! Conversions between sqlx/Postgres types and the sqlq value model

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};
use uuid::Uuid;

use sqlq_core::{DbError, Result, Row, Value};

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE for statement timeouts and cancel requests.
const QUERY_CANCELED: &str = "57014";
/// SQLSTATE for `idle_in_transaction_session_timeout` terminations.
const IDLE_IN_TRANSACTION_TIMEOUT: &str = "25P03";

/// Translate a sqlx error into the sqlq taxonomy.
pub fn map_sqlx_error(err: sqlx::Error) -> DbError {
    match &err {
        sqlx::Error::RowNotFound => DbError::NoRows,
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned());
            let message = db.message().to_string();
            match code.as_deref() {
                Some(c) if c.starts_with("23") => DbError::Constraint {
                    code: c.to_string(),
                    constraint: db.constraint().map(str::to_string),
                    message,
                },
                Some(LOCK_NOT_AVAILABLE) => DbError::LockTimeout { message },
                Some(QUERY_CANCELED) => DbError::QueryCanceled { message },
                Some(IDLE_IN_TRANSACTION_TIMEOUT) => DbError::connection(message),
                // connection exceptions and admin shutdowns
                Some(c) if c.starts_with("08") || c.starts_with("57P") => {
                    DbError::connection(message)
                }
                _ => DbError::Database { code, message },
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => DbError::connection(err.to_string()),
        sqlx::Error::ColumnDecode { index, source } => {
            DbError::decode(index.as_str(), source.to_string())
        }
        sqlx::Error::ColumnNotFound(name) => DbError::decode(name.as_str(), "no such column"),
        sqlx::Error::Decode(source) => DbError::decode("<unknown>", source.to_string()),
        _ => DbError::database(None, err.to_string()),
    }
}

/// Positional arguments bound onto a prepared query.
///
/// NULL is bound as untyped text; cast the placeholder for other columns.
pub(crate) fn bind_args<'q>(sql: &'q str, args: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(n) => query.bind(*n),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Uuid(id) => query.bind(*id),
            Value::Timestamp(ts) => query.bind(*ts),
            Value::Json(v) => query.bind(sqlx::types::Json(v)),
        };
    }
    query
}

/// Decode a result set, sharing one column list across rows.
pub(crate) fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<Row>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let columns: Arc<[String]> = first
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    rows.iter().map(|row| decode_row(&columns, row)).collect()
}

fn decode_row(columns: &Arc<[String]>, row: &PgRow) -> Result<Row> {
    let mut values = Vec::with_capacity(columns.len());
    for (index, column) in row.columns().iter().enumerate() {
        values.push(decode_value(row, index, column.name(), column.type_info().name())?);
    }
    Ok(Row::new(Arc::clone(columns), values))
}

fn decode_value(row: &PgRow, index: usize, name: &str, type_name: &str) -> Result<Value> {
    if row.try_get_raw(index).map_err(map_sqlx_error)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Bool(get(row, index)?),
        "INT2" => Value::Int(get::<i16>(row, index)?.into()),
        "INT4" => Value::Int(get::<i32>(row, index)?.into()),
        "INT8" => Value::Int(get(row, index)?),
        "OID" => Value::Int(get::<sqlx::postgres::types::Oid>(row, index)?.0.into()),
        "FLOAT4" => Value::Float(get::<f32>(row, index)?.into()),
        "FLOAT8" => Value::Float(get(row, index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => {
            Value::Text(get(row, index)?)
        }
        "BYTEA" => Value::Bytes(get(row, index)?),
        "UUID" => Value::Uuid(get::<Uuid>(row, index)?),
        "TIMESTAMPTZ" => Value::Timestamp(get::<DateTime<Utc>>(row, index)?),
        "TIMESTAMP" => Value::Timestamp(get::<NaiveDateTime>(row, index)?.and_utc()),
        "DATE" => {
            let date = get::<NaiveDate>(row, index)?;
            Value::Timestamp(date.and_time(chrono::NaiveTime::MIN).and_utc())
        }
        "JSON" | "JSONB" => Value::Json(get(row, index)?),
        other => {
            return Err(DbError::decode(
                name,
                format!("unsupported column type {other}; cast it in SQL (e.g. ::text)"),
            ))
        }
    };
    Ok(value)
}

fn get<'r, T>(row: &'r PgRow, index: usize) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(index).map_err(map_sqlx_error)
}
