//! Driver-neutral argument and row model

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DbError, Result};

/// A single bind argument or column value.
///
/// `Null` is sent untyped-as-text by the PostgreSQL driver; cast the
/// placeholder (`$1::int`) when binding NULL into a non-text column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    DateTime<Utc> => Timestamp,
    serde_json::Value => Json,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Typed extraction of a column value.
pub trait FromValue: Sized {
    fn from_value(column: &str, value: &Value) -> Result<Self>;
}

fn mismatch(column: &str, expected: &str, value: &Value) -> DbError {
    DbError::decode(
        column,
        format!("expected {expected}, found {}", value.type_name()),
    )
}

impl FromValue for Value {
    fn from_value(_column: &str, value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch(column, "bool", other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Int(n) => Ok(*n),
            other => Err(mismatch(column, "int", other)),
        }
    }
}

macro_rules! narrow_int {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(column: &str, value: &Value) -> Result<Self> {
                    let wide = i64::from_value(column, value)?;
                    <$ty>::try_from(wide).map_err(|_| {
                        DbError::decode(column, format!("{wide} out of range for {}", stringify!($ty)))
                    })
                }
            }
        )*
    };
}

narrow_int!(i16, i32, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(n) => Ok(*n as f64),
            other => Err(mismatch(column, "float", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch(column, "text", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(mismatch(column, "bytes", other)),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Uuid(id) => Ok(*id),
            Value::Text(s) => Uuid::parse_str(s).map_err(|e| DbError::decode(column, e.to_string())),
            other => Err(mismatch(column, "uuid", other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Timestamp(ts) => Ok(*ts),
            other => Err(mismatch(column, "timestamp", other)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Null => Ok(serde_json::Value::Null),
            other => Err(mismatch(column, "json", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(column, other).map(Some),
        }
    }
}

/// One result row. Column names are shared by every row of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// A row whose value count disagrees with `columns` reports a decode
    /// error for the unmatched positions instead of panicking.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Typed value of the named column.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| DbError::decode(column, "no such column"))?;
        let value = self
            .values
            .get(index)
            .ok_or_else(|| DbError::decode(column, "row has no value for this column"))?;
        T::from_value(column, value)
    }

    /// Typed value at a column position.
    pub fn get_at<T: FromValue>(&self, index: usize) -> Result<T> {
        let out_of_range = || DbError::decode(format!("#{index}"), "column index out of range");
        let value = self.values.get(index).ok_or_else(out_of_range)?;
        let column = self.columns.get(index).ok_or_else(out_of_range)?;
        T::from_value(column, value)
    }
}

/// Whole-row mapping used by `select` and `get`.
///
/// Implement by hand for structs, reading columns by their snake_case name:
///
/// ```
/// use sqlq_core::{FromRow, Row, Result};
///
/// struct Bridge {
///     name: String,
///     confirmations: i32,
/// }
///
/// impl FromRow for Bridge {
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             name: row.get("name")?,
///             confirmations: row.get("confirmations")?,
///         })
///     }
/// }
/// ```
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

macro_rules! tuple_from_row {
    ($($idx:tt => $name:ident),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                Ok(($(row.get_at::<$name>($idx)?,)+))
            }
        }
    };
}

tuple_from_row!(0 => A);
tuple_from_row!(0 => A, 1 => B);
tuple_from_row!(0 => A, 1 => B, 2 => C);
tuple_from_row!(0 => A, 1 => B, 2 => C, 3 => D);

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
}
