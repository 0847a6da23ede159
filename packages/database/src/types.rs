//! Catalog of semantic value types: their SQL column types, bind routines
//! and column-read conversions.

use chrono::NaiveDateTime;
use rusqlite::Statement;
use uuid::Uuid;

use crate::DbError;

/// Storage format for datetime column text.
pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single database value, either bound as a parameter or read back from a
/// column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    DateTime(NaiveDateTime),
    Uuid(Uuid),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Converts a captured value to the target semantic type, used by the
    /// expression compiler for cast nodes.
    pub(crate) fn coerce(self, kind: ValueKind) -> Result<Self, DbError> {
        let value = match (kind, self) {
            (_, Self::Null) => Self::Null,
            (ValueKind::Bool, Self::Integer(v)) => Self::Bool(v != 0),
            (ValueKind::Bool, v @ Self::Bool(_)) => v,
            (
                ValueKind::Int8
                | ValueKind::Int16
                | ValueKind::Int32
                | ValueKind::Int64
                | ValueKind::UInt8
                | ValueKind::UInt16
                | ValueKind::UInt32
                | ValueKind::Enum,
                value,
            ) => match value {
                v @ Self::Integer(_) => v,
                Self::Bool(v) => Self::Integer(i64::from(v)),
                #[allow(clippy::cast_possible_truncation)]
                Self::Real(v) => Self::Integer(v as i64),
                other => return Err(unconvertible(&other, kind)),
            },
            (ValueKind::Float32 | ValueKind::Float64, value) => match value {
                v @ Self::Real(_) => v,
                #[allow(clippy::cast_precision_loss)]
                Self::Integer(v) => Self::Real(v as f64),
                other => return Err(unconvertible(&other, kind)),
            },
            (ValueKind::Text, Self::Text(v)) => Self::Text(v),
            (ValueKind::Text, Self::Integer(v)) => Self::Text(v.to_string()),
            (ValueKind::Text, Self::Uuid(v)) => Self::Text(v.to_string()),
            (ValueKind::Uuid, Self::Uuid(v)) => Self::Uuid(v),
            (ValueKind::Uuid, Self::Text(v)) => Self::Uuid(
                Uuid::parse_str(&v).map_err(|_| DbError::UnsupportedType("uuid".to_string()))?,
            ),
            (ValueKind::DateTime, v @ Self::DateTime(_)) => v,
            (ValueKind::Blob, v @ Self::Blob(_)) => v,
            (kind, other) => return Err(unconvertible(&other, kind)),
        };
        Ok(value)
    }
}

fn unconvertible(value: &Value, kind: ValueKind) -> DbError {
    DbError::UnsupportedType(format!("cannot convert {value:?} to {kind:?}"))
}

/// The semantic type of a mapped column. The explicit descriptor makes
/// genuinely unknown types unrepresentable; conversions that still cannot be
/// carried out surface as [`DbError::UnsupportedType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    Float32,
    Float64,
    Text,
    DateTime,
    Blob,
    Enum,
    Uuid,
}

impl ValueKind {
    /// The SQL column type token for this semantic type. Pure and
    /// deterministic: the same inputs always yield the same token.
    #[must_use]
    pub fn sql_type(self, max_length: u32, datetime_as_integer: bool) -> String {
        match self {
            Self::Bool
            | Self::Int8
            | Self::Int16
            | Self::Int32
            | Self::UInt8
            | Self::UInt16
            | Self::Enum => "integer".to_string(),
            Self::Int64 | Self::UInt32 => "bigint".to_string(),
            Self::Float32 | Self::Float64 => "float".to_string(),
            Self::Text => format!("varchar({max_length})"),
            Self::DateTime => if datetime_as_integer {
                "bigint"
            } else {
                "datetime"
            }
            .to_string(),
            Self::Blob => "blob".to_string(),
            Self::Uuid => "varchar(36)".to_string(),
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(val: Option<T>) -> Self {
        val.map_or(Self::Null, Into::into)
    }
}

impl From<bool> for Value {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<&str> for Value {
    fn from(val: &str) -> Self {
        Self::Text(val.to_string())
    }
}

impl From<&String> for Value {
    fn from(val: &String) -> Self {
        Self::Text(val.clone())
    }
}

impl From<String> for Value {
    fn from(val: String) -> Self {
        Self::Text(val)
    }
}

impl From<i8> for Value {
    fn from(val: i8) -> Self {
        Self::Integer(i64::from(val))
    }
}

impl From<i16> for Value {
    fn from(val: i16) -> Self {
        Self::Integer(i64::from(val))
    }
}

impl From<i32> for Value {
    fn from(val: i32) -> Self {
        Self::Integer(i64::from(val))
    }
}

impl From<i64> for Value {
    fn from(val: i64) -> Self {
        Self::Integer(val)
    }
}

impl From<u8> for Value {
    fn from(val: u8) -> Self {
        Self::Integer(i64::from(val))
    }
}

impl From<u16> for Value {
    fn from(val: u16) -> Self {
        Self::Integer(i64::from(val))
    }
}

impl From<u32> for Value {
    fn from(val: u32) -> Self {
        Self::Integer(i64::from(val))
    }
}

impl From<f32> for Value {
    fn from(val: f32) -> Self {
        Self::Real(f64::from(val))
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Self {
        Self::Real(val)
    }
}

impl From<Vec<u8>> for Value {
    fn from(val: Vec<u8>) -> Self {
        Self::Blob(val)
    }
}

impl From<&[u8]> for Value {
    fn from(val: &[u8]) -> Self {
        Self::Blob(val.to_vec())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(val: NaiveDateTime) -> Self {
        Self::DateTime(val)
    }
}

impl From<Uuid> for Value {
    fn from(val: Uuid) -> Self {
        Self::Uuid(val)
    }
}

impl From<rusqlite::types::Value> for Value {
    fn from(value: rusqlite::types::Value) -> Self {
        match value {
            rusqlite::types::Value::Null => Self::Null,
            rusqlite::types::Value::Integer(value) => Self::Integer(value),
            rusqlite::types::Value::Real(value) => Self::Real(value),
            rusqlite::types::Value::Text(value) => Self::Text(value),
            rusqlite::types::Value::Blob(value) => Self::Blob(value),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Integer(value) => Ok(value),
            Value::Bool(value) => Ok(Self::from(value)),
            other => Err(unconvertible(&other, ValueKind::Int64)),
        }
    }
}

impl TryFrom<Value> for i32 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        Self::try_from(wide).map_err(|_| DbError::UnsupportedType("i32 out of range".to_string()))
    }
}

impl TryFrom<Value> for i16 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        Self::try_from(wide).map_err(|_| DbError::UnsupportedType("i16 out of range".to_string()))
    }
}

impl TryFrom<Value> for i8 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        Self::try_from(wide).map_err(|_| DbError::UnsupportedType("i8 out of range".to_string()))
    }
}

impl TryFrom<Value> for u8 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        Self::try_from(wide).map_err(|_| DbError::UnsupportedType("u8 out of range".to_string()))
    }
}

impl TryFrom<Value> for u16 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        Self::try_from(wide).map_err(|_| DbError::UnsupportedType("u16 out of range".to_string()))
    }
}

impl TryFrom<Value> for u32 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        Self::try_from(wide).map_err(|_| DbError::UnsupportedType("u32 out of range".to_string()))
    }
}

impl TryFrom<Value> for f64 {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Real(value) => Ok(value),
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(value) => Ok(value as Self),
            other => Err(unconvertible(&other, ValueKind::Float64)),
        }
    }
}

impl TryFrom<Value> for f32 {
    type Error = DbError;

    #[allow(clippy::cast_possible_truncation)]
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        f64::try_from(value).map(|v| v as Self)
    }
}

impl TryFrom<Value> for bool {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(value) => Ok(value),
            Value::Integer(value) => Ok(value != 0),
            other => Err(unconvertible(&other, ValueKind::Bool)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(value) => Ok(value),
            other => Err(unconvertible(&other, ValueKind::Text)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Blob(value) => Ok(value),
            other => Err(unconvertible(&other, ValueKind::Blob)),
        }
    }
}

impl TryFrom<Value> for NaiveDateTime {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::DateTime(value) => Ok(value),
            Value::Integer(seconds) => chrono::DateTime::from_timestamp(seconds, 0)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| DbError::UnsupportedType("datetime out of range".to_string())),
            Value::Text(text) => Self::parse_from_str(&text, DATETIME_FORMAT)
                .map_err(|_| DbError::UnsupportedType(format!("datetime text {text:?}"))),
            other => Err(unconvertible(&other, ValueKind::DateTime)),
        }
    }
}

impl TryFrom<Value> for Uuid {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Uuid(value) => Ok(value),
            Value::Text(text) => Self::parse_str(&text)
                .map_err(|_| DbError::UnsupportedType(format!("uuid text {text:?}"))),
            other => Err(unconvertible(&other, ValueKind::Uuid)),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = DbError>,
{
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            other => T::try_from(other).map(Some),
        }
    }
}

/// Binds one value at a 1-based positional index.
pub(crate) fn bind_value(
    statement: &mut Statement<'_>,
    index: usize,
    value: &Value,
    datetime_as_integer: bool,
) -> Result<(), DbError> {
    match value {
        Value::Null => statement.raw_bind_parameter(index, None::<i64>),
        Value::Integer(value) => statement.raw_bind_parameter(index, *value),
        Value::Real(value) => statement.raw_bind_parameter(index, *value),
        Value::Text(value) => statement.raw_bind_parameter(index, value.as_str()),
        Value::Blob(value) => statement.raw_bind_parameter(index, value.as_slice()),
        Value::Bool(value) => statement.raw_bind_parameter(index, i32::from(*value)),
        Value::DateTime(value) => {
            if datetime_as_integer {
                statement.raw_bind_parameter(index, value.and_utc().timestamp())
            } else {
                statement.raw_bind_parameter(index, value.format(DATETIME_FORMAT).to_string())
            }
        }
        Value::Uuid(value) => statement.raw_bind_parameter(index, value.to_string()),
    }
    .map_err(DbError::from)
}

/// Binds a positional argument list in order.
pub(crate) fn bind_values(
    statement: &mut Statement<'_>,
    values: &[Value],
    datetime_as_integer: bool,
) -> Result<(), DbError> {
    for (i, value) in values.iter().enumerate() {
        bind_value(statement, i + 1, value, datetime_as_integer)?;
    }
    Ok(())
}
