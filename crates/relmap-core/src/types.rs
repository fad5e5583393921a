//! SQL column types.

use crate::value::Value;

/// Column types understood by the schema registry and the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
    Boolean,
    Blob,
    /// Microseconds since epoch
    Timestamp,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Blob => "BLOB",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }

    /// Whether a value may be stored in a column of this type. NULL is
    /// always accepted here; nullability is a separate check.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (SqlType::Integer, Value::Int(_) | Value::Bool(_)) => true,
            (SqlType::Real, Value::Double(_) | Value::Int(_)) => true,
            (SqlType::Text, Value::Text(_)) => true,
            (SqlType::Boolean, Value::Bool(_) | Value::Int(_)) => true,
            (SqlType::Blob, Value::Bytes(_)) => true,
            (SqlType::Timestamp, Value::Timestamp(_) | Value::Int(_)) => true,
            _ => false,
        }
    }

    /// Normalize a value read back from a store into this column's
    /// preferred representation (SQLite returns booleans as integers).
    pub fn normalize(&self, value: Value) -> Value {
        match (self, value) {
            (SqlType::Boolean, Value::Int(v)) => Value::Bool(v != 0),
            (SqlType::Timestamp, Value::Int(v)) => Value::Timestamp(v),
            (SqlType::Real, Value::Int(v)) => Value::Double(v as f64),
            (_, v) => v,
        }
    }
}
