//! Hashable, orderable primary-key representation.

use crate::error::{Error, TypeError};
use crate::value::Value;
use std::fmt;

/// One component of a key.
///
/// `Value` holds an `f64` and so cannot be `Eq`/`Hash`; keys and unique
/// indexes use this instead. Booleans and timestamps fold into `Int` so that
/// keys compare the same way stores compare them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Int(i64),
    Real(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl KeyPart {
    /// Convert a non-null value. Returns `None` for NULL.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(KeyPart::Int(i64::from(*b))),
            Value::Int(v) | Value::Timestamp(v) => Some(KeyPart::Int(*v)),
            Value::Double(v) => {
                // Integral doubles must match the integer key they equal.
                if v.fract() == 0.0 && v.abs() < 9.0e15 {
                    Some(KeyPart::Int(*v as i64))
                } else {
                    Some(KeyPart::Real(v.to_bits()))
                }
            }
            Value::Text(s) => Some(KeyPart::Text(s.clone())),
            Value::Bytes(b) => Some(KeyPart::Bytes(b.clone())),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            KeyPart::Int(v) => Value::Int(*v),
            KeyPart::Real(bits) => Value::Double(f64::from_bits(*bits)),
            KeyPart::Text(s) => Value::Text(s.clone()),
            KeyPart::Bytes(b) => Value::Bytes(b.clone()),
        }
    }
}

/// A complete primary key: one part per primary-key column, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkKey(Vec<KeyPart>);

impl PkKey {
    /// Build a key from primary-key values.
    ///
    /// Fails if any component is NULL: a row without a complete key has no
    /// identity yet.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> crate::Result<Self> {
        let mut parts = Vec::new();
        for value in values {
            match KeyPart::from_value(value) {
                Some(part) => parts.push(part),
                None => {
                    return Err(Error::Type(TypeError {
                        expected: "non-null primary key",
                        actual: value.type_name().to_string(),
                        column: None,
                    }));
                }
            }
        }
        Ok(Self(parts))
    }

    /// Single-column key.
    pub fn single(value: impl Into<Value>) -> crate::Result<Self> {
        let value = value.into();
        Self::from_values(std::iter::once(&value))
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.0.iter().map(KeyPart::to_value).collect()
    }
}

impl fmt::Display for PkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|p| p.to_value().display()).collect();
        write!(f, "({})", rendered.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_component_is_rejected() {
        assert!(PkKey::from_values(&[Value::Int(1), Value::Null]).is_err());
        assert!(PkKey::single(Value::Null).is_err());
    }

    #[test]
    fn numeric_forms_share_a_key() {
        let a = PkKey::single(1_i64).unwrap();
        let b = PkKey::single(1.0_f64).unwrap();
        let c = PkKey::single(true).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, PkKey::single("1").unwrap());
    }

    #[test]
    fn display_lists_parts() {
        let key = PkKey::from_values(&[Value::Int(3), Value::Text("x".into())]).unwrap();
        assert_eq!(key.to_string(), "(3, 'x')");
        assert_eq!(key.to_values(), vec![Value::Int(3), Value::Text("x".into())]);
    }
}
