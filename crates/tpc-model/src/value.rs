//! Attribute values

use serde_json::Value;

/// Attribute value accepted by buffered writes
///
/// `Unset` stands for "no value at all" and is distinct from JSON `null`.
/// Writers that want to drop an attribute must delete it explicitly instead
/// of writing `Unset`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AttrValue {
    /// No value
    #[default]
    Unset,
    /// Concrete JSON value (including `null`)
    Value(Value),
}

impl AttrValue {
    /// Check for the unset sentinel
    #[inline]
    #[must_use]
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Concrete value, if any
    #[inline]
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Unset => None,
            Self::Value(value) => Some(value),
        }
    }
}

impl From<Value> for AttrValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Option<Value>> for AttrValue {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Unset, Self::Value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Value(Value::from(value))
    }
}
