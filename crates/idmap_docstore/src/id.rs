//! Entity identifier.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Primary key of a document.
///
/// Server-assigned keys are usually integers; client-generated keys are
/// strings. Both serialize untagged, so a document field holding `42` or
/// `"temp_abc"` maps directly onto an `EntityId`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Integer key.
    Int(i64),
    /// String key.
    Text(String),
}

impl EntityId {
    /// Interprets a JSON value as a key.
    ///
    /// Only integers representable as `i64` and strings qualify.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// Converts the key into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Returns the string form if this is a string key.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(_) => None,
        }
    }

    /// Returns the integer form if this is an integer key.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    /// Returns true if `value` holds exactly this key.
    ///
    /// `"42"` and `42` are different keys.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Int(n), Value::Number(v)) => v.as_i64() == Some(*n),
            (Self::Text(s), Value::String(v)) => s == v,
            _ => false,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        match id {
            EntityId::Int(n) => Value::from(n),
            EntityId::Text(s) => Value::String(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_accepts_ints_and_strings() {
        assert_eq!(EntityId::from_value(&json!(42)), Some(EntityId::Int(42)));
        assert_eq!(
            EntityId::from_value(&json!("temp_abc")),
            Some(EntityId::from("temp_abc"))
        );
        assert_eq!(EntityId::from_value(&json!(1.5)), None);
        assert_eq!(EntityId::from_value(&json!(null)), None);
        assert_eq!(EntityId::from_value(&json!(u64::MAX)), None);
    }

    #[test]
    fn matches_is_type_exact() {
        let id = EntityId::Int(42);
        assert!(id.matches(&json!(42)));
        assert!(!id.matches(&json!("42")));

        let temp = EntityId::from("temp_abc");
        assert!(temp.matches(&json!("temp_abc")));
        assert!(!temp.matches(&json!("temp_abcd")));
    }

    #[test]
    fn serde_is_untagged() {
        assert_eq!(serde_json::to_value(EntityId::Int(7)).unwrap(), json!(7));
        assert_eq!(
            serde_json::from_value::<EntityId>(json!("x")).unwrap(),
            EntityId::from("x")
        );
    }

    #[test]
    fn display() {
        assert_eq!(EntityId::Int(42).to_string(), "42");
        assert_eq!(EntityId::from("temp_abc").to_string(), "temp_abc");
    }
}
