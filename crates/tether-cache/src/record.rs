//! Record identities and field-level helpers.
//!
//! Records are JSON objects. The cache never interprets fields other than
//! the configured identity field.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CacheError;

/// A record as stored in the cache.
pub type Record = Value;

/// Identity of a record within one cache instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Integer identity (`{"id": 1}`).
    Int(i64),
    /// String identity (`{"_id": "abc"}`).
    Str(String),
}

impl RecordId {
    /// Interpret a bare JSON value as an identity.
    ///
    /// Only integers and strings qualify; floats, nulls and containers do not.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordId::Int),
            Value::String(s) => Some(RecordId::Str(s.clone())),
            _ => None,
        }
    }

    /// Convert back into a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(n) => Value::from(*n),
            RecordId::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{}", n),
            RecordId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Int(n)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Str(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId::Str(s)
    }
}

/// Read the identity of a record, if it has one.
pub fn identity_of(record: &Value, id_field: &str) -> Option<RecordId> {
    record.get(id_field).and_then(RecordId::from_value)
}

/// Take the field map of a record, or reject a non-object value.
pub(crate) fn fields(record: Value) -> Result<Map<String, Value>, CacheError> {
    match record {
        Value::Object(map) => Ok(map),
        other => Err(CacheError::InvalidRecord(format!(
            "expected a JSON object, got {}",
            kind_name(&other)
        ))),
    }
}

/// Reject a change set that would move a record to a different identity.
pub(crate) fn check_identity(
    changes: &Map<String, Value>,
    id_field: &str,
    id: &RecordId,
) -> Result<(), CacheError> {
    match changes.get(id_field) {
        None => Ok(()),
        Some(value) => match RecordId::from_value(value) {
            Some(ref attempted) if attempted == id => Ok(()),
            Some(attempted) => Err(CacheError::IdentityMismatch {
                id: id.clone(),
                attempted,
            }),
            None => Err(CacheError::InvalidRecord(format!(
                "identity field `{}` must be an integer or string",
                id_field
            ))),
        },
    }
}

/// Shallow-merge `changes` into `target`, field by field.
pub(crate) fn merge_into(target: &mut Value, changes: Map<String, Value>) {
    if let Value::Object(existing) = target {
        for (key, value) in changes {
            existing.insert(key, value);
        }
    }
}

/// Replace every field of `target`, keeping the identity field intact.
pub(crate) fn replace_fields(
    target: &mut Value,
    mut replacement: Map<String, Value>,
    id_field: &str,
    id: &RecordId,
) {
    replacement.insert(id_field.to_string(), id.to_value());
    *target = Value::Object(replacement);
}

pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_of() {
        assert_eq!(identity_of(&json!({"id": 1}), "id"), Some(RecordId::Int(1)));
        assert_eq!(
            identity_of(&json!({"_id": "abc"}), "_id"),
            Some(RecordId::from("abc"))
        );
        assert_eq!(identity_of(&json!({"id": 1.5}), "id"), None);
        assert_eq!(identity_of(&json!({"name": "x"}), "id"), None);
    }

    #[test]
    fn test_untagged_serde() {
        let ids: Vec<RecordId> = serde_json::from_str(r#"[1, "two"]"#).unwrap();
        assert_eq!(ids, vec![RecordId::Int(1), RecordId::from("two")]);
        assert_eq!(serde_json::to_string(&ids).unwrap(), r#"[1,"two"]"#);
    }

    #[test]
    fn test_check_identity() {
        let id = RecordId::Int(1);
        let same = fields(json!({"id": 1, "name": "a"})).unwrap();
        assert!(check_identity(&same, "id", &id).is_ok());

        let other = fields(json!({"id": 2})).unwrap();
        assert!(matches!(
            check_identity(&other, "id", &id),
            Err(CacheError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_fields_rejects_non_object() {
        assert!(matches!(fields(json!([1, 2])), Err(CacheError::InvalidRecord(_))));
    }

    #[test]
    fn test_replace_keeps_identity() {
        let mut record = json!({"id": 1, "name": "a", "extra": true});
        replace_fields(
            &mut record,
            fields(json!({"name": "b"})).unwrap(),
            "id",
            &RecordId::Int(1),
        );
        assert_eq!(record, json!({"id": 1, "name": "b"}));
    }
}
