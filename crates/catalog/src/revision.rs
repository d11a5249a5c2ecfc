//! Typed extraction of the shard metadata revision.

use fleet_core::CatalogKind;
use serde_json::{Map, Value};

use crate::CatalogError;

/// Validated revision number found under the kind's revision key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShardRevision(pub i64);

impl ShardRevision {
    pub fn decode(key: &str, value: &Value) -> Result<Self, CatalogError> {
        let invalid = |found: &str| CatalogError::RevisionInvalid { key: key.to_string(), found: found.to_string() };
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return if i >= 0 { Ok(Self(i)) } else { Err(invalid("negative number")) };
                }
                // YAML and some generators emit integral revisions as floats (e.g. `3.0`).
                match n.as_f64() {
                    Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= i64::MAX as f64 => Ok(Self(f as i64)),
                    Some(f) if f < 0.0 => Err(invalid("negative number")),
                    _ => Err(invalid("fractional number")),
                }
            }
            Value::String(_) => Err(invalid("string")),
            Value::Bool(_) => Err(invalid("boolean")),
            Value::Array(_) => Err(invalid("array")),
            Value::Object(_) => Err(invalid("object")),
            Value::Null => Err(invalid("null")),
        }
    }
}

/// Revision of a channel's shard metadata for the given catalog kind.
pub fn shard_revision(kind: CatalogKind, metadata: &Map<String, Value>) -> Result<i64, CatalogError> {
    let key = kind.revision_key();
    let value = metadata.get(key).ok_or_else(|| CatalogError::RevisionMissing { key: key.to_string() })?;
    ShardRevision::decode(key, value).map(|r| r.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn integer_revision() {
        let m = meta(json!({"processor_revision": 42, "image": "quay.io/x"}));
        assert_eq!(shard_revision(CatalogKind::Processor, &m).unwrap(), 42);
    }

    #[test]
    fn integral_float_revision() {
        let m = meta(json!({"connector_revision": 7.0}));
        assert_eq!(shard_revision(CatalogKind::Connector, &m).unwrap(), 7);
    }

    #[test]
    fn missing_revision_names_key() {
        let m = meta(json!({"connector_revision": 1}));
        let err = shard_revision(CatalogKind::Processor, &m).unwrap_err();
        assert_eq!(err.to_string(), "processor_revision not found in shard metadata");
    }

    #[test]
    fn non_numeric_revision_names_type() {
        let m = meta(json!({"processor_revision": "12"}));
        let err = shard_revision(CatalogKind::Processor, &m).unwrap_err();
        assert_eq!(err.to_string(), "processor_revision in shard metadata must be a non-negative integer, got string");
        let m = meta(json!({"processor_revision": -1}));
        assert!(matches!(shard_revision(CatalogKind::Processor, &m), Err(CatalogError::RevisionInvalid { .. })));
        let m = meta(json!({"processor_revision": 1.5}));
        assert!(shard_revision(CatalogKind::Processor, &m).unwrap_err().to_string().ends_with("fractional number"));
    }
}
