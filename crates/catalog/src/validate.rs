//! Validation of resource definitions against a type's JSON schema.

use fleet_core::ResourceType;
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CatalogError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub error: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() { write!(f, "{}", self.error) } else { write!(f, "{}: {}", self.path, self.error) }
    }
}

fn schema_is_empty(schema: &Value) -> bool {
    match schema {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Validate `definition` against the type's schema. Returns the issues found; empty on success.
pub fn validate_definition(resource_type: &ResourceType, definition: &Value) -> Result<Vec<ValidationIssue>, CatalogError> {
    if schema_is_empty(&resource_type.json_schema) {
        return Ok(Vec::new());
    }
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&resource_type.json_schema)
        .map_err(|e| CatalogError::InvalidSchema { id: resource_type.id.clone(), reason: e.to_string() })?;
    let mut issues = Vec::new();
    if let Err(errors) = compiled.validate(definition) {
        for err in errors {
            issues.push(ValidationIssue { path: err.instance_path.to_string(), error: err.to_string() });
        }
    }
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn typ(schema: Value) -> ResourceType {
        ResourceType { id: "processor_0.1".into(), json_schema: schema, ..Default::default() }
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_definition(&typ(Value::Null), &json!({"x": 1})).unwrap().is_empty());
        assert!(validate_definition(&typ(json!({})), &json!("whatever")).unwrap().is_empty());
    }

    #[test]
    fn reports_missing_required_field() {
        let t = typ(json!({
            "type": "object",
            "required": ["topic"],
            "properties": { "topic": { "type": "string" }, "replicas": { "type": "integer" } }
        }));
        assert!(validate_definition(&t, &json!({"topic": "orders"})).unwrap().is_empty());
        let issues = validate_definition(&t, &json!({"replicas": "two"})).unwrap();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.error.contains("topic")));
        assert!(issues.iter().any(|i| i.path == "/replicas"));
    }

    #[test]
    fn invalid_schema_is_an_error() {
        let t = typ(json!({"type": 12}));
        assert!(matches!(validate_definition(&t, &json!({})), Err(CatalogError::InvalidSchema { .. })));
    }
}
