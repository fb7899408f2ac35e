//! Payload boundary: per-entity-type validation and sync policy.
//!
//! The sync core never interprets field semantics, but payloads crossing
//! the boundary are shape-checked, and each entity type declares the two
//! facts conflict resolution needs: which field (if any) is its binary
//! completion flag, and whether conflicting edits of this type require
//! human judgment instead of automatic resolution.

use crate::{error::Result, EntityType, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The shapes a payload field may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since epoch, stored as an integer
    Timestamp,
    /// Nested JSON, not inspected further
    Json,
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int | FieldType::Timestamp => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One field in an entity type's payload shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Required fields must be present and non-null
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Check one payload value against this field. Absent and `null` are
    /// treated the same: fine for optional fields, an error for required
    /// ones.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        let present = match value {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(v),
        };
        match present {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(v) if self.field_type.matches(v) => Ok(()),
            Some(v) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: type_of(v).to_string(),
            }),
        }
    }
}

fn type_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) => {
            if n.is_f64() {
                "Float"
            } else {
                "Int"
            }
        }
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Shape and conflict policy for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypePolicy {
    /// Entity type name
    pub name: EntityType,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Name of the boolean field modeling irreversible completion
    /// ("it got done"); completion precedence applies only when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_field: Option<String>,
    /// Conflicting edits of this type require human judgment
    /// (e.g. financial or point adjustments)
    pub manual_review: bool,
}

impl TypePolicy {
    /// Create a policy with no completion field and automatic resolution.
    pub fn new(name: impl Into<EntityType>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            completion_field: None,
            manual_review: false,
        }
    }

    /// Builder-style: declare the completion field.
    pub fn with_completion_field(mut self, field: impl Into<String>) -> Self {
        self.completion_field = Some(field.into());
        self
    }

    /// Builder-style: require manual review for conflicts.
    pub fn with_manual_review(mut self) -> Self {
        self.manual_review = true;
        self
    }

    /// Validate a payload against this policy's fields.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Whether a payload has reached the completed state.
    pub fn is_completed(&self, payload: &serde_json::Value) -> bool {
        self.completion_field
            .as_deref()
            .and_then(|field| payload.get(field))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Policies for every entity type the sync core moves around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSchema {
    /// Schema version for migrations
    pub version: u32,
    /// Type policies by entity type name
    pub types: HashMap<EntityType, TypePolicy>,
}

impl SyncSchema {
    /// Create a new empty schema.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            types: HashMap::new(),
        }
    }

    /// Builder-style method to add a type policy.
    pub fn with_type(mut self, policy: TypePolicy) -> Self {
        self.types.insert(policy.name.clone(), policy);
        self
    }

    /// Get a type policy by name.
    pub fn policy(&self, entity_type: &str) -> Result<&TypePolicy> {
        self.types
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))
    }

    /// Validate a payload for the given entity type.
    pub fn validate(&self, entity_type: &str, payload: &serde_json::Value) -> Result<()> {
        self.policy(entity_type)?.validate_payload(payload)
    }
}
