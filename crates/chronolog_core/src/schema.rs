//! Topic schemas: field names mapped to default values.
//!
//! A schema is advisory shape information persisted next to the topic
//! descriptor. When a topic has a non-empty schema, appended payloads are
//! conformed to it: unknown fields are rejected, absent fields are filled
//! from their defaults, and a field whose default is `null` is required.
//! Topics with an empty schema accept any object payload.

use crate::error::{CoreError, CoreResult};
use serde_json::{Map, Value};

/// Field-name to default-value mapping for a topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Map<String, Value>,
}

impl Schema {
    /// Creates an empty schema that accepts any object payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a schema from a field → default map.
    #[must_use]
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Returns true when no fields are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The declared fields and their defaults.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Conforms a payload to this schema.
    ///
    /// The payload must be a JSON object. With a non-empty schema, fields
    /// not declared are rejected, declared fields missing from the payload
    /// are filled with their defaults, and a missing field whose default is
    /// `null` is an error.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` on any violation.
    pub fn conform(&self, payload: Value) -> CoreResult<Map<String, Value>> {
        let Value::Object(mut record) = payload else {
            return Err(CoreError::schema_mismatch("payload is not an object"));
        };

        if self.fields.is_empty() {
            return Ok(record);
        }

        for field in record.keys() {
            if !self.fields.contains_key(field) {
                return Err(CoreError::schema_mismatch(format!(
                    "unknown field: {field}"
                )));
            }
        }

        for (field, default) in &self.fields {
            if record.contains_key(field) {
                continue;
            }
            if default.is_null() {
                return Err(CoreError::schema_mismatch(format!(
                    "missing required field: {field}"
                )));
            }
            record.insert(field.clone(), default.clone());
        }

        Ok(record)
    }

    /// Serializes the schema as the persisted JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Loads a schema from its persisted JSON object.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` when the value is not an object.
    pub fn from_json(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(CoreError::corrupted(format!(
                "schema file is not an object: {other}"
            ))),
        }
    }
}
