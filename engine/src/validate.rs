//! Request validation.
//!
//! Requests are checked synchronously before anything is persisted. The
//! structural checks always run; payload shape checks run only for
//! operations that have a registered [`OperationSchema`].

use crate::{error::Result, Error, NewItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Field types a payload schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the epoch
    Timestamp,
    /// Any JSON value
    Json,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Json => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// One payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
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

    /// Check a field value. `null` counts as absent.
    pub fn check(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) if self.field_type.accepts(v) => Ok(()),
            Some(v) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: type_name(v).to_string(),
            }),
        }
    }
}

/// Payload shape of one remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSchema {
    pub operation_name: String,
    pub fields: Vec<FieldDef>,
}

impl OperationSchema {
    pub fn new(operation_name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            operation_name: operation_name.into(),
            fields,
        }
    }

    /// Check a payload: it must be an object and every field must pass.
    pub fn check(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;
        self.fields
            .iter()
            .try_for_each(|field| field.check(obj.get(&field.name)))
    }
}

/// Registry of payload schemas plus the structural request checks.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    schemas: HashMap<String, OperationSchema>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: OperationSchema) -> &mut Self {
        self.schemas.insert(schema.operation_name.clone(), schema);
        self
    }

    pub fn schema(&self, operation_name: &str) -> Option<&OperationSchema> {
        self.schemas.get(operation_name)
    }

    /// Validate a request. `has_failed` reports whether an item id already
    /// failed terminally.
    pub fn validate<F>(&self, request: &NewItem, has_failed: F) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        if request.metadata.operation_name.trim().is_empty() {
            return Err(Error::EmptyOperationName);
        }
        if request.operation_type.requires_payload() && request.payload.is_null() {
            return Err(Error::InvalidPayload(format!(
                "{} requires a payload",
                request.operation_type
            )));
        }
        if let Some(key) = &request.entity_key {
            if key.is_empty() {
                return Err(Error::EmptyEntityKey);
            }
        }
        if let Some(dep) = request.dependencies.iter().find(|dep| has_failed(dep)) {
            return Err(Error::DependencyFailed(dep.clone()));
        }
        match self.schemas.get(&request.metadata.operation_name) {
            Some(schema) => schema.check(&request.payload),
            None => Ok(()),
        }
    }
}
