//! Declared output shapes and validation of responder values against them.

use serde_json::{Map, Value, json};

/// The kind of value a field must hold.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text,
    /// One of a fixed set of lowercase labels.
    Label(&'static [&'static str]),
    Flag,
    Integer { min: i64, max: i64 },
    Object(Vec<FieldSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// A named structured output a phase expects back from the responder.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputShape {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl OutputShape {
    pub fn new(name: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self { name, fields }
    }

    /// JSON-schema-like description handed to model-backed responders.
    pub fn to_schema(&self) -> Value {
        fields_schema(&self.fields)
    }

    /// Check `value` against the declared fields.
    ///
    /// Required fields must be present and non-null; required text must be
    /// non-empty. Optional fields may be absent or null. Unknown keys are
    /// ignored.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("{}: expected a JSON object", self.name))?;
        validate_fields(self.name, &self.fields, obj)
    }
}

fn fields_schema(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in fields {
        let mut schema = match &field.kind {
            FieldKind::Text => json!({ "type": "string" }),
            FieldKind::Label(labels) => json!({ "type": "string", "enum": labels }),
            FieldKind::Flag => json!({ "type": "boolean" }),
            FieldKind::Integer { min, max } => {
                json!({ "type": "integer", "minimum": min, "maximum": max })
            }
            FieldKind::Object(inner) => fields_schema(inner),
        };
        if let Some(obj) = schema.as_object_mut() {
            obj.insert("description".to_string(), json!(field.description));
        }
        properties.insert(field.name.to_string(), schema);
        if field.required {
            required.push(field.name);
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn validate_fields(path: &str, fields: &[FieldSpec], obj: &Map<String, Value>) -> Result<(), String> {
    for field in fields {
        let location = format!("{path}.{}", field.name);
        match obj.get(field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(format!("{location}: required field missing"));
                }
            }
            Some(value) => validate_value(&location, field, value)?,
        }
    }
    Ok(())
}

fn validate_value(location: &str, field: &FieldSpec, value: &Value) -> Result<(), String> {
    match &field.kind {
        FieldKind::Text => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("{location}: expected a string"))?;
            if field.required && text.trim().is_empty() {
                return Err(format!("{location}: must not be empty"));
            }
        }
        FieldKind::Label(labels) => {
            let label = value
                .as_str()
                .ok_or_else(|| format!("{location}: expected a string label"))?;
            if !labels.contains(&label) {
                return Err(format!("{location}: '{label}' is not one of {labels:?}"));
            }
        }
        FieldKind::Flag => {
            if !value.is_boolean() {
                return Err(format!("{location}: expected a boolean"));
            }
        }
        FieldKind::Integer { min, max } => {
            let n = value
                .as_i64()
                .ok_or_else(|| format!("{location}: expected an integer"))?;
            if n < *min || n > *max {
                return Err(format!("{location}: {n} outside {min}..={max}"));
            }
        }
        FieldKind::Object(inner) => {
            let obj = value
                .as_object()
                .ok_or_else(|| format!("{location}: expected an object"))?;
            validate_fields(location, inner, obj)?;
        }
    }
    Ok(())
}
