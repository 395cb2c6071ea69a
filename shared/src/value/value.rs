use std::hash::{Hash, Hasher};

use serde_json::Value as JsonValue;

use super::Instance;

/// A value held by a tracked object: a primitive or a reference to another
/// instance.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(Instance),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Object(instance) => Some(instance),
            _ => None,
        }
    }

    /// Type name used by allow-lists: `null`, `boolean`, `number`, `string`,
    /// or the instance's type name.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "boolean".to_string(),
            Value::Number(_) => "number".to_string(),
            Value::String(_) => "string".to_string(),
            Value::Object(instance) => instance.type_name(),
        }
    }

    /// Converts a primitive into its JSON form. Returns `None` for objects.
    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            Value::Null => Some(JsonValue::Null),
            Value::Bool(value) => Some(JsonValue::Bool(*value)),
            Value::Number(value) => Some(
                serde_json::Number::from_f64(*value)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
            ),
            Value::String(value) => Some(JsonValue::String(value.clone())),
            Value::Object(_) => None,
        }
    }

    /// Reads a JSON primitive. Arrays and maps are not primitives and yield
    /// `None`.
    pub fn from_json(json: &JsonValue) -> Option<Value> {
        match json {
            JsonValue::Null => Some(Value::Null),
            JsonValue::Bool(value) => Some(Value::Bool(*value)),
            JsonValue::Number(number) => number.as_f64().map(Value::Number),
            JsonValue::String(value) => Some(Value::String(value.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }
}

fn number_bits(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => number_bits(*a) == number_bits(*b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(value) => value.hash(state),
            Value::Number(value) => number_bits(*value).hash(state),
            Value::String(value) => value.hash(state),
            Value::Object(instance) => instance.key().hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Instance> for Value {
    fn from(value: Instance) -> Self {
        Value::Object(value)
    }
}

impl From<&Instance> for Value {
    fn from(value: &Instance) -> Self {
        Value::Object(value.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
