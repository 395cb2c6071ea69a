use std::any::Any;

use super::Value;

/// Property access for a structured object body. Implemented by user types,
/// or use [`DynamicObject`] as a property bag.
pub trait SyncObject: Any + Send + Sync {
    fn type_name(&self) -> &str;
    fn get(&self, key: &str) -> Value;
    fn set(&mut self, key: &str, value: Value);
    /// Keys currently present, in declaration order.
    fn keys(&self) -> Vec<String>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Insertion-ordered property bag.
#[derive(Clone, Debug, Default)]
pub struct DynamicObject {
    type_name: String,
    properties: Vec<(String, Value)>,
}

impl DynamicObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            properties: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(&key.into(), value.into());
        self
    }
}

impl SyncObject for DynamicObject {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get(&self, key: &str) -> Value {
        self.properties
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Null)
    }

    fn set(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.properties.iter_mut().find(|(existing, _)| existing == key) {
            slot.1 = value;
        } else {
            self.properties.push((key.to_string(), value));
        }
    }

    fn keys(&self) -> Vec<String> {
        self.properties.iter().map(|(key, _)| key.clone()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
