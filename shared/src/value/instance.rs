use std::{
    fmt,
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
};

use serde_json::Value as JsonValue;

use crate::world::diff::SpliceInstruction;

use super::{
    ErrorValue, FinalizationHook, MutSender, Mutation, SyncObject, Value,
};

/// Identity key of an instance: the address of its shared allocation. Only
/// stable while some handle (strong or weak) keeps the allocation alive.
pub type InstanceKey = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    Object,
    Array,
    Map,
    Set,
    Error,
    Simple,
}

enum InstanceBody {
    Object(Box<dyn SyncObject>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Error(ErrorValue),
    Simple { type_id: String, value: JsonValue },
}

impl InstanceBody {
    fn type_name(&self) -> String {
        match self {
            InstanceBody::Object(object) => object.type_name().to_string(),
            InstanceBody::Array(_) => "Array".to_string(),
            InstanceBody::Map(_) => "Map".to_string(),
            InstanceBody::Set(_) => "Set".to_string(),
            InstanceBody::Error(error) => error.kind.as_str().to_string(),
            InstanceBody::Simple { type_id, .. } => type_id.clone(),
        }
    }
}

struct InstanceInner {
    body: RwLock<InstanceBody>,
    observable: bool,
    observers: Mutex<Vec<MutSender>>,
    finalizers: Mutex<Vec<FinalizationHook>>,
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        let hooks = match self.finalizers.get_mut() {
            Ok(hooks) => std::mem::take(hooks),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for hook in hooks {
            hook.fire();
        }
    }
}

/// Shared handle to a live object. Cloning shares the object; equality of
/// handles is identity.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

/// Non-owning handle to an [`Instance`].
#[derive(Clone)]
pub struct WeakInstance {
    inner: Weak<InstanceInner>,
}

impl WeakInstance {
    pub fn upgrade(&self) -> Option<Instance> {
        self.inner.upgrade().map(|inner| Instance { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl Instance {
    fn from_body(body: InstanceBody, observable: bool) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                body: RwLock::new(body),
                observable,
                observers: Mutex::new(Vec::new()),
                finalizers: Mutex::new(Vec::new()),
            }),
        }
    }

    // Constructors

    pub fn new_object(object: impl SyncObject) -> Self {
        Self::from_body(InstanceBody::Object(Box::new(object)), true)
    }

    pub fn new_boxed_object(object: Box<dyn SyncObject>) -> Self {
        Self::from_body(InstanceBody::Object(object), true)
    }

    /// Plain array: mutators only emit a coarse [`Mutation::Touched`].
    pub fn new_array(items: Vec<Value>) -> Self {
        Self::from_body(InstanceBody::Array(items), false)
    }

    /// Observable array: mutators record precise splices.
    pub fn new_observable_array(items: Vec<Value>) -> Self {
        Self::from_body(InstanceBody::Array(items), true)
    }

    pub fn new_map(entries: Vec<(Value, Value)>) -> Self {
        Self::from_body(InstanceBody::Map(dedupe_entries(entries)), false)
    }

    pub fn new_observable_map(entries: Vec<(Value, Value)>) -> Self {
        Self::from_body(InstanceBody::Map(dedupe_entries(entries)), true)
    }

    pub fn new_set(values: Vec<Value>) -> Self {
        Self::from_body(InstanceBody::Set(dedupe_values(values)), false)
    }

    pub fn new_observable_set(values: Vec<Value>) -> Self {
        Self::from_body(InstanceBody::Set(dedupe_values(values)), true)
    }

    pub fn new_error(error: ErrorValue) -> Self {
        Self::from_body(InstanceBody::Error(error), false)
    }

    pub fn new_simple(type_id: impl Into<String>, value: JsonValue) -> Self {
        Self::from_body(
            InstanceBody::Simple {
                type_id: type_id.into(),
                value,
            },
            false,
        )
    }

    // Identity

    pub fn key(&self) -> InstanceKey {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn kind(&self) -> InstanceKind {
        match &*self.read() {
            InstanceBody::Object(_) => InstanceKind::Object,
            InstanceBody::Array(_) => InstanceKind::Array,
            InstanceBody::Map(_) => InstanceKind::Map,
            InstanceBody::Set(_) => InstanceKind::Set,
            InstanceBody::Error(_) => InstanceKind::Error,
            InstanceBody::Simple { .. } => InstanceKind::Simple,
        }
    }

    pub fn is_observable(&self) -> bool {
        self.inner.observable
    }

    pub fn type_name(&self) -> String {
        self.read().type_name()
    }

    fn read(&self) -> RwLockReadGuard<'_, InstanceBody> {
        let Ok(body) = self.inner.body.read() else {
            panic!("Instance body poisoned");
        };
        body
    }

    fn write(&self) -> RwLockWriteGuard<'_, InstanceBody> {
        let Ok(body) = self.inner.body.write() else {
            panic!("Instance body poisoned");
        };
        body
    }

    fn notify(&self, mutation: Mutation) {
        let Ok(mut observers) = self.inner.observers.lock() else {
            panic!("Instance observers poisoned");
        };
        observers.retain(|observer| observer.send(mutation.clone()));
    }

    fn collection_changed(&self, precise: impl FnOnce() -> Mutation) {
        if self.inner.observable {
            self.notify(precise());
        } else {
            self.notify(Mutation::Touched);
        }
    }

    // Observation

    pub(crate) fn attach_observer(&self, sender: MutSender) {
        let Ok(mut observers) = self.inner.observers.lock() else {
            panic!("Instance observers poisoned");
        };
        if !observers.iter().any(|existing| existing.is_same(&sender)) {
            observers.push(sender);
        }
    }

    pub(crate) fn detach_observer(&self, sender: &MutSender) {
        let Ok(mut observers) = self.inner.observers.lock() else {
            panic!("Instance observers poisoned");
        };
        observers.retain(|existing| !existing.is_same(sender));
    }

    pub(crate) fn add_finalizer(&self, hook: FinalizationHook) {
        let Ok(mut finalizers) = self.inner.finalizers.lock() else {
            panic!("Instance finalizers poisoned");
        };
        if !finalizers.iter().any(|existing| existing.targets(&hook)) {
            finalizers.push(hook);
        }
    }

    // Structured objects

    pub fn get(&self, key: &str) -> Value {
        match &*self.read() {
            InstanceBody::Object(object) => object.get(key),
            _ => Value::Null,
        }
    }

    /// Sets a property. Non-object instances ignore the call.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        {
            let mut body = self.write();
            let InstanceBody::Object(object) = &mut *body else {
                return;
            };
            object.set(key, value.into());
        }
        self.notify(Mutation::Property {
            key: key.to_string(),
        });
    }

    pub fn keys(&self) -> Vec<String> {
        match &*self.read() {
            InstanceBody::Object(object) => object.keys(),
            _ => Vec::new(),
        }
    }

    pub fn with_object<T: SyncObject, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match &*self.read() {
            InstanceBody::Object(object) => object.as_any().downcast_ref::<T>().map(f),
            _ => None,
        }
    }

    /// Mutable typed access. Call [`Instance::mark_changed`] for every property
    /// touched, the engine cannot see inside the closure.
    pub fn with_object_mut<T: SyncObject, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        match &mut *self.write() {
            InstanceBody::Object(object) => object.as_any_mut().downcast_mut::<T>().map(f),
            _ => None,
        }
    }

    pub fn mark_changed(&self, key: &str) {
        self.notify(Mutation::Property {
            key: key.to_string(),
        });
    }

    // Arrays

    pub fn len(&self) -> usize {
        match &*self.read() {
            InstanceBody::Array(items) | InstanceBody::Set(items) => items.len(),
            InstanceBody::Map(entries) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn items(&self) -> Vec<Value> {
        match &*self.read() {
            InstanceBody::Array(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn get_index(&self, index: usize) -> Value {
        match &*self.read() {
            InstanceBody::Array(items) => items.get(index).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn push(&self, value: impl Into<Value>) {
        let value = value.into();
        let start = {
            let mut body = self.write();
            let InstanceBody::Array(items) = &mut *body else {
                return;
            };
            items.push(value.clone());
            items.len() - 1
        };
        self.collection_changed(|| Mutation::Splice(SpliceInstruction::new(start, 0, vec![value])));
    }

    /// Removes `delete_count` items at `start` and inserts `items` there.
    /// Out of range bounds are clamped.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Vec<Value> {
        let (start, removed) = {
            let mut body = self.write();
            let InstanceBody::Array(current) = &mut *body else {
                return Vec::new();
            };
            let start = start.min(current.len());
            let end = start.saturating_add(delete_count).min(current.len());
            let removed: Vec<Value> = current.splice(start..end, items.iter().cloned()).collect();
            (start, removed)
        };
        if removed.is_empty() && items.is_empty() {
            return removed;
        }
        let delete_count = removed.len();
        self.collection_changed(|| {
            Mutation::Splice(SpliceInstruction::new(start, delete_count, items))
        });
        removed
    }

    pub fn set_index(&self, index: usize, value: impl Into<Value>) {
        let value = value.into();
        let len = self.len();
        if index < len {
            self.splice(index, 1, vec![value]);
        } else {
            let mut padded = vec![Value::Null; index - len];
            padded.push(value);
            self.splice(len, 0, padded);
        }
    }

    pub fn remove(&self, index: usize) -> Value {
        self.splice(index, 1, Vec::new())
            .into_iter()
            .next()
            .unwrap_or(Value::Null)
    }

    /// Raw access to the storage of an array. Always reported as
    /// [`Mutation::Touched`].
    pub fn with_array_mut<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        let result = match &mut *self.write() {
            InstanceBody::Array(items) => f(items),
            _ => return None,
        };
        self.notify(Mutation::Touched);
        Some(result)
    }

    // Maps

    pub fn map_get(&self, key: &Value) -> Option<Value> {
        match &*self.read() {
            InstanceBody::Map(entries) => entries
                .iter()
                .find(|(existing, _)| existing == key)
                .map(|(_, value)| value.clone()),
            _ => None,
        }
    }

    pub fn map_entries(&self) -> Vec<(Value, Value)> {
        match &*self.read() {
            InstanceBody::Map(entries) => entries.clone(),
            _ => Vec::new(),
        }
    }

    pub fn map_set(&self, key: impl Into<Value>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let previously_present = {
            let mut body = self.write();
            let InstanceBody::Map(entries) = &mut *body else {
                return;
            };
            match entries.iter_mut().find(|(existing, _)| *existing == key) {
                Some(slot) => {
                    slot.1 = value.clone();
                    true
                }
                None => {
                    entries.push((key.clone(), value.clone()));
                    false
                }
            }
        };
        self.collection_changed(|| Mutation::MapSet {
            key,
            value,
            previously_present,
        });
    }

    pub fn map_delete(&self, key: &Value) -> bool {
        let removed = {
            let mut body = self.write();
            let InstanceBody::Map(entries) = &mut *body else {
                return false;
            };
            let before = entries.len();
            entries.retain(|(existing, _)| existing != key);
            entries.len() != before
        };
        if removed {
            self.collection_changed(|| Mutation::MapDelete { key: key.clone() });
        }
        removed
    }

    // Sets

    pub fn set_values(&self) -> Vec<Value> {
        match &*self.read() {
            InstanceBody::Set(values) => values.clone(),
            _ => Vec::new(),
        }
    }

    pub fn set_has(&self, value: &Value) -> bool {
        match &*self.read() {
            InstanceBody::Set(values) => values.contains(value),
            _ => false,
        }
    }

    pub fn set_add(&self, value: impl Into<Value>) -> bool {
        let value = value.into();
        {
            let mut body = self.write();
            let InstanceBody::Set(values) = &mut *body else {
                return false;
            };
            if values.contains(&value) {
                return false;
            }
            values.push(value.clone());
        }
        self.collection_changed(|| Mutation::SetAdd { value });
        true
    }

    pub fn set_delete(&self, value: &Value) -> bool {
        let removed = {
            let mut body = self.write();
            let InstanceBody::Set(values) = &mut *body else {
                return false;
            };
            let before = values.len();
            values.retain(|existing| existing != value);
            values.len() != before
        };
        if removed {
            self.collection_changed(|| Mutation::SetDelete {
                value: value.clone(),
            });
        }
        removed
    }

    /// Empties an array, map or set.
    pub fn clear(&self) {
        let removed_array = {
            let mut body = self.write();
            match &mut *body {
                InstanceBody::Array(items) => {
                    let count = items.len();
                    items.clear();
                    Some(count)
                }
                InstanceBody::Map(entries) => {
                    entries.clear();
                    None
                }
                InstanceBody::Set(values) => {
                    values.clear();
                    None
                }
                _ => return,
            }
        };
        match removed_array {
            Some(0) => {}
            Some(count) => self.collection_changed(|| {
                Mutation::Splice(SpliceInstruction::new(0, count, Vec::new()))
            }),
            None => self.collection_changed(|| Mutation::Clear),
        }
    }

    // Errors and simple values

    pub fn error_value(&self) -> Option<ErrorValue> {
        match &*self.read() {
            InstanceBody::Error(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn simple_value(&self) -> Option<JsonValue> {
        match &*self.read() {
            InstanceBody::Simple { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set_simple_value(&self, value: JsonValue) {
        {
            let mut body = self.write();
            let InstanceBody::Simple { value: current, .. } = &mut *body else {
                return;
            };
            *current = value;
        }
        self.notify(Mutation::Touched);
    }
}

fn dedupe_entries(entries: Vec<(Value, Value)>) -> Vec<(Value, Value)> {
    let mut output: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match output.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => output.push((key, value)),
        }
    }
    output
}

fn dedupe_values(values: Vec<Value>) -> Vec<Value> {
    let mut output: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        if !output.contains(&value) {
            output.push(value);
        }
    }
    output
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Instance {}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let type_name = match self.inner.body.try_read() {
            Ok(body) => body.type_name(),
            Err(_) => "<locked>".to_string(),
        };
        write!(f, "Instance({}@{:x})", type_name, self.key())
    }
}
