use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::{value::SyncObject, ClientToken, Instance, ObjectId, Value};

pub type PeerPredicate = Arc<dyn Fn(&ClientToken) -> bool + Send + Sync>;
/// Rewrites a property value for one peer. `None` hides the property from it.
pub type BeforeSendHook = Arc<dyn Fn(&Instance, &ClientToken, &Value) -> Option<Value> + Send + Sync>;
pub type AfterChangeHook = Arc<dyn Fn(&Instance, &Value) + Send + Sync>;
/// Rewrites outbound invocation arguments for one peer. `None` skips the peer.
pub type BeforeExecuteHook =
    Arc<dyn Fn(&Instance, &ClientToken, Vec<Value>) -> Option<Vec<Value>> + Send + Sync>;
pub type MethodHandler = Arc<dyn Fn(&Instance, Vec<Value>) -> MethodReturn + Send + Sync>;
pub type Constructor =
    Arc<dyn Fn(Vec<Value>) -> Result<Box<dyn SyncObject>, String> + Send + Sync>;

/// Outcome of a method body: settled now, or a future to drive.
pub enum MethodReturn {
    Ready(Result<Value, Value>),
    Pending(BoxFuture<'static, Result<Value, Value>>),
}

impl MethodReturn {
    pub fn ok(value: impl Into<Value>) -> Self {
        MethodReturn::Ready(Ok(value.into()))
    }

    pub fn err(value: impl Into<Value>) -> Self {
        MethodReturn::Ready(Err(value.into()))
    }

    pub fn pending(future: BoxFuture<'static, Result<Value, Value>>) -> Self {
        MethodReturn::Pending(future)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PromiseHandling {
    /// Reply once the returned future settles
    #[default]
    Await,
    /// Reply immediately with `null` and keep driving the future
    FireAndForget,
}

/// Optional hooks run when a peer creates or deletes an object of this type.
pub trait LifecycleHooks: Send + Sync {
    fn on_created(&self, _instance: &Instance, _object_id: &ObjectId) {}
    fn on_deleted(&self, _instance: &Instance, _object_id: &ObjectId) {}
}

#[derive(Clone)]
pub struct TrackedProperty {
    pub key: String,
    pub can_track: Option<PeerPredicate>,
    pub can_apply: Option<PeerPredicate>,
    pub before_send_to_client: Option<BeforeSendHook>,
    pub after_value_changed: Option<AfterChangeHook>,
    pub allowed_types_from_sender: Option<Vec<String>>,
    pub constructor_argument: bool,
}

impl TrackedProperty {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            can_track: None,
            can_apply: None,
            before_send_to_client: None,
            after_value_changed: None,
            allowed_types_from_sender: None,
            constructor_argument: false,
        }
    }

    pub fn can_track(mut self, predicate: impl Fn(&ClientToken) -> bool + Send + Sync + 'static) -> Self {
        self.can_track = Some(Arc::new(predicate));
        self
    }

    pub fn can_apply(mut self, predicate: impl Fn(&ClientToken) -> bool + Send + Sync + 'static) -> Self {
        self.can_apply = Some(Arc::new(predicate));
        self
    }

    /// Rejects writes from every peer.
    pub fn read_only(self) -> Self {
        self.can_apply(|_| false)
    }

    pub fn before_send_to_client(
        mut self,
        hook: impl Fn(&Instance, &ClientToken, &Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.before_send_to_client = Some(Arc::new(hook));
        self
    }

    pub fn after_value_changed(mut self, hook: impl Fn(&Instance, &Value) + Send + Sync + 'static) -> Self {
        self.after_value_changed = Some(Arc::new(hook));
        self
    }

    pub fn allowed_types_from_sender(mut self, types: &[&str]) -> Self {
        self.allowed_types_from_sender = Some(types.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn constructor_argument(mut self) -> Self {
        self.constructor_argument = true;
        self
    }

    pub fn tracks_for(&self, client: &ClientToken) -> bool {
        self.can_track.as_ref().map_or(true, |predicate| predicate(client))
    }

    pub fn applies_from(&self, client: &ClientToken) -> bool {
        self.can_apply.as_ref().map_or(true, |predicate| predicate(client))
    }
}

#[derive(Clone)]
pub struct TrackedMethod {
    pub name: String,
    pub handler: Option<MethodHandler>,
    pub can_track: Option<PeerPredicate>,
    pub can_apply: Option<PeerPredicate>,
    pub promise_handling: PromiseHandling,
    pub before_execute_on_client: Option<BeforeExecuteHook>,
    /// One optional allow-list per parameter position
    pub allowed_parameter_types_from_sender: Option<Vec<Option<Vec<String>>>>,
    pub allowed_return_types_from_sender: Option<Vec<String>>,
}

impl TrackedMethod {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            can_track: None,
            can_apply: None,
            promise_handling: PromiseHandling::Await,
            before_execute_on_client: None,
            allowed_parameter_types_from_sender: None,
            allowed_return_types_from_sender: None,
        }
    }

    pub fn handler(
        mut self,
        handler: impl Fn(&Instance, Vec<Value>) -> MethodReturn + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn can_track(mut self, predicate: impl Fn(&ClientToken) -> bool + Send + Sync + 'static) -> Self {
        self.can_track = Some(Arc::new(predicate));
        self
    }

    pub fn can_apply(mut self, predicate: impl Fn(&ClientToken) -> bool + Send + Sync + 'static) -> Self {
        self.can_apply = Some(Arc::new(predicate));
        self
    }

    pub fn promise_handling(mut self, handling: PromiseHandling) -> Self {
        self.promise_handling = handling;
        self
    }

    pub fn before_execute_on_client(
        mut self,
        hook: impl Fn(&Instance, &ClientToken, Vec<Value>) -> Option<Vec<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.before_execute_on_client = Some(Arc::new(hook));
        self
    }

    pub fn allowed_parameter_types_from_sender(mut self, types: Vec<Option<Vec<&str>>>) -> Self {
        self.allowed_parameter_types_from_sender = Some(
            types
                .into_iter()
                .map(|slot| slot.map(|names| names.into_iter().map(str::to_string).collect()))
                .collect(),
        );
        self
    }

    pub fn allowed_return_types_from_sender(mut self, types: &[&str]) -> Self {
        self.allowed_return_types_from_sender = Some(types.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn tracks_for(&self, client: &ClientToken) -> bool {
        self.can_track.as_ref().map_or(true, |predicate| predicate(client))
    }

    pub fn applies_from(&self, client: &ClientToken) -> bool {
        self.can_apply.as_ref().map_or(true, |predicate| predicate(client))
    }

    pub fn parameter_allow_list(&self, position: usize) -> Option<&Vec<String>> {
        self.allowed_parameter_types_from_sender
            .as_ref()
            .and_then(|slots| slots.get(position))
            .and_then(Option::as_ref)
    }
}

/// Static description of a user type: which members sync, who may see or
/// write them, and how to build an instance on the receiving side.
#[derive(Clone)]
pub struct TypeDescriptor {
    pub type_id: String,
    pub client_type_id: Option<String>,
    pub parent: Option<String>,
    pub properties: Vec<TrackedProperty>,
    pub methods: Vec<TrackedMethod>,
    pub constructor_arguments: Option<Vec<String>>,
    pub constructor: Option<Constructor>,
    pub lifecycle: Option<Arc<dyn LifecycleHooks>>,
}

impl TypeDescriptor {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            client_type_id: None,
            parent: None,
            properties: Vec::new(),
            methods: Vec::new(),
            constructor_arguments: None,
            constructor: None,
            lifecycle: None,
        }
    }

    /// Type id sent to peers instead of `type_id`.
    pub fn client_type_id(mut self, type_id: impl Into<String>) -> Self {
        self.client_type_id = Some(type_id.into());
        self
    }

    /// Makes instances of this type match providers registered for `parent`.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn property(mut self, property: TrackedProperty) -> Self {
        self.properties.push(property);
        self
    }

    pub fn method(mut self, method: TrackedMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn constructor_arguments(mut self, keys: &[&str]) -> Self {
        self.constructor_arguments = Some(keys.iter().map(|key| key.to_string()).collect());
        self
    }

    pub fn constructor(
        mut self,
        constructor: impl Fn(Vec<Value>) -> Result<Box<dyn SyncObject>, String> + Send + Sync + 'static,
    ) -> Self {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    pub fn lifecycle(mut self, hooks: impl LifecycleHooks + 'static) -> Self {
        self.lifecycle = Some(Arc::new(hooks));
        self
    }

    pub fn wire_type_id(&self) -> &str {
        self.client_type_id.as_deref().unwrap_or(&self.type_id)
    }

    pub fn find_property(&self, key: &str) -> Option<&TrackedProperty> {
        self.properties.iter().find(|property| property.key == key)
    }

    pub fn find_method(&self, name: &str) -> Option<&TrackedMethod> {
        self.methods.iter().find(|method| method.name == name)
    }

    /// Explicit constructor argument keys, or the properties flagged as
    /// constructor arguments in declaration order.
    pub fn constructor_argument_keys(&self) -> Vec<String> {
        if let Some(keys) = &self.constructor_arguments {
            return keys.clone();
        }
        self.properties
            .iter()
            .filter(|property| property.constructor_argument)
            .map(|property| property.key.clone())
            .collect()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type_id", &self.type_id)
            .field("client_type_id", &self.client_type_id)
            .field("parent", &self.parent)
            .field(
                "properties",
                &self.properties.iter().map(|p| p.key.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "methods",
                &self.methods.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
