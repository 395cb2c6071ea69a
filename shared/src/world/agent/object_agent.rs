use std::{any::Any, collections::BTreeMap, sync::Arc, task::Poll};

use futures::future::BoxFuture;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    messages::{Message, SerializedValue},
    value::{DynamicObject, Mutation, SyncObject},
    world::{
        descriptor::{MethodReturn, PromiseHandling, TrackedMethod, TrackedProperty, TypeDescriptor},
        engine::BatchValidator,
        ObjectSyncError,
    },
    ClientToken, Instance, InvokeId, ObjectId, Value,
};

use super::{
    decode_data, encode_data, poll_once, AgentContext, AgentState, GenerationRequest,
    ReferenceTracker, SyncAgent,
};

#[derive(Serialize, Deserialize)]
struct CreateData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<SerializedValue>>,
    #[serde(default)]
    properties: BTreeMap<String, SerializedValue>,
}

#[derive(Serialize, Deserialize)]
struct ChangeData {
    #[serde(default)]
    properties: BTreeMap<String, SerializedValue>,
}

struct AwaitedInvocation {
    invoke_id: InvokeId,
    client: ClientToken,
    future: BoxFuture<'static, Result<Value, Value>>,
}

/// Syncs a structured object: declared properties as a key/value map, plus
/// method invocations in both directions.
///
/// Without a descriptor every property the object exposes is synced and no
/// method may be invoked.
pub struct ObjectAgent {
    state: AgentState,
    type_id: String,
    descriptor: Option<Arc<TypeDescriptor>>,
    /// Changed keys, each with the peer that already holds the new value
    dirty: BTreeMap<String, Option<ClientToken>>,
    /// Keys captured for the cycle currently being generated
    cycle_dirty: Option<BTreeMap<String, Option<ClientToken>>>,
    references: ReferenceTracker<String>,
    awaiting: Vec<AwaitedInvocation>,
    detached: Vec<BoxFuture<'static, Result<Value, Value>>>,
}

impl ObjectAgent {
    pub fn new(object_id: ObjectId, type_id: &str, descriptor: Option<Arc<TypeDescriptor>>) -> Self {
        Self {
            state: AgentState::new(object_id),
            type_id: type_id.to_string(),
            descriptor,
            dirty: BTreeMap::new(),
            cycle_dirty: None,
            references: ReferenceTracker::new(),
            awaiting: Vec::new(),
            detached: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> Option<&Arc<TypeDescriptor>> {
        self.descriptor.as_ref()
    }

    fn object_id(&self) -> &ObjectId {
        self.state.object_id()
    }

    fn property(&self, key: &str) -> Option<&TrackedProperty> {
        self.descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.find_property(key))
    }

    fn method(&self, name: &str) -> Option<&TrackedMethod> {
        self.descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.find_method(name))
    }

    fn is_tracked_key(&self, key: &str) -> bool {
        self.descriptor.is_none() || self.property(key).is_some()
    }

    fn tracked_keys(&self, instance: &Instance) -> Vec<String> {
        match &self.descriptor {
            Some(descriptor) => descriptor
                .properties
                .iter()
                .map(|property| property.key.clone())
                .collect(),
            None => instance.keys(),
        }
    }

    fn constructor_keys(&self) -> Vec<String> {
        self.descriptor
            .as_ref()
            .map(|descriptor| descriptor.constructor_argument_keys())
            .unwrap_or_default()
    }

    fn local_type_name(&self) -> String {
        self.descriptor
            .as_ref()
            .map(|descriptor| descriptor.type_id.clone())
            .unwrap_or_else(|| self.type_id.clone())
    }

    /// Whether `key` may be written by `origin`.
    fn accepts(&self, key: &str, origin: &ClientToken) -> bool {
        match &self.descriptor {
            None => true,
            Some(descriptor) => descriptor
                .find_property(key)
                .map_or(false, |property| property.applies_from(origin)),
        }
    }

    fn allow_list(&self, key: &str) -> Option<&[String]> {
        self.property(key)
            .and_then(|property| property.allowed_types_from_sender.as_deref())
    }

    fn capture_cycle(&mut self) {
        if self.cycle_dirty.is_none() {
            self.cycle_dirty = Some(std::mem::take(&mut self.dirty));
        }
    }

    /// Serializes `key` for `client`, replacing what the key held for it.
    /// `None` when the property is hidden from `client`.
    fn serialize_property(
        &mut self,
        instance: &Instance,
        key: &str,
        client: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<Option<SerializedValue>, ObjectSyncError> {
        let descriptor = self.descriptor.clone();
        let property = descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.find_property(key));

        let mut value = instance.get(key);
        let visible = match property {
            Some(property) if !property.tracks_for(client) => false,
            Some(TrackedProperty {
                before_send_to_client: Some(hook),
                ..
            }) => match hook(instance, client, &value) {
                Some(rewritten) => {
                    value = rewritten;
                    true
                }
                None => false,
            },
            _ => true,
        };
        if !visible {
            self.references.store(key.to_string(), client, Vec::new(), ctx);
            return Ok(None);
        }

        let (serialized, held) = ctx.serialize_value(&value, client)?;
        self.references
            .store(key.to_string(), client, held.into_iter().collect(), ctx);
        Ok(Some(serialized))
    }

    fn create_data(
        &mut self,
        instance: &Instance,
        client: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<JsonValue, ObjectSyncError> {
        let constructor_keys = self.constructor_keys();
        let args = if constructor_keys.is_empty() {
            None
        } else {
            let mut args = Vec::with_capacity(constructor_keys.len());
            for key in &constructor_keys {
                let serialized = self.serialize_property(instance, key, client, ctx)?;
                args.push(serialized.unwrap_or_else(SerializedValue::null));
            }
            Some(args)
        };

        let mut properties = BTreeMap::new();
        for key in self.tracked_keys(instance) {
            if constructor_keys.contains(&key) {
                continue;
            }
            if let Some(serialized) = self.serialize_property(instance, &key, client, ctx)? {
                properties.insert(key, serialized);
            }
        }
        encode_data(&CreateData { args, properties })
    }

    /// Resolves and writes one incoming property value. Keys the origin may
    /// not write are skipped.
    fn apply_property(
        &mut self,
        instance: &Instance,
        key: String,
        serialized: &SerializedValue,
        origin: &ClientToken,
        rebroadcast: bool,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        if !self.accepts(&key, origin) {
            debug!(
                "Ignoring write of {} on {} from {}",
                key,
                self.object_id(),
                origin.identity()
            );
            return Ok(());
        }
        let (value, held) = ctx.resolve_value(serialized)?;
        if let Some(object_id) = &held {
            ctx.hold(object_id, Some(origin));
        }
        self.references
            .store(key.clone(), origin, held.into_iter().collect(), ctx);
        instance.set(&key, value.clone());

        if rebroadcast {
            self.dirty.insert(key.clone(), Some(origin.clone()));
            self.state.mark_pending();
        }
        if let Some(hook) = self
            .property(&key)
            .and_then(|property| property.after_value_changed.clone())
        {
            hook(instance, &value);
        }
        Ok(())
    }

    fn reply(
        &mut self,
        invoke_id: InvokeId,
        outcome: Result<Value, Value>,
        client: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let message = match ctx.execute_finished(&mut self.state, invoke_id, outcome, client) {
            Ok(message) => message,
            Err(error) => {
                warn!(
                    "Cannot serialize result of invocation {} on {}: {}",
                    invoke_id,
                    self.object_id(),
                    error
                );
                ctx.execute_finished(
                    &mut self.state,
                    invoke_id,
                    Err(Value::String(error.to_string())),
                    client,
                )?
            }
        };
        self.state.queue_outgoing(client, message);
        Ok(())
    }
}

impl SyncAgent for ObjectAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    fn type_id(&self) -> &str {
        &self.type_id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn outbound_method(&self, method: &str) -> Option<TrackedMethod> {
        self.method(method).cloned()
    }

    fn on_mutation(
        &mut self,
        _instance: &Instance,
        mutation: Mutation,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        if let Mutation::Property { key } = mutation {
            if self.is_tracked_key(&key) {
                self.dirty.insert(key, None);
                self.state.mark_pending();
            }
        }
        Ok(())
    }

    fn generate_messages(
        &mut self,
        instance: &Instance,
        request: &GenerationRequest,
        ctx: &mut AgentContext,
    ) -> Result<Vec<Message>, ObjectSyncError> {
        self.capture_cycle();
        let client = request.client;

        if request.is_new_client {
            let data = self.create_data(instance, client, ctx)?;
            return Ok(vec![Message::Create {
                object_id: self.object_id().clone(),
                type_id: self.type_id.clone(),
                data,
                is_root: request.is_root,
            }]);
        }

        let dirty = self.cycle_dirty.clone().unwrap_or_default();
        let mut properties = BTreeMap::new();
        for (key, holder) in dirty {
            if holder.as_ref() == Some(client) || !self.is_tracked_key(&key) {
                continue;
            }
            if let Some(serialized) = self.serialize_property(instance, &key, client, ctx)? {
                properties.insert(key, serialized);
            }
        }
        if properties.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Message::Change {
            object_id: self.object_id().clone(),
            data: encode_data(&ChangeData { properties })?,
        }])
    }

    fn clear_states(&mut self, _instance: &Instance, _ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        self.cycle_dirty = None;
        if self.state.clients().next().is_none() {
            // a peer meeting this object later receives a full create
            self.dirty.clear();
        }
        let still_pending = !self.dirty.is_empty();
        self.state.end_cycle(still_pending);
        Ok(())
    }

    fn poll_invocations(&mut self, _instance: &Instance, ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        for mut awaited in std::mem::take(&mut self.awaiting) {
            match poll_once(&mut awaited.future) {
                Poll::Ready(outcome) => self.reply(awaited.invoke_id, outcome, &awaited.client, ctx)?,
                Poll::Pending => self.awaiting.push(awaited),
            }
        }
        self.detached.retain_mut(|future| poll_once(future).is_pending());
        Ok(())
    }

    fn validate_create(
        &self,
        data: &JsonValue,
        origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let create: CreateData = decode_data(self.object_id(), data)?;
        let constructor_keys = self.constructor_keys();
        let args = create.args.as_deref().unwrap_or(&[]);
        if args.len() != constructor_keys.len() {
            return Err(ObjectSyncError::ConstructorArguments {
                type_id: self.type_id.clone(),
                reason: format!(
                    "expected {} constructor arguments, got {}",
                    constructor_keys.len(),
                    args.len()
                ),
            });
        }
        for (key, arg) in constructor_keys.iter().zip(args) {
            validator.check_value(self.object_id(), arg, self.allow_list(key))?;
        }
        for (key, serialized) in &create.properties {
            if self.accepts(key, origin) {
                validator.check_value(self.object_id(), serialized, self.allow_list(key))?;
            }
        }
        Ok(())
    }

    fn validate_change(
        &self,
        data: &JsonValue,
        origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let change: ChangeData = decode_data(self.object_id(), data)?;
        for (key, serialized) in &change.properties {
            if self.accepts(key, origin) {
                validator.check_value(self.object_id(), serialized, self.allow_list(key))?;
            }
        }
        Ok(())
    }

    fn validate_execute(
        &self,
        method: &str,
        parameters: &[SerializedValue],
        origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let Some(method) = self.method(method) else {
            return Ok(());
        };
        if method.handler.is_none() || !method.applies_from(origin) {
            return Ok(());
        }
        for (position, parameter) in parameters.iter().enumerate() {
            validator.check_value(
                self.object_id(),
                parameter,
                method.parameter_allow_list(position).map(Vec::as_slice),
            )?;
        }
        Ok(())
    }

    fn validate_execute_result(
        &self,
        method: &str,
        value: &SerializedValue,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let allowed = self
            .method(method)
            .and_then(|method| method.allowed_return_types_from_sender.as_deref());
        validator.check_value(self.object_id(), value, allowed)
    }

    fn construct(&mut self, data: &JsonValue, ctx: &mut AgentContext) -> Result<Instance, ObjectSyncError> {
        let create: CreateData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        let constructor_keys = self.constructor_keys();
        let serialized_args = create.args.unwrap_or_default();
        if serialized_args.len() != constructor_keys.len() {
            return Err(ObjectSyncError::ConstructorArguments {
                type_id: self.type_id.clone(),
                reason: format!(
                    "expected {} constructor arguments, got {}",
                    constructor_keys.len(),
                    serialized_args.len()
                ),
            });
        }

        let mut args = Vec::with_capacity(serialized_args.len());
        for (key, serialized) in constructor_keys.iter().zip(&serialized_args) {
            let (value, held) = ctx.resolve_value(serialized)?;
            if let Some(object_id) = &held {
                ctx.hold(object_id, Some(&origin));
            }
            self.references
                .store(key.clone(), &origin, held.into_iter().collect(), ctx);
            args.push(value);
        }

        let constructor = self
            .descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.constructor.clone());
        let body: Box<dyn SyncObject> = match constructor {
            Some(constructor) => constructor(args).map_err(|reason| ObjectSyncError::ConstructorArguments {
                type_id: self.type_id.clone(),
                reason,
            })?,
            None => {
                let mut object = DynamicObject::new(self.local_type_name());
                for (key, value) in constructor_keys.iter().zip(args) {
                    object.set(key, value);
                }
                Box::new(object)
            }
        };
        Ok(Instance::new_boxed_object(body))
    }

    fn apply_create_data(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let create: CreateData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        for (key, serialized) in create.properties {
            self.apply_property(instance, key, &serialized, &origin, false, ctx)?;
        }
        if let Some(lifecycle) = self
            .descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.lifecycle.clone())
        {
            lifecycle.on_created(instance, self.state.object_id());
        }
        Ok(())
    }

    fn apply_change(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let change: ChangeData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        for (key, serialized) in change.properties {
            self.apply_property(instance, key, &serialized, &origin, true, ctx)?;
        }
        Ok(())
    }

    fn apply_execute(
        &mut self,
        instance: &Instance,
        invoke_id: InvokeId,
        method: &str,
        parameters: &[SerializedValue],
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let origin = ctx.require_origin()?;
        let callable = self
            .method(method)
            .filter(|tracked| tracked.applies_from(&origin))
            .and_then(|tracked| {
                tracked
                    .handler
                    .clone()
                    .map(|handler| (handler, tracked.promise_handling))
            });
        let Some((handler, promise_handling)) = callable else {
            warn!(
                "Rejected call of {} on {} from {}",
                method,
                self.object_id(),
                origin.identity()
            );
            let error = AgentContext::not_authorized_error(self.object_id(), method);
            return self.reply(invoke_id, Err(error), &origin, ctx);
        };

        let mut args = Vec::with_capacity(parameters.len());
        for parameter in parameters {
            args.push(ctx.resolve_value(parameter)?.0);
        }

        match handler(instance, args) {
            MethodReturn::Ready(outcome) => self.reply(invoke_id, outcome, &origin, ctx),
            MethodReturn::Pending(mut future) => match promise_handling {
                PromiseHandling::Await => match poll_once(&mut future) {
                    Poll::Ready(outcome) => self.reply(invoke_id, outcome, &origin, ctx),
                    Poll::Pending => {
                        self.awaiting.push(AwaitedInvocation {
                            invoke_id,
                            client: origin,
                            future,
                        });
                        Ok(())
                    }
                },
                PromiseHandling::FireAndForget => {
                    self.reply(invoke_id, Ok(Value::Null), &origin, ctx)?;
                    if poll_once(&mut future).is_pending() {
                        self.detached.push(future);
                    }
                    Ok(())
                }
            },
        }
    }

    fn release_client(&mut self, client: &ClientToken, ctx: &mut AgentContext) {
        self.references.release_client(client, ctx);
        self.awaiting.retain(|awaited| awaited.client != *client);
    }

    fn release_all(&mut self, ctx: &mut AgentContext) {
        self.references.release_all(ctx);
        self.awaiting.clear();
        self.detached.clear();
    }

    fn on_deleted(&mut self, instance: &Instance) {
        if let Some(lifecycle) = self
            .descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.lifecycle.clone())
        {
            lifecycle.on_deleted(instance, self.state.object_id());
        }
    }
}
