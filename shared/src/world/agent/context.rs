use log::debug;

use crate::{
    messages::{Message, SerializedValue},
    value::{ErrorKind, ErrorValue},
    world::{
        engine::{IncomingBatch, PendingCreate, SyncEvent},
        object_world::ObjectWorld,
        pool::ObjectInfo,
        ObjectSyncError,
    },
    ClientToken, Instance, InvokeId, ObjectId, Value,
};

use super::{AgentState, ProviderRegistry};

/// What an agent may touch while it runs: the pools, the registry, and the
/// incoming batch when applying messages.
pub struct AgentContext<'a> {
    world: &'a mut ObjectWorld,
    incoming: Option<&'a mut IncomingBatch>,
    origin: Option<ClientToken>,
}

impl<'a> AgentContext<'a> {
    pub(crate) fn new(
        world: &'a mut ObjectWorld,
        incoming: Option<&'a mut IncomingBatch>,
        origin: Option<ClientToken>,
    ) -> Self {
        Self {
            world,
            incoming,
            origin,
        }
    }

    /// Peer whose batch is being applied.
    pub fn origin(&self) -> Option<&ClientToken> {
        self.origin.as_ref()
    }

    pub fn require_origin(&self) -> Result<ClientToken, ObjectSyncError> {
        self.origin.clone().ok_or_else(|| ObjectSyncError::UnknownPeer {
            identity: "<no origin>".to_string(),
        })
    }

    pub fn own_token(&self) -> &ClientToken {
        &self.world.own_token
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.world.registry
    }

    // References

    pub fn hold(&mut self, object_id: &ObjectId, holder: Option<&ClientToken>) {
        self.world.hold(object_id, holder);
    }

    pub fn release(&mut self, object_id: &ObjectId, holder: Option<&ClientToken>) {
        self.world.release(object_id, holder);
    }

    pub fn release_all<'i>(
        &mut self,
        object_ids: impl IntoIterator<Item = &'i ObjectId>,
        holder: Option<&ClientToken>,
    ) {
        for object_id in object_ids {
            self.world.release(object_id, holder);
        }
    }

    // Outgoing

    /// Serializes `value` for `client`. Objects are tracked on first sight,
    /// held for `client`, and queued for a create if `client` has not seen
    /// them. Objects hidden from `client` become `null`.
    pub fn serialize_value(
        &mut self,
        value: &Value,
        client: &ClientToken,
    ) -> Result<(SerializedValue, Option<ObjectId>), ObjectSyncError> {
        let Value::Object(instance) = value else {
            let json = value.to_json().unwrap_or_default();
            return Ok((SerializedValue::Primitive { value: json }, None));
        };
        let object_id = self.world.ensure_tracked(instance)?;
        if !self.world.is_visible(&object_id, client) {
            return Ok((SerializedValue::null(), None));
        }
        let type_id = self
            .world
            .pool
            .get_info_by_id(&object_id)
            .map(|info| info.type_id().to_string())
            .ok_or_else(|| ObjectSyncError::UnknownObject {
                object_id: object_id.clone(),
            })?;
        self.world.hold(&object_id, Some(client));
        self.world.introduce(&object_id, client);
        Ok((
            SerializedValue::Reference {
                object_id: object_id.clone(),
                type_id,
            },
            Some(object_id),
        ))
    }

    /// Serializes a value that only lives until the end of the cycle, such as
    /// an invocation argument or result.
    pub fn serialize_temporary(
        &mut self,
        state: &mut AgentState,
        value: &Value,
        client: &ClientToken,
    ) -> Result<SerializedValue, ObjectSyncError> {
        let (serialized, held) = self.serialize_value(value, client)?;
        if let Some(object_id) = held {
            state.hold_temporary(client, object_id);
        }
        Ok(serialized)
    }

    /// Names a value `client` already has, such as a removed map key,
    /// without tracking or holding it. `None` when the value is an object
    /// `client` never received.
    pub fn serialize_known(&self, value: &Value, client: &ClientToken) -> Option<SerializedValue> {
        let Value::Object(instance) = value else {
            let json = value.to_json().unwrap_or_default();
            return Some(SerializedValue::Primitive { value: json });
        };
        let info = self.world.pool.get_info_by_object(instance)?;
        if !info.agent().map_or(false, |agent| agent.state().knows(client)) {
            return None;
        }
        Some(SerializedValue::Reference {
            object_id: info.object_id().clone(),
            type_id: info.type_id().to_string(),
        })
    }

    pub fn execute_finished(
        &mut self,
        state: &mut AgentState,
        invoke_id: InvokeId,
        outcome: Result<Value, Value>,
        client: &ClientToken,
    ) -> Result<Message, ObjectSyncError> {
        let object_id = state.object_id().clone();
        let (result, error) = match outcome {
            Ok(value) => (Some(self.serialize_temporary(state, &value, client)?), None),
            Err(value) => (None, Some(self.serialize_temporary(state, &value, client)?)),
        };
        Ok(Message::ExecuteFinished {
            object_id,
            invoke_id,
            result,
            error,
        })
    }

    pub fn not_authorized_error(object_id: &ObjectId, member: &str) -> Value {
        Value::Object(Instance::new_error(
            ErrorValue::new(
                ErrorKind::Error,
                format!("Not authorized to call {} on {}", member, object_id),
            )
            .with_name("NotAuthorizedError"),
        ))
    }

    // Incoming

    pub fn resolve_value(
        &mut self,
        serialized: &SerializedValue,
    ) -> Result<(Value, Option<ObjectId>), ObjectSyncError> {
        match serialized {
            SerializedValue::Primitive { value } => {
                let resolved = Value::from_json(value).ok_or_else(|| ObjectSyncError::InvalidMessageData {
                    object_id: ObjectId::from("<value>"),
                    reason: format!("{} is not a primitive", value),
                })?;
                Ok((resolved, None))
            }
            SerializedValue::Reference { object_id, .. } => {
                let instance = self.resolve_reference(object_id)?;
                Ok((Value::Object(instance), Some(object_id.clone())))
            }
        }
    }

    /// Finds the instance behind `object_id`, materializing a create from the
    /// incoming batch first if it has not been applied yet.
    pub fn resolve_reference(&mut self, object_id: &ObjectId) -> Result<Instance, ObjectSyncError> {
        if let Some(info) = self.world.pool.get_info_by_id(object_id) {
            return info
                .instance()
                .cloned()
                .ok_or_else(|| ObjectSyncError::CircularConstructorReference {
                    object_id: object_id.clone(),
                });
        }
        if let Some(info) = self.world.weak_pool.extract_by_id(object_id) {
            let instance = info.instance().cloned();
            self.world.promote(info);
            if let Some(instance) = instance {
                return Ok(instance);
            }
        }
        let pending = self
            .incoming
            .as_mut()
            .and_then(|incoming| incoming.take_create(object_id));
        match pending {
            Some(create) => self.materialize(object_id, create),
            None => Err(ObjectSyncError::UnknownObject {
                object_id: object_id.clone(),
            }),
        }
    }

    /// Applies a create message: builds the agent, constructs the instance,
    /// registers it, then fills in the rest of its data.
    pub(crate) fn materialize(
        &mut self,
        object_id: &ObjectId,
        create: PendingCreate,
    ) -> Result<Instance, ObjectSyncError> {
        let origin = self.require_origin()?;
        if self.world.pool.contains(object_id) || self.world.weak_pool.contains(object_id) {
            return Err(ObjectSyncError::ObjectAlreadyExists {
                object_id: object_id.clone(),
            });
        }
        let mut agent = self
            .world
            .registry
            .agent_for_type_id(&create.type_id, object_id)?;
        self.world
            .pool
            .add(ObjectInfo::foreign(object_id.clone(), &create.type_id, create.is_root));

        let sender = self.world.channel.new_sender(object_id);
        let built = self.build_instance(agent.as_mut(), object_id, &create, &sender);

        let instance = match built {
            Ok(instance) => instance,
            Err(error) => {
                agent.release_all(self);
                if let Some(mut info) = self.world.pool.delete_by_id(object_id) {
                    if let Some(instance) = info.clear_instance() {
                        instance.detach_observer(&sender);
                    }
                }
                return Err(error);
            }
        };

        agent.state_mut().add_client(&origin);
        if let Some(info) = self.world.pool.get_info_by_id_mut(object_id) {
            info.restore_agent(agent);
            info.set_sender(sender);
        }
        let own_token = self.world.own_token.clone();
        self.world.hold(object_id, Some(&own_token));
        self.world.events.push(SyncEvent::Created {
            object_id: object_id.clone(),
            instance: instance.clone(),
            client: origin,
        });
        debug!("Materialized object {} ({})", object_id, create.type_id);
        Ok(instance)
    }

    fn build_instance(
        &mut self,
        agent: &mut dyn super::SyncAgent,
        object_id: &ObjectId,
        create: &PendingCreate,
        sender: &crate::value::MutSender,
    ) -> Result<Instance, ObjectSyncError> {
        let instance = agent.construct(&create.data, self)?;
        if !self.world.pool.set_instance(object_id, &instance) {
            return Err(ObjectSyncError::ObjectAlreadyExists {
                object_id: object_id.clone(),
            });
        }
        sender.set_muted(true);
        instance.attach_observer(sender.clone());
        let applied = agent.apply_create_data(&instance, &create.data, self);
        sender.set_muted(false);
        applied?;
        Ok(instance)
    }
}
