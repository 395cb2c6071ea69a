use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    messages::Message,
    value::Mutation,
    world::{engine::BatchValidator, ObjectSyncError},
    ClientToken, Instance, ObjectId,
};

use super::{decode_data, encode_data, AgentContext, AgentState, GenerationRequest, SyncAgent};

#[derive(Serialize, Deserialize)]
struct SimpleData {
    value: JsonValue,
}

/// Copies a leaf value by value. Changes replace the whole value.
pub struct SimpleValueAgent {
    state: AgentState,
    type_id: String,
    snapshot: Option<JsonValue>,
    captured: Option<JsonValue>,
    changed_since_capture: bool,
}

impl SimpleValueAgent {
    pub fn new(object_id: ObjectId, type_id: &str) -> Self {
        Self {
            state: AgentState::new(object_id),
            type_id: type_id.to_string(),
            snapshot: None,
            captured: None,
            changed_since_capture: false,
        }
    }

    fn current(&self, instance: &Instance) -> Result<JsonValue, ObjectSyncError> {
        instance.simple_value().ok_or_else(|| {
            ObjectSyncError::invalid_data(self.state.object_id(), "instance is not a simple value")
        })
    }
}

impl SyncAgent for SimpleValueAgent {
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

    fn on_mutation(
        &mut self,
        _instance: &Instance,
        mutation: Mutation,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        if let Mutation::Touched = mutation {
            self.changed_since_capture = true;
            self.state.mark_pending();
        }
        Ok(())
    }

    fn generate_messages(
        &mut self,
        instance: &Instance,
        request: &GenerationRequest,
        _ctx: &mut AgentContext,
    ) -> Result<Vec<Message>, ObjectSyncError> {
        if self.captured.is_none() {
            self.captured = Some(self.current(instance)?);
            self.changed_since_capture = false;
        }
        let Some(value) = self.captured.clone() else {
            return Ok(Vec::new());
        };
        let object_id = self.state.object_id().clone();
        if request.is_new_client {
            return Ok(vec![Message::Create {
                object_id,
                type_id: self.type_id.clone(),
                data: encode_data(&SimpleData { value })?,
                is_root: request.is_root,
            }]);
        }
        if self.snapshot.as_ref() == Some(&value) {
            return Ok(Vec::new());
        }
        Ok(vec![Message::Change {
            object_id,
            data: encode_data(&SimpleData { value })?,
        }])
    }

    fn clear_states(&mut self, instance: &Instance, _ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        let still_pending = match self.captured.take() {
            Some(value) => {
                self.snapshot = Some(value);
                self.changed_since_capture
            }
            None => self.state.has_pending_changes(),
        };
        if self.state.clients().next().is_none() {
            self.snapshot = Some(self.current(instance)?);
            self.state.end_cycle(false);
            return Ok(());
        }
        self.state.end_cycle(still_pending);
        Ok(())
    }

    fn validate_create(
        &self,
        data: &JsonValue,
        _origin: &ClientToken,
        _validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        decode_data::<SimpleData>(self.state.object_id(), data).map(|_| ())
    }

    fn validate_change(
        &self,
        data: &JsonValue,
        _origin: &ClientToken,
        _validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        decode_data::<SimpleData>(self.state.object_id(), data).map(|_| ())
    }

    fn construct(&mut self, data: &JsonValue, _ctx: &mut AgentContext) -> Result<Instance, ObjectSyncError> {
        let SimpleData { value } = decode_data(self.state.object_id(), data)?;
        self.snapshot = Some(value.clone());
        Ok(Instance::new_simple(self.type_id.clone(), value))
    }

    fn apply_create_data(
        &mut self,
        _instance: &Instance,
        _data: &JsonValue,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        Ok(())
    }

    fn apply_change(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let SimpleData { value } = decode_data(self.state.object_id(), data)?;
        instance.set_simple_value(value.clone());
        self.snapshot = Some(value);
        Ok(())
    }

    fn release_client(&mut self, _client: &ClientToken, _ctx: &mut AgentContext) {}

    fn release_all(&mut self, _ctx: &mut AgentContext) {}
}
