use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    messages::{Message, SerializedValue},
    value::{ErrorKind, ErrorValue, Mutation},
    world::{engine::BatchValidator, ObjectSyncError},
    ClientToken, Instance, ObjectId, Value,
};

use super::{decode_data, encode_data, AgentContext, AgentState, GenerationRequest, ReferenceTracker, SyncAgent};

const CAUSE: &str = "cause";
const ERRORS: &str = "errors";

#[derive(Serialize, Deserialize)]
struct ErrorCreateData {
    message: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<SerializedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<SerializedValue>>,
}

/// Syncs an error value. Errors are immutable: a peer gets one create and
/// nothing after it.
pub struct ErrorAgent {
    state: AgentState,
    references: ReferenceTracker<&'static str>,
}

impl ErrorAgent {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            state: AgentState::new(object_id),
            references: ReferenceTracker::new(),
        }
    }

    fn object_id(&self) -> &ObjectId {
        self.state.object_id()
    }

    fn serialize_error(
        &mut self,
        error: &ErrorValue,
        client: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<ErrorCreateData, ObjectSyncError> {
        let cause = match &error.cause {
            Some(cause) => {
                let (serialized, held) = ctx.serialize_value(cause, client)?;
                self.references
                    .store(CAUSE, client, held.into_iter().collect(), ctx);
                Some(serialized)
            }
            None => None,
        };
        let errors = match &error.errors {
            Some(errors) => {
                let mut serialized = Vec::with_capacity(errors.len());
                let mut held = Vec::new();
                for value in errors {
                    let (value, object_id) = ctx.serialize_value(value, client)?;
                    serialized.push(value);
                    held.extend(object_id);
                }
                self.references.store(ERRORS, client, held, ctx);
                Some(serialized)
            }
            None => None,
        };
        Ok(ErrorCreateData {
            message: error.message.clone(),
            name: error.name.clone(),
            kind: error.kind.as_str().to_string(),
            stack: error.stack.clone(),
            cause,
            errors,
        })
    }
}

impl SyncAgent for ErrorAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    fn type_id(&self) -> &str {
        "Error"
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
        _mutation: Mutation,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        Ok(())
    }

    fn generate_messages(
        &mut self,
        instance: &Instance,
        request: &GenerationRequest,
        ctx: &mut AgentContext,
    ) -> Result<Vec<Message>, ObjectSyncError> {
        if !request.is_new_client {
            return Ok(Vec::new());
        }
        let Some(error) = instance.error_value() else {
            return Err(ObjectSyncError::invalid_data(self.object_id(), "instance is not an error"));
        };
        let data = self.serialize_error(&error, request.client, ctx)?;
        Ok(vec![Message::Create {
            object_id: self.object_id().clone(),
            type_id: "Error".to_string(),
            data: encode_data(&data)?,
            is_root: request.is_root,
        }])
    }

    fn clear_states(&mut self, _instance: &Instance, _ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        self.state.end_cycle(false);
        Ok(())
    }

    fn validate_create(
        &self,
        data: &JsonValue,
        _origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let create: ErrorCreateData = decode_data(self.object_id(), data)?;
        if let Some(cause) = &create.cause {
            validator.check_value(self.object_id(), cause, None)?;
        }
        for value in create.errors.iter().flatten() {
            validator.check_value(self.object_id(), value, None)?;
        }
        Ok(())
    }

    fn validate_change(
        &self,
        _data: &JsonValue,
        _origin: &ClientToken,
        _validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        Err(ObjectSyncError::invalid_data(
            self.object_id(),
            "errors are immutable and accept no changes",
        ))
    }

    fn construct(&mut self, data: &JsonValue, ctx: &mut AgentContext) -> Result<Instance, ObjectSyncError> {
        let create: ErrorCreateData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        let mut error = ErrorValue::new(ErrorKind::from_type_name(&create.kind), create.message)
            .with_name(create.name);
        error.stack = create.stack;

        if let Some(cause) = &create.cause {
            let (value, held) = ctx.resolve_value(cause)?;
            if let Some(object_id) = &held {
                ctx.hold(object_id, Some(&origin));
            }
            self.references
                .store(CAUSE, &origin, held.into_iter().collect(), ctx);
            error.cause = Some(value);
        }
        if let Some(errors) = &create.errors {
            let mut values: Vec<Value> = Vec::with_capacity(errors.len());
            let mut held_ids = Vec::new();
            for serialized in errors {
                let (value, held) = ctx.resolve_value(serialized)?;
                if let Some(object_id) = held {
                    ctx.hold(&object_id, Some(&origin));
                    held_ids.push(object_id);
                }
                values.push(value);
            }
            self.references.store(ERRORS, &origin, held_ids, ctx);
            error.errors = Some(values);
        }
        Ok(Instance::new_error(error))
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
        _instance: &Instance,
        _data: &JsonValue,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        Err(ObjectSyncError::invalid_data(
            self.object_id(),
            "errors are immutable and accept no changes",
        ))
    }

    fn release_client(&mut self, client: &ClientToken, ctx: &mut AgentContext) {
        self.references.release_client(client, ctx);
    }

    fn release_all(&mut self, ctx: &mut AgentContext) {
        self.references.release_all(ctx);
    }
}
