use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{InvokeId, ObjectId};

use super::MessageError;

fn is_false(value: &bool) -> bool {
    !*value
}

/// One unit of the wire protocol. `data` is shaped by the agent that owns the
/// object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    Create {
        object_id: ObjectId,
        type_id: String,
        data: JsonValue,
        #[serde(default, skip_serializing_if = "is_false")]
        is_root: bool,
    },
    #[serde(rename_all = "camelCase")]
    Change { object_id: ObjectId, data: JsonValue },
    #[serde(rename_all = "camelCase")]
    Delete { object_id: ObjectId },
    #[serde(rename_all = "camelCase")]
    Execute {
        object_id: ObjectId,
        invoke_id: InvokeId,
        method: String,
        parameters: Vec<SerializedValue>,
    },
    #[serde(rename_all = "camelCase")]
    ExecuteFinished {
        object_id: ObjectId,
        invoke_id: InvokeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<SerializedValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedValue>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Create,
    Change,
    Delete,
    Execute,
    ExecuteFinished,
}

impl Message {
    pub fn object_id(&self) -> &ObjectId {
        match self {
            Message::Create { object_id, .. }
            | Message::Change { object_id, .. }
            | Message::Delete { object_id }
            | Message::Execute { object_id, .. }
            | Message::ExecuteFinished { object_id, .. } => object_id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Create { .. } => MessageKind::Create,
            Message::Change { .. } => MessageKind::Change,
            Message::Delete { .. } => MessageKind::Delete,
            Message::Execute { .. } => MessageKind::Execute,
            Message::ExecuteFinished { .. } => MessageKind::ExecuteFinished,
        }
    }

    pub fn encode_batch(messages: &[Message]) -> Result<String, MessageError> {
        Ok(serde_json::to_string(messages)?)
    }

    pub fn decode_batch(input: &str) -> Result<Vec<Message>, MessageError> {
        serde_json::from_str(input).map_err(|error| MessageError::decode("message batch", error))
    }
}

/// A value as it travels: a primitive, or a reference to a tracked object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedValue {
    #[serde(rename_all = "camelCase")]
    Reference { object_id: ObjectId, type_id: String },
    Primitive { value: JsonValue },
}

impl SerializedValue {
    pub fn null() -> Self {
        SerializedValue::Primitive {
            value: JsonValue::Null,
        }
    }

    pub fn reference_id(&self) -> Option<&ObjectId> {
        match self {
            SerializedValue::Reference { object_id, .. } => Some(object_id),
            SerializedValue::Primitive { .. } => None,
        }
    }

    /// Type name checked against allow-lists.
    pub fn type_name(&self) -> &str {
        match self {
            SerializedValue::Reference { type_id, .. } => type_id,
            SerializedValue::Primitive { value } => match value {
                JsonValue::Null => "null",
                JsonValue::Bool(_) => "boolean",
                JsonValue::Number(_) => "number",
                JsonValue::String(_) => "string",
                JsonValue::Array(_) | JsonValue::Object(_) => "object",
            },
        }
    }
}

/// A standalone serialized value: the root plus the batch that recreates
/// every object it reaches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedDocument {
    pub root: SerializedValue,
    pub messages: Vec<Message>,
}
