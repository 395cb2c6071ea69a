//! Standalone serialization of a value and everything it reaches, built on a
//! throwaway engine and peer.

use log::debug;

use crate::{
    messages::{Message, MessageError, SerializedDocument, SerializedValue},
    world::{
        agent::ProviderRegistry,
        engine::{ObjectSyncConfig, ObjectSyncCore, TrackOptions},
        ObjectSyncError,
    },
    PeerSettings, Value,
};

const SERIALIZER_PEER: &str = "serializer";

/// Serializes `value` into a self-contained JSON document.
pub fn serialize(value: &Value, registry: &ProviderRegistry) -> Result<String, ObjectSyncError> {
    let document = match value {
        Value::Object(instance) => {
            let mut engine = ObjectSyncCore::new(registry.clone(), ObjectSyncConfig::default());
            let handle = engine.track(instance, TrackOptions::default())?;
            let peer = engine.register_peer(PeerSettings::new(SERIALIZER_PEER));
            let messages = engine.get_messages(&peer)?;
            let type_id = messages
                .iter()
                .find_map(|message| match message {
                    Message::Create {
                        object_id, type_id, ..
                    } if object_id == handle.object_id() => Some(type_id.clone()),
                    _ => None,
                })
                .ok_or_else(|| ObjectSyncError::UnknownObject {
                    object_id: handle.object_id().clone(),
                })?;
            debug!("Serialized {} objects", messages.len());
            SerializedDocument {
                root: SerializedValue::Reference {
                    object_id: handle.object_id().clone(),
                    type_id,
                },
                messages,
            }
        }
        primitive => SerializedDocument {
            root: SerializedValue::Primitive {
                value: primitive.to_json().unwrap_or_default(),
            },
            messages: Vec::new(),
        },
    };
    Ok(serde_json::to_string(&document).map_err(MessageError::from)?)
}

/// Rebuilds a value from a document produced by [`serialize`].
pub fn deserialize(input: &str, registry: &ProviderRegistry) -> Result<Value, ObjectSyncError> {
    let document: SerializedDocument =
        serde_json::from_str(input).map_err(|error| MessageError::decode("serialized document", error))?;
    match document.root {
        SerializedValue::Primitive { value } => Value::from_json(&value).ok_or_else(|| {
            MessageError::Decode {
                what: "serialized document",
                reason: "root is neither a primitive nor a reference".to_string(),
            }
            .into()
        }),
        SerializedValue::Reference { object_id, .. } => {
            let mut engine = ObjectSyncCore::new(registry.clone(), ObjectSyncConfig::default());
            let peer = engine.register_peer(PeerSettings::new(SERIALIZER_PEER));
            engine.apply_messages(&peer, document.messages)?;
            engine
                .instance_by_id(&object_id)
                .map(Value::Object)
                .ok_or(ObjectSyncError::UnknownObject { object_id })
        }
    }
}
