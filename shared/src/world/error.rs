use thiserror::Error;

use crate::{messages::MessageError, ObjectId};

/// Errors surfaced by the synchronization engine
///
/// Anything raised while applying an incoming batch aborts the whole batch;
/// the caller decides whether to drop the peer that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectSyncError {
    /// A message references an id with no pool entry and no pending create
    #[error("Unknown object {object_id}")]
    UnknownObject { object_id: ObjectId },

    /// No provider is registered for a type id or instance type
    #[error("No provider registered for type {type_id}")]
    UnknownType { type_id: String },

    /// The requesting peer may not touch this member
    #[error("Peer is not authorized to access {member} on object {object_id}")]
    NotAuthorized { object_id: ObjectId, member: String },

    /// A deserialized value has a type outside the receiving agent's allow-list
    #[error("Type {type_name} is not allowed from the sender for object {object_id}")]
    DisallowedType {
        object_id: ObjectId,
        type_name: String,
    },

    /// Re-tracking a root under a different explicit id
    #[error("Instance is already tracked as {object_id}, cannot track it as {requested}")]
    AlreadyTracked {
        object_id: ObjectId,
        requested: ObjectId,
    },

    /// The peer token was never registered or has been unregistered
    #[error("Unknown peer {identity}")]
    UnknownPeer { identity: String },

    /// A create (or an explicit id) collides with a tracked object
    #[error("Object {object_id} already exists")]
    ObjectAlreadyExists { object_id: ObjectId },

    /// A message payload does not have the shape its agent expects
    #[error("Invalid message data for object {object_id}: {reason}")]
    InvalidMessageData { object_id: ObjectId, reason: String },

    /// Constructor arguments could not be satisfied for a create
    #[error("Cannot construct {type_id}: {reason}")]
    ConstructorArguments { type_id: String, reason: String },

    /// A constructor argument references the object being constructed
    #[error("Object {object_id} is referenced while it is being constructed")]
    CircularConstructorReference { object_id: ObjectId },

    /// The requested change-set mode cannot observe this collection
    #[error("Change set mode unsupported for object {object_id}: {reason}")]
    ChangeSetModeUnsupported { object_id: ObjectId, reason: String },

    /// The instance is not tracked by this engine
    #[error("Instance is not tracked")]
    NotTracked,

    /// Wire encoding or decoding failed
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl ObjectSyncError {
    pub fn invalid_data(object_id: &ObjectId, reason: impl Into<String>) -> Self {
        ObjectSyncError::InvalidMessageData {
            object_id: object_id.clone(),
            reason: reason.into(),
        }
    }
}
