use crate::{ClientToken, Instance, ObjectId};

/// Something a peer did to this engine's object graph.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// A create message was applied
    Created {
        object_id: ObjectId,
        instance: Instance,
        client: ClientToken,
    },
    /// A change message was applied
    Changed {
        object_id: ObjectId,
        instance: Instance,
        client: ClientToken,
    },
    /// The owning peer deleted an object
    Deleted {
        object_id: ObjectId,
        instance: Option<Instance>,
        client: ClientToken,
    },
}

impl SyncEvent {
    pub fn object_id(&self) -> &ObjectId {
        match self {
            SyncEvent::Created { object_id, .. }
            | SyncEvent::Changed { object_id, .. }
            | SyncEvent::Deleted { object_id, .. } => object_id,
        }
    }
}
