use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::{
    messages::{Message, SerializedValue},
    world::{
        agent::ProviderRegistry,
        pool::{ObjectPool, WeakObjectPool},
        ObjectSyncError,
    },
    ObjectId,
};

/// A create message not applied yet.
#[derive(Clone, Debug)]
pub struct PendingCreate {
    pub type_id: String,
    pub data: JsonValue,
    pub is_root: bool,
}

/// One peer's batch, split by message kind. Creates stay here until they
/// are applied, either in order or when something references them first.
#[derive(Default)]
pub struct IncomingBatch {
    create_order: Vec<ObjectId>,
    creates: HashMap<ObjectId, PendingCreate>,
    updates: Vec<Message>,
    deletes: Vec<Message>,
}

impl IncomingBatch {
    pub fn partition(messages: Vec<Message>) -> Result<Self, ObjectSyncError> {
        let mut batch = Self::default();
        let mut root_creates = Vec::new();
        let mut other_creates = Vec::new();
        for message in messages {
            match message {
                Message::Create {
                    object_id,
                    type_id,
                    data,
                    is_root,
                } => {
                    if batch.creates.contains_key(&object_id) {
                        return Err(ObjectSyncError::ObjectAlreadyExists { object_id });
                    }
                    if is_root {
                        root_creates.push(object_id.clone());
                    } else {
                        other_creates.push(object_id.clone());
                    }
                    batch.creates.insert(
                        object_id,
                        PendingCreate {
                            type_id,
                            data,
                            is_root,
                        },
                    );
                }
                Message::Delete { .. } => batch.deletes.push(message),
                _ => batch.updates.push(message),
            }
        }
        // roots first, then arrival order
        batch.create_order = root_creates;
        batch.create_order.extend(other_creates);
        Ok(batch)
    }

    /// Ids of every create in the batch, roots first.
    pub fn create_order(&self) -> Vec<ObjectId> {
        self.create_order.clone()
    }

    pub fn has_create(&self, object_id: &ObjectId) -> bool {
        self.creates.contains_key(object_id)
    }

    pub fn create(&self, object_id: &ObjectId) -> Option<&PendingCreate> {
        self.creates.get(object_id)
    }

    pub fn take_create(&mut self, object_id: &ObjectId) -> Option<PendingCreate> {
        self.creates.remove(object_id)
    }

    pub fn creates(&self) -> impl Iterator<Item = (&ObjectId, &PendingCreate)> {
        self.create_order
            .iter()
            .filter_map(move |object_id| self.creates.get_key_value(object_id))
    }

    /// Changes, executes and results, in arrival order.
    pub fn updates(&self) -> &[Message] {
        &self.updates
    }

    pub fn deletes(&self) -> &[Message] {
        &self.deletes
    }

    pub(crate) fn take_updates(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.updates)
    }

    pub(crate) fn take_deletes(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.deletes)
    }
}

/// Read-only view used to check a whole batch before any of it is applied.
pub struct BatchValidator<'a> {
    pool: &'a ObjectPool,
    weak_pool: &'a WeakObjectPool,
    registry: &'a ProviderRegistry,
    batch: &'a IncomingBatch,
}

impl<'a> BatchValidator<'a> {
    pub(crate) fn new(
        pool: &'a ObjectPool,
        weak_pool: &'a WeakObjectPool,
        registry: &'a ProviderRegistry,
        batch: &'a IncomingBatch,
    ) -> Self {
        Self {
            pool,
            weak_pool,
            registry,
            batch,
        }
    }

    /// Known to this engine or created earlier in the same batch.
    pub fn object_exists(&self, object_id: &ObjectId) -> bool {
        self.pool.contains(object_id)
            || self.weak_pool.contains(object_id)
            || self.batch.has_create(object_id)
    }

    /// Type the receiving side will see for a reference. Ids already known
    /// answer with their own type, not the one the sender claims.
    fn reference_type<'v>(&'v self, object_id: &ObjectId, claimed: &'v str) -> &'v str {
        if let Some(info) = self.pool.get_info_by_id(object_id) {
            return info.type_id();
        }
        if let Some(create) = self.batch.create(object_id) {
            return &create.type_id;
        }
        claimed
    }

    /// References must resolve; with an allow-list the value's type, or one
    /// of its ancestors, must be on it. `null` always passes.
    pub fn check_value(
        &self,
        object_id: &ObjectId,
        value: &SerializedValue,
        allowed: Option<&[String]>,
    ) -> Result<(), ObjectSyncError> {
        let names = match value {
            SerializedValue::Reference {
                object_id: referenced,
                type_id,
            } => {
                if !self.object_exists(referenced) {
                    return Err(ObjectSyncError::UnknownObject {
                        object_id: referenced.clone(),
                    });
                }
                self.registry
                    .type_names_for_id(self.reference_type(referenced, type_id))
            }
            SerializedValue::Primitive { .. } => vec![value.type_name().to_string()],
        };
        let Some(allowed) = allowed else {
            return Ok(());
        };
        if names[0] == "null" || names.iter().any(|name| allowed.contains(name)) {
            return Ok(());
        }
        Err(ObjectSyncError::DisallowedType {
            object_id: object_id.clone(),
            type_name: names[0].clone(),
        })
    }
}
