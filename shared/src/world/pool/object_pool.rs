use std::collections::{BTreeMap, HashMap};

use crate::{value::InstanceKey, ClientToken, Instance, ObjectId};

use super::ObjectInfo;

/// Identity pool: object id <-> live instance <-> metadata. Iteration follows
/// insertion order.
#[derive(Default)]
pub struct ObjectPool {
    infos: HashMap<ObjectId, ObjectInfo>,
    by_instance: HashMap<InstanceKey, ObjectId>,
    order: BTreeMap<u64, ObjectId>,
    next_sequence: u64,
}

impl ObjectPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut info: ObjectInfo) {
        let object_id = info.object_id().clone();
        if let Some(previous) = self.delete_by_id(&object_id) {
            log::warn!("ObjectPool: replacing object {}", previous.object_id());
        }
        info.sequence = self.next_sequence;
        self.next_sequence += 1;
        if let Some(instance) = info.instance() {
            self.by_instance.insert(instance.key(), object_id.clone());
        }
        self.order.insert(info.sequence, object_id.clone());
        self.infos.insert(object_id, info);
    }

    /// Sets the instance of an entry created without one. Returns false when
    /// the entry is missing or already has an instance.
    pub fn set_instance(&mut self, object_id: &ObjectId, instance: &Instance) -> bool {
        let Some(info) = self.infos.get_mut(object_id) else {
            return false;
        };
        if !info.set_instance(instance.clone()) {
            return false;
        }
        self.by_instance.insert(instance.key(), object_id.clone());
        true
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.infos.contains_key(object_id)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn get_info_by_object(&self, instance: &Instance) -> Option<&ObjectInfo> {
        self.by_instance
            .get(&instance.key())
            .and_then(|object_id| self.infos.get(object_id))
    }

    pub fn get_info_by_id(&self, object_id: &ObjectId) -> Option<&ObjectInfo> {
        self.infos.get(object_id)
    }

    pub fn get_info_by_id_mut(&mut self, object_id: &ObjectId) -> Option<&mut ObjectInfo> {
        self.infos.get_mut(object_id)
    }

    pub fn get_object_by_id(&self, object_id: &ObjectId) -> Option<Instance> {
        self.infos
            .get(object_id)
            .and_then(|info| info.instance().cloned())
    }

    pub fn object_id_of(&self, instance: &Instance) -> Option<&ObjectId> {
        self.by_instance.get(&instance.key())
    }

    pub fn delete_by_id(&mut self, object_id: &ObjectId) -> Option<ObjectInfo> {
        let info = self.infos.remove(object_id)?;
        if let Some(instance) = info.instance() {
            self.by_instance.remove(&instance.key());
        }
        self.order.remove(&info.sequence);
        Some(info)
    }

    pub fn delete_by_object(&mut self, instance: &Instance) -> Option<ObjectInfo> {
        let object_id = self.by_instance.get(&instance.key())?.clone();
        self.delete_by_id(&object_id)
    }

    /// Ids in insertion order.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.order.values().cloned().collect()
    }

    pub fn infos(&self) -> impl Iterator<Item = &ObjectInfo> {
        self.order
            .values()
            .filter_map(move |object_id| self.infos.get(object_id))
    }

    /// Objects `client` has a copy of but must lose: hidden from it, or,
    /// when `counts_references`, no longer referenced by it.
    pub fn object_infos_to_delete(&self, client: &ClientToken, counts_references: bool) -> Vec<ObjectId> {
        self.infos()
            .filter(|info| {
                info.is_hidden_from(client) || (counts_references && info.should_delete_for(client))
            })
            .map(|info| info.object_id().clone())
            .collect()
    }

    /// Owned, non-root objects nothing but `own_token` holds.
    pub fn orphaned_object_infos(&self, own_token: &ClientToken) -> Vec<ObjectId> {
        self.infos()
            .filter(|info| info.is_orphaned(own_token))
            .map(|info| info.object_id().clone())
            .collect()
    }
}
