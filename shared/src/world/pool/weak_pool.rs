use std::collections::HashMap;

use crate::{
    value::{FinalizationQueue, InstanceKey, WeakInstance},
    ClientToken, Instance, ObjectId,
};

use super::ObjectInfo;

struct WeakEntry {
    info: ObjectInfo,
    instance: WeakInstance,
    key: InstanceKey,
}

/// An object reclaimed while weakly held.
pub struct FreedObject {
    pub object_id: ObjectId,
    /// Peers that had received a create for it
    pub clients: Vec<ClientToken>,
    pub info: ObjectInfo,
}

/// Holds metadata of objects the engine no longer keeps alive. Entries leave
/// either by promotion (the application touched the instance again) or by
/// finalization.
#[derive(Default)]
pub struct WeakObjectPool {
    entries: HashMap<ObjectId, WeakEntry>,
    by_instance: HashMap<InstanceKey, ObjectId>,
    finalization: FinalizationQueue,
}

impl WeakObjectPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.entries.contains_key(object_id)
    }

    /// Drops the strong handle of `info` and watches its instance for
    /// reclamation. Entries without an instance are handed back.
    pub fn insert(&mut self, mut info: ObjectInfo) -> Result<(), ObjectInfo> {
        let Some(instance) = info.clear_instance() else {
            return Err(info);
        };
        let object_id = info.object_id().clone();
        instance.add_finalizer(self.finalization.hook(&object_id));
        let key = instance.key();
        self.by_instance.insert(key, object_id.clone());
        self.entries.insert(
            object_id,
            WeakEntry {
                info,
                instance: instance.downgrade(),
                key,
            },
        );
        Ok(())
    }

    /// Takes the entry for a live instance back out, ready for the strong pool.
    pub fn extract_by_instance(&mut self, instance: &Instance) -> Option<ObjectInfo> {
        let object_id = self.by_instance.get(&instance.key())?.clone();
        let entry = self.entries.get(&object_id)?;
        let same = entry
            .instance
            .upgrade()
            .map_or(false, |live| live.ptr_eq(instance));
        if !same {
            return None;
        }
        self.extract(&object_id, instance.clone())
    }

    /// Like [`WeakObjectPool::extract_by_instance`], by id. Fails once the
    /// instance has been reclaimed.
    pub fn extract_by_id(&mut self, object_id: &ObjectId) -> Option<ObjectInfo> {
        let instance = self.entries.get(object_id)?.instance.upgrade()?;
        self.extract(object_id, instance)
    }

    fn extract(&mut self, object_id: &ObjectId, instance: Instance) -> Option<ObjectInfo> {
        let entry = self.entries.remove(object_id)?;
        self.by_instance.remove(&entry.key);
        let mut info = entry.info;
        info.set_instance(instance);
        Some(info)
    }

    /// Entries whose instances were reclaimed since the last call.
    pub fn freed(&mut self) -> Vec<FreedObject> {
        let mut output = Vec::new();
        for object_id in self.finalization.drain() {
            let Some(entry) = self.entries.get(&object_id) else {
                continue;
            };
            if entry.instance.is_alive() {
                continue;
            }
            let Some(entry) = self.entries.remove(&object_id) else {
                continue;
            };
            if self.by_instance.get(&entry.key) == Some(&object_id) {
                self.by_instance.remove(&entry.key);
            }
            let clients = entry
                .info
                .agent()
                .map(|agent| agent.state().clients().cloned().collect())
                .unwrap_or_default();
            output.push(FreedObject {
                object_id,
                clients,
                info: entry.info,
            });
        }
        output
    }
}
