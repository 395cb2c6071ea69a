use std::{collections::HashMap, hash::Hash};

use crate::{ClientToken, ObjectId};

use super::AgentContext;

/// Objects an agent keeps alive on behalf of each peer, grouped by the key
/// (property, map key, ...) whose last sent value referenced them.
pub struct ReferenceTracker<K: Eq + Hash + Clone> {
    stored: HashMap<K, HashMap<ClientToken, Vec<ObjectId>>>,
}

impl<K: Eq + Hash + Clone> Default for ReferenceTracker<K> {
    fn default() -> Self {
        Self {
            stored: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> ReferenceTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces what `key` holds for `client`. `object_ids` must already be
    /// held; the previous entries are released.
    pub fn store(
        &mut self,
        key: K,
        client: &ClientToken,
        object_ids: Vec<ObjectId>,
        ctx: &mut AgentContext,
    ) {
        let previous = if object_ids.is_empty() {
            // an emptied key must not keep its entry, the key may be an object
            let Some(by_client) = self.stored.get_mut(&key) else {
                return;
            };
            let previous = by_client.remove(client);
            if by_client.is_empty() {
                self.stored.remove(&key);
            }
            previous
        } else {
            self.stored
                .entry(key)
                .or_default()
                .insert(client.clone(), object_ids)
        };
        if let Some(previous) = previous {
            ctx.release_all(&previous, Some(client));
        }
    }

    pub fn release_client(&mut self, client: &ClientToken, ctx: &mut AgentContext) {
        for by_client in self.stored.values_mut() {
            if let Some(object_ids) = by_client.remove(client) {
                ctx.release_all(&object_ids, Some(client));
            }
        }
        self.stored.retain(|_, by_client| !by_client.is_empty());
    }

    pub fn release_all(&mut self, ctx: &mut AgentContext) {
        for (_, by_client) in self.stored.drain() {
            for (client, object_ids) in by_client {
                ctx.release_all(&object_ids, Some(&client));
            }
        }
    }
}
