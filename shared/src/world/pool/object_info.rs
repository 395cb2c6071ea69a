use std::collections::HashMap;

use crate::{
    value::MutSender,
    world::agent::SyncAgent,
    ClientToken, Instance, ObjectId,
};

/// Everything the engine knows about one tracked object.
pub struct ObjectInfo {
    object_id: ObjectId,
    instance: Option<Instance>,
    type_id: String,
    is_root: bool,
    is_owned: bool,
    reference_count_by_client: HashMap<Option<ClientToken>, usize>,
    agent: Option<Box<dyn SyncAgent>>,
    sender: Option<MutSender>,
    pub(crate) sequence: u64,
}

impl ObjectInfo {
    /// An object this process created.
    pub fn owned(
        object_id: ObjectId,
        instance: Instance,
        is_root: bool,
        agent: Box<dyn SyncAgent>,
    ) -> Self {
        Self {
            object_id,
            type_id: agent.type_id().to_string(),
            instance: Some(instance),
            is_root,
            is_owned: true,
            reference_count_by_client: HashMap::new(),
            agent: Some(agent),
            sender: None,
            sequence: 0,
        }
    }

    /// An object announced by a peer. The instance and agent are filled in
    /// while the create message is applied.
    pub fn foreign(object_id: ObjectId, type_id: &str, is_root: bool) -> Self {
        Self {
            object_id,
            type_id: type_id.to_string(),
            instance: None,
            is_root,
            is_owned: false,
            reference_count_by_client: HashMap::new(),
            agent: None,
            sender: None,
            sequence: 0,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    /// The instance may only be set once.
    pub(crate) fn set_instance(&mut self, instance: Instance) -> bool {
        if self.instance.is_some() {
            return false;
        }
        self.instance = Some(instance);
        true
    }

    pub(crate) fn clear_instance(&mut self) -> Option<Instance> {
        self.instance.take()
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub(crate) fn set_root(&mut self, is_root: bool) {
        self.is_root = is_root;
    }

    pub fn is_owned(&self) -> bool {
        self.is_owned
    }

    // Agent

    pub fn agent(&self) -> Option<&dyn SyncAgent> {
        self.agent.as_deref()
    }

    pub fn agent_mut(&mut self) -> Option<&mut (dyn SyncAgent + 'static)> {
        self.agent.as_deref_mut()
    }

    pub(crate) fn take_agent(&mut self) -> Option<Box<dyn SyncAgent>> {
        self.agent.take()
    }

    pub(crate) fn restore_agent(&mut self, agent: Box<dyn SyncAgent>) {
        self.agent = Some(agent);
    }

    pub(crate) fn sender(&self) -> Option<&MutSender> {
        self.sender.as_ref()
    }

    pub(crate) fn set_sender(&mut self, sender: MutSender) {
        self.sender = Some(sender);
    }

    pub(crate) fn take_sender(&mut self) -> Option<MutSender> {
        self.sender.take()
    }

    // References

    pub fn add_reference(&mut self, holder: Option<&ClientToken>) {
        *self
            .reference_count_by_client
            .entry(holder.cloned())
            .or_insert(0) += 1;
    }

    pub fn remove_reference(&mut self, holder: Option<&ClientToken>) {
        let key = holder.cloned();
        let Some(count) = self.reference_count_by_client.get_mut(&key) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.reference_count_by_client.remove(&key);
        }
    }

    pub fn reference_count(&self, holder: Option<&ClientToken>) -> usize {
        self.reference_count_by_client
            .get(&holder.cloned())
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn clear_references(&mut self, holder: Option<&ClientToken>) {
        self.reference_count_by_client.remove(&holder.cloned());
    }

    /// True when no holder other than `ignored` keeps a reference.
    pub fn is_unreferenced(&self, ignored: &ClientToken) -> bool {
        self.reference_count_by_client
            .iter()
            .all(|(holder, count)| *count == 0 || holder.as_ref() == Some(ignored))
    }

    /// Not a root, owned here, and nothing but `own_token` holds it.
    pub fn is_orphaned(&self, own_token: &ClientToken) -> bool {
        !self.is_root && self.is_owned && self.is_unreferenced(own_token)
    }

    /// `client` has a copy it is no longer allowed to see.
    pub fn is_hidden_from(&self, client: &ClientToken) -> bool {
        self.agent().map_or(false, |agent| {
            let state = agent.state();
            state.knows(client) && !state.is_visible_to(client)
        })
    }

    /// `client` saw a create for this object and no longer holds a reference.
    pub fn should_delete_for(&self, client: &ClientToken) -> bool {
        if self.is_root || !self.is_owned {
            return false;
        }
        let Some(agent) = self.agent() else {
            return false;
        };
        agent.state().knows(client) && self.reference_count(Some(client)) == 0
    }
}
