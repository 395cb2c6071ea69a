use std::collections::HashMap;

use log::debug;

use crate::{
    value::MutChannel,
    world::{
        agent::{AgentContext, ProviderRegistry, SyncAgent},
        engine::{IncomingBatch, MemoryManagementMode, ObjectIdGenerator, SyncEvent},
        pool::{ObjectInfo, ObjectPool, WeakObjectPool},
        ObjectSyncError,
    },
    ClientFilter, ClientToken, Instance, ObjectId,
};

/// State shared by the engine and the agents it runs.
pub(crate) struct ObjectWorld {
    pub pool: ObjectPool,
    pub weak_pool: WeakObjectPool,
    pub registry: ProviderRegistry,
    pub id_generator: Box<dyn ObjectIdGenerator>,
    pub channel: MutChannel,
    pub memory_management: MemoryManagementMode,
    pub own_token: ClientToken,
    /// Objects a peer must receive a create for, discovered through references
    pub introductions: HashMap<ClientToken, Vec<ObjectId>>,
    pub events: Vec<SyncEvent>,
}

impl ObjectWorld {
    pub fn new(
        registry: ProviderRegistry,
        id_generator: Box<dyn ObjectIdGenerator>,
        memory_management: MemoryManagementMode,
    ) -> Self {
        Self {
            pool: ObjectPool::new(),
            weak_pool: WeakObjectPool::new(),
            registry,
            id_generator,
            channel: MutChannel::new(),
            memory_management,
            own_token: ClientToken::new("<own>"),
            introductions: HashMap::new(),
            events: Vec::new(),
        }
    }

    fn id_in_use(&self, object_id: &ObjectId) -> bool {
        self.pool.contains(object_id) || self.weak_pool.contains(object_id)
    }

    fn next_object_id(&mut self) -> ObjectId {
        loop {
            let object_id = self.id_generator.generate();
            if !self.id_in_use(&object_id) {
                return object_id;
            }
        }
    }

    /// Starts tracking an instance this process owns.
    pub fn track_new(
        &mut self,
        instance: &Instance,
        explicit_id: Option<ObjectId>,
        is_root: bool,
        client_filter: Option<ClientFilter>,
    ) -> Result<ObjectId, ObjectSyncError> {
        let object_id = match explicit_id {
            Some(object_id) if self.id_in_use(&object_id) => {
                return Err(ObjectSyncError::ObjectAlreadyExists { object_id });
            }
            Some(object_id) => object_id,
            None => self.next_object_id(),
        };
        let mut agent = self.registry.agent_for_instance(instance, &object_id)?;
        agent.state_mut().set_client_filter(client_filter);
        if is_root {
            agent.state_mut().mark_pending();
        }
        let mut info = ObjectInfo::owned(object_id.clone(), instance.clone(), is_root, agent);
        let sender = self.channel.new_sender(&object_id);
        instance.attach_observer(sender.clone());
        info.set_sender(sender);
        self.pool.add(info);
        debug!("Tracking object {} ({})", object_id, instance.type_name());
        Ok(object_id)
    }

    /// Id of `instance`, tracking it as an owned non-root object on first
    /// sight and promoting it out of the weak pool if it is parked there.
    pub fn ensure_tracked(&mut self, instance: &Instance) -> Result<ObjectId, ObjectSyncError> {
        if let Some(object_id) = self.pool.object_id_of(instance) {
            return Ok(object_id.clone());
        }
        if let Some(info) = self.weak_pool.extract_by_instance(instance) {
            return Ok(self.promote(info));
        }
        self.track_new(instance, None, false, None)
    }

    pub fn promote(&mut self, info: ObjectInfo) -> ObjectId {
        let object_id = info.object_id().clone();
        debug!("Promoting weakly held object {}", object_id);
        self.pool.add(info);
        object_id
    }

    pub fn hold(&mut self, object_id: &ObjectId, holder: Option<&ClientToken>) {
        if let Some(info) = self.pool.get_info_by_id_mut(object_id) {
            info.add_reference(holder);
        }
    }

    pub fn release(&mut self, object_id: &ObjectId, holder: Option<&ClientToken>) {
        if let Some(info) = self.pool.get_info_by_id_mut(object_id) {
            info.remove_reference(holder);
        }
    }

    /// Queues a create of `object_id` for `client` unless it already knows it.
    /// The object whose agent is running right now is never queued.
    pub fn introduce(&mut self, object_id: &ObjectId, client: &ClientToken) {
        let Some(agent) = self.pool.get_info_by_id(object_id).and_then(ObjectInfo::agent) else {
            return;
        };
        if agent.state().knows(client) {
            return;
        }
        let queue = self.introductions.entry(client.clone()).or_default();
        if !queue.contains(object_id) {
            queue.push(object_id.clone());
        }
    }

    pub fn is_visible(&self, object_id: &ObjectId, client: &ClientToken) -> bool {
        self.pool
            .get_info_by_id(object_id)
            .and_then(ObjectInfo::agent)
            .map_or(true, |agent| agent.state().is_visible_to(client))
    }

    /// Runs `f` with the agent of `object_id` taken out of the pool, so the
    /// agent and the pool can be borrowed at once. `Ok(None)` when the object
    /// or its instance is missing.
    pub fn with_agent<R>(
        &mut self,
        object_id: &ObjectId,
        incoming: Option<&mut IncomingBatch>,
        origin: Option<&ClientToken>,
        f: impl FnOnce(&mut dyn SyncAgent, &Instance, &mut AgentContext) -> Result<R, ObjectSyncError>,
    ) -> Result<Option<R>, ObjectSyncError> {
        let Some(info) = self.pool.get_info_by_id_mut(object_id) else {
            return Ok(None);
        };
        let Some(instance) = info.instance().cloned() else {
            return Ok(None);
        };
        let Some(mut agent) = info.take_agent() else {
            return Ok(None);
        };
        let result = {
            let mut ctx = AgentContext::new(self, incoming, origin.cloned());
            f(agent.as_mut(), &instance, &mut ctx)
        };
        if let Some(info) = self.pool.get_info_by_id_mut(object_id) {
            info.restore_agent(agent);
        }
        result.map(Some)
    }

    /// Removes an object from the pool, dropping every reference its agent
    /// holds and detaching from its instance.
    pub fn remove_object(&mut self, object_id: &ObjectId) -> Option<ObjectInfo> {
        let _ = self.with_agent(object_id, None, None, |agent, _, ctx| {
            for (client, held) in agent.state_mut().take_temporaries() {
                ctx.release(&held, Some(&client));
            }
            agent.release_all(ctx);
            Ok(())
        });
        let mut info = self.pool.delete_by_id(object_id)?;
        if let Some(sender) = info.take_sender() {
            if let Some(instance) = info.instance() {
                instance.detach_observer(&sender);
            }
        }
        for queue in self.introductions.values_mut() {
            queue.retain(|queued| queued != object_id);
        }
        Some(info)
    }
}
