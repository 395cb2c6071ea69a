use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
};

use log::{debug, info, warn};
use serde_json::Value as JsonValue;

use crate::{
    messages::{Message, SerializedValue},
    value::Mutation,
    world::{
        agent::{AgentContext, GenerationRequest, ProviderRegistry, SyncAgent},
        diff::SpliceInstruction,
        object_world::ObjectWorld,
        pool::{FreedObject, ObjectInfo},
        ObjectSyncError,
    },
    ClientFilter, ClientToken, Instance, InvokeId, ObjectId, PeerSettings, Value,
};

use super::{
    BatchValidator, IncomingBatch, InvocationManager, InvokeError, InvokeResult,
    MemoryManagementMode, ObjectSyncConfig, SyncEvent,
};

/// Options for [`ObjectSyncCore::track`].
#[derive(Clone, Debug, Default)]
pub struct TrackOptions {
    /// Use this id instead of a generated one
    pub object_id: Option<ObjectId>,
    /// Restrict which peers see the object
    pub client_filter: Option<ClientFilter>,
}

impl TrackOptions {
    pub fn with_id(object_id: impl Into<ObjectId>) -> Self {
        Self {
            object_id: Some(object_id.into()),
            client_filter: None,
        }
    }

    pub fn with_filter(client_filter: ClientFilter) -> Self {
        Self {
            object_id: None,
            client_filter: Some(client_filter),
        }
    }
}

/// A tracked root.
#[derive(Clone, Debug)]
pub struct TrackHandle {
    object_id: ObjectId,
    instance: Instance,
}

impl TrackHandle {
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

/// Which peers an outbound invocation goes to. Peers that have not received
/// the object are skipped.
#[derive(Clone, Debug)]
pub enum InvokeTarget {
    All,
    Client(ClientToken),
    Clients(Vec<ClientToken>),
}

impl InvokeTarget {
    fn includes(&self, client: &ClientToken) -> bool {
        match self {
            InvokeTarget::All => true,
            InvokeTarget::Client(target) => target == client,
            InvokeTarget::Clients(targets) => targets.contains(client),
        }
    }

    fn named(&self) -> &[ClientToken] {
        match self {
            InvokeTarget::All => &[],
            InvokeTarget::Client(target) => std::slice::from_ref(target),
            InvokeTarget::Clients(targets) => targets,
        }
    }
}

/// The synchronization engine. Tracks root objects, generates per-peer
/// message batches, applies incoming batches and correlates remote method
/// calls.
///
/// Every peer runs through the same cycle: [`ObjectSyncCore::get_messages`]
/// for each peer, then one [`ObjectSyncCore::clear_states`].
pub struct ObjectSyncCore {
    world: ObjectWorld,
    peers: Vec<ClientToken>,
    invocations: InvocationManager,
    /// Deletes owed to peers for objects that left the pool without passing
    /// through the per-peer deletion sweep
    deferred_deletes: HashMap<ClientToken, Vec<ObjectId>>,
}

impl ObjectSyncCore {
    pub fn new(mut registry: ProviderRegistry, mut config: ObjectSyncConfig) -> Self {
        if !registry.is_locked() {
            registry.lock();
        }
        let id_generator = config.take_generator();
        Self {
            world: ObjectWorld::new(registry, id_generator, config.memory_management),
            peers: Vec::new(),
            invocations: InvocationManager::new(),
            deferred_deletes: HashMap::new(),
        }
    }

    // Roots

    /// Tracks `instance` as a root: it is sent to every peer allowed to see
    /// it and never removed for lack of references.
    pub fn track(&mut self, instance: &Instance, options: TrackOptions) -> Result<TrackHandle, ObjectSyncError> {
        self.drain_mutations()?;
        let TrackOptions {
            object_id: requested,
            client_filter,
        } = options;

        let existing = match self.world.pool.object_id_of(instance) {
            Some(object_id) => Some(object_id.clone()),
            None => self
                .world
                .weak_pool
                .extract_by_instance(instance)
                .map(|info| self.world.promote(info)),
        };

        let object_id = match existing {
            Some(object_id) => {
                if let Some(requested) = requested {
                    if requested != object_id {
                        return Err(ObjectSyncError::AlreadyTracked { object_id, requested });
                    }
                }
                if let Some(info) = self.world.pool.get_info_by_id_mut(&object_id) {
                    info.set_root(true);
                    if let (Some(agent), Some(filter)) = (info.agent_mut(), client_filter) {
                        agent.state_mut().set_client_filter(Some(filter));
                    }
                }
                object_id
            }
            None => self.world.track_new(instance, requested, true, client_filter)?,
        };
        info!("Tracking root object {}", object_id);
        Ok(TrackHandle {
            object_id,
            instance: instance.clone(),
        })
    }

    /// Stops treating `instance` as a root. Peers get a delete once nothing
    /// they hold references it. False when it was not a tracked root.
    pub fn untrack(&mut self, instance: &Instance) -> bool {
        let Some(object_id) = self.world.pool.object_id_of(instance).cloned() else {
            return false;
        };
        let Some(info) = self.world.pool.get_info_by_id_mut(&object_id) else {
            return false;
        };
        if !info.is_root() {
            return false;
        }
        info.set_root(false);
        info!("Untracked root object {}", object_id);
        true
    }

    /// Keeps an owned object alive without making it a root.
    pub fn retain(&mut self, instance: &Instance) -> Result<(), ObjectSyncError> {
        let object_id = self.tracked_id(instance)?;
        self.world.hold(&object_id, None);
        Ok(())
    }

    pub fn release(&mut self, instance: &Instance) -> Result<(), ObjectSyncError> {
        let object_id = self.tracked_id(instance)?;
        self.world.release(&object_id, None);
        Ok(())
    }

    pub fn set_client_filter(
        &mut self,
        instance: &Instance,
        client_filter: Option<ClientFilter>,
    ) -> Result<(), ObjectSyncError> {
        self.configure_agent(instance, |agent| agent.state_mut().set_client_filter(client_filter))
    }

    /// Runs `f` against the agent syncing `instance`, for per-object knobs
    /// such as change-set modes and allow-lists.
    pub fn configure_agent<R>(
        &mut self,
        instance: &Instance,
        f: impl FnOnce(&mut dyn SyncAgent) -> R,
    ) -> Result<R, ObjectSyncError> {
        let object_id = self.tracked_id(instance)?;
        let agent = self
            .world
            .pool
            .get_info_by_id_mut(&object_id)
            .and_then(|info| info.agent_mut())
            .ok_or(ObjectSyncError::NotTracked)?;
        Ok(f(agent))
    }

    /// Feeds a splice made to a plain array by hand.
    pub fn report_splice(
        &mut self,
        instance: &Instance,
        splice: SpliceInstruction<Value>,
    ) -> Result<(), ObjectSyncError> {
        self.report_change(instance, Mutation::Splice(splice))
    }

    /// Feeds a change made to a plain collection by hand.
    pub fn report_change(&mut self, instance: &Instance, mutation: Mutation) -> Result<(), ObjectSyncError> {
        self.drain_mutations()?;
        let object_id = self.tracked_id(instance)?;
        self.world
            .with_agent(&object_id, None, None, |agent, instance, ctx| {
                agent.report_mutation(instance, mutation, ctx)
            })?
            .ok_or(ObjectSyncError::NotTracked)
    }

    // Peers

    pub fn register_peer(&mut self, settings: PeerSettings) -> ClientToken {
        let client = ClientToken::new(settings.identity);
        info!("Registered peer {}", client.identity());
        self.peers.push(client.clone());
        client
    }

    /// Forgets a peer: drops every reference held for it and cancels its
    /// outstanding invocations.
    pub fn unregister_peer(&mut self, client: &ClientToken) -> Result<(), ObjectSyncError> {
        self.check_peer(client)?;
        self.drain_mutations()?;
        for object_id in self.world.pool.object_ids() {
            self.world.with_agent(&object_id, None, None, |agent, _, ctx| {
                forget_client(agent, client, ctx);
                Ok(())
            })?;
        }
        for object_id in self.world.pool.object_ids() {
            if let Some(info) = self.world.pool.get_info_by_id_mut(&object_id) {
                info.clear_references(Some(client));
            }
        }
        self.world.introductions.remove(client);
        self.deferred_deletes.remove(client);
        self.invocations.cancel_client(client, "peer removed");
        self.peers.retain(|peer| peer != client);
        info!("Unregistered peer {}", client.identity());
        Ok(())
    }

    pub fn peers(&self) -> &[ClientToken] {
        &self.peers
    }

    fn check_peer(&self, client: &ClientToken) -> Result<(), ObjectSyncError> {
        if self.peers.contains(client) {
            Ok(())
        } else {
            Err(ObjectSyncError::UnknownPeer {
                identity: client.identity().to_string(),
            })
        }
    }

    // Outgoing

    /// Builds the next batch for `client`: creates and changes first, then
    /// deletes. Calling it again before anything changes yields nothing.
    pub fn get_messages(&mut self, client: &ClientToken) -> Result<Vec<Message>, ObjectSyncError> {
        self.check_peer(client)?;
        self.drain_mutations()?;
        self.collect_freed();
        self.poll_invocations()?;

        let mut messages = self.collect(client)?;
        messages.extend(self.sweep_deletions(client)?);
        if let Some(deleted) = self.deferred_deletes.remove(client) {
            messages.extend(deleted.into_iter().map(|object_id| Message::Delete { object_id }));
        }
        if !messages.is_empty() {
            debug!("Generated {} messages for {}", messages.len(), client.identity());
        }
        Ok(messages)
    }

    pub fn get_all_messages(&mut self) -> Result<HashMap<ClientToken, Vec<Message>>, ObjectSyncError> {
        let mut batches = HashMap::new();
        for client in self.peers.clone() {
            let messages = self.get_messages(&client)?;
            batches.insert(client, messages);
        }
        Ok(batches)
    }

    /// Ends a cycle: refreshes every agent's snapshot, drops temporary
    /// references already delivered, and removes orphans.
    pub fn clear_states(&mut self) -> Result<(), ObjectSyncError> {
        self.drain_mutations()?;
        for object_id in self.world.pool.object_ids() {
            self.world.with_agent(&object_id, None, None, |agent, instance, ctx| {
                for (client, held) in agent.state_mut().take_temporaries() {
                    if agent.state().has_outgoing_for(&client) {
                        // still waiting to be sent
                        agent.state_mut().hold_temporary(&client, held);
                    } else {
                        ctx.release(&held, Some(&client));
                    }
                }
                agent.clear_states(instance, ctx)
            })?;
        }
        self.sweep_orphans();
        Ok(())
    }

    /// Objects `client` must hear about this cycle, in generation order.
    /// Objects referenced for the first time are appended as they turn up.
    fn collect(&mut self, client: &ClientToken) -> Result<Vec<Message>, ObjectSyncError> {
        let mut worklist: VecDeque<ObjectId> = self
            .world
            .pool
            .infos()
            .filter(|info| {
                let Some(agent) = info.agent() else {
                    return false;
                };
                let state = agent.state();
                if state.knows(client) {
                    state.needs_generation(client)
                } else {
                    info.is_root() && state.is_visible_to(client)
                }
            })
            .map(|info| info.object_id().clone())
            .collect();

        let mut visited = HashSet::new();
        let mut messages = Vec::new();
        loop {
            let object_id = match worklist.pop_front() {
                Some(object_id) => object_id,
                None => match self.world.introductions.remove(client) {
                    Some(introduced) if !introduced.is_empty() => {
                        worklist.extend(introduced);
                        continue;
                    }
                    _ => break,
                },
            };
            if !visited.insert(object_id.clone()) {
                continue;
            }
            messages.extend(self.generate_for(&object_id, client)?);
        }
        Ok(messages)
    }

    fn generate_for(&mut self, object_id: &ObjectId, client: &ClientToken) -> Result<Vec<Message>, ObjectSyncError> {
        let Some(is_root) = self.world.pool.get_info_by_id(object_id).map(ObjectInfo::is_root) else {
            return Ok(Vec::new());
        };
        let generated = self.world.with_agent(object_id, None, None, |agent, instance, ctx| {
            let state = agent.state();
            if !state.is_visible_to(client) {
                return Ok(Vec::new());
            }
            let is_new_client = !state.knows(client);
            if !is_new_client && !state.needs_generation(client) {
                return Ok(Vec::new());
            }
            let request = GenerationRequest {
                client,
                is_new_client,
                is_root,
            };
            let mut messages = agent.generate_messages(instance, &request, ctx)?;
            let state = agent.state_mut();
            if is_new_client {
                state.add_client(client);
            }
            state.mark_flushed(client);
            messages.extend(state.take_outgoing(client));
            Ok(messages)
        })?;
        Ok(generated.unwrap_or_default())
    }

    /// Deletes for objects `client` knows but may no longer have, repeated
    /// until nothing else falls out so nested children go in the same batch.
    fn sweep_deletions(&mut self, client: &ClientToken) -> Result<Vec<Message>, ObjectSyncError> {
        let counts_references = self.world.memory_management == MemoryManagementMode::Strong;
        let mut messages = Vec::new();
        loop {
            let doomed = self.world.pool.object_infos_to_delete(client, counts_references);
            if doomed.is_empty() {
                break;
            }
            for object_id in doomed {
                self.delete_for_client(&object_id, client)?;
                messages.push(Message::Delete { object_id });
            }
        }
        Ok(messages)
    }

    fn delete_for_client(&mut self, object_id: &ObjectId, client: &ClientToken) -> Result<(), ObjectSyncError> {
        self.world.with_agent(object_id, None, None, |agent, _, ctx| {
            forget_client(agent, client, ctx);
            Ok(())
        })?;
        self.invocations
            .cancel_object_for(object_id, client, "object deleted");
        debug!("Deleting object {} for {}", object_id, client.identity());
        Ok(())
    }

    fn sweep_orphans(&mut self) {
        let weak = self.world.memory_management == MemoryManagementMode::Weak;
        loop {
            let own_token = self.world.own_token.clone();
            let orphans: Vec<ObjectId> = self
                .world
                .pool
                .orphaned_object_infos(&own_token)
                .into_iter()
                .filter(|object_id| {
                    let agent = self.world.pool.get_info_by_id(object_id).and_then(|info| info.agent());
                    let Some(agent) = agent else {
                        return false;
                    };
                    let state = agent.state();
                    if state.has_pending_changes() || state.has_outgoing() {
                        return false;
                    }
                    // peers that saw a create must see the delete first
                    weak || state.clients().next().is_none()
                })
                .collect();
            if orphans.is_empty() {
                break;
            }
            for object_id in orphans {
                if weak {
                    self.demote(&object_id);
                } else {
                    self.remove_object(&object_id, "object removed");
                }
            }
        }
    }

    fn remove_object(&mut self, object_id: &ObjectId, reason: &str) {
        if self.world.remove_object(object_id).is_some() {
            debug!("Removed object {}", object_id);
        }
        self.invocations.cancel_object(object_id, reason);
    }

    /// Moves an orphan to the weak pool, where only its reclamation deletes
    /// it.
    fn demote(&mut self, object_id: &ObjectId) {
        let Some(info) = self.world.pool.delete_by_id(object_id) else {
            return;
        };
        match self.world.weak_pool.insert(info) {
            Ok(()) => debug!("Weakly holding object {}", object_id),
            Err(_) => self.invocations.cancel_object(object_id, "object removed"),
        }
    }

    /// Turns reclaimed weak objects into deletes for every peer that knew
    /// them.
    fn collect_freed(&mut self) {
        for freed in self.world.weak_pool.freed() {
            let FreedObject {
                object_id,
                clients,
                mut info,
            } = freed;
            info!("Object {} was reclaimed", object_id);
            if let Some(mut agent) = info.take_agent() {
                let mut ctx = AgentContext::new(&mut self.world, None, None);
                for (client, held) in agent.state_mut().take_temporaries() {
                    ctx.release(&held, Some(&client));
                }
                agent.release_all(&mut ctx);
            }
            for client in clients {
                if self.peers.contains(&client) {
                    self.deferred_deletes
                        .entry(client)
                        .or_default()
                        .push(object_id.clone());
                }
            }
            self.invocations.cancel_object(&object_id, "object reclaimed");
        }
    }

    fn poll_invocations(&mut self) -> Result<(), ObjectSyncError> {
        for object_id in self.world.pool.object_ids() {
            self.world.with_agent(&object_id, None, None, |agent, instance, ctx| {
                agent.poll_invocations(instance, ctx)
            })?;
        }
        Ok(())
    }

    fn drain_mutations(&mut self) -> Result<(), ObjectSyncError> {
        for (object_id, mutation) in self.world.channel.receive() {
            self.world.with_agent(&object_id, None, None, |agent, instance, ctx| {
                agent.on_mutation(instance, mutation, ctx)
            })?;
        }
        Ok(())
    }

    // Incoming

    /// Applies a batch from `client`. The whole batch is validated first, so
    /// a rejected batch leaves the graph untouched.
    pub fn apply_messages(&mut self, client: &ClientToken, messages: Vec<Message>) -> Result<(), ObjectSyncError> {
        self.check_peer(client)?;
        self.drain_mutations()?;
        let mut batch = IncomingBatch::partition(messages)?;
        self.promote_addressed(&batch);

        if let Err(error) = self.validate_batch(&batch, client) {
            warn!("Rejected batch from {}: {}", client.identity(), error);
            return Err(error);
        }
        let result = self.apply_batch(&mut batch, client);
        self.release_own_holds();
        if let Err(error) = &result {
            warn!("Failed to apply batch from {}: {}", client.identity(), error);
        }
        result
    }

    /// Weakly held objects a batch talks about become strongly held again.
    fn promote_addressed(&mut self, batch: &IncomingBatch) {
        for message in batch.updates() {
            let object_id = message.object_id();
            if self.world.weak_pool.contains(object_id) {
                if let Some(info) = self.world.weak_pool.extract_by_id(object_id) {
                    self.world.promote(info);
                }
            }
        }
    }

    fn validate_batch(&self, batch: &IncomingBatch, client: &ClientToken) -> Result<(), ObjectSyncError> {
        let world = &self.world;
        let validator = BatchValidator::new(&world.pool, &world.weak_pool, &world.registry, batch);

        let mut fresh: HashMap<ObjectId, Box<dyn SyncAgent>> = HashMap::new();
        for (object_id, create) in batch.creates() {
            if world.pool.contains(object_id) || world.weak_pool.contains(object_id) {
                return Err(ObjectSyncError::ObjectAlreadyExists {
                    object_id: object_id.clone(),
                });
            }
            let agent = world.registry.agent_for_type_id(&create.type_id, object_id)?;
            agent.validate_create(&create.data, client, &validator)?;
            fresh.insert(object_id.clone(), agent);
        }

        for message in batch.updates() {
            match message {
                Message::Change { object_id, data } => {
                    validation_agent(world, &fresh, object_id)?.validate_change(data, client, &validator)?
                }
                Message::Execute {
                    object_id,
                    method,
                    parameters,
                    ..
                } => validation_agent(world, &fresh, object_id)?.validate_execute(
                    method,
                    parameters,
                    client,
                    &validator,
                )?,
                Message::ExecuteFinished {
                    object_id,
                    invoke_id,
                    result,
                    error,
                } => {
                    let Some(method) = self.invocations.method_of(*invoke_id, client) else {
                        continue;
                    };
                    let agent = world.pool.get_info_by_id(object_id).and_then(ObjectInfo::agent);
                    if let Some(value) = result {
                        match agent {
                            Some(agent) => agent.validate_execute_result(method, value, &validator)?,
                            None => validator.check_value(object_id, value, None)?,
                        }
                    }
                    if let Some(value) = error {
                        validator.check_value(object_id, value, None)?;
                    }
                }
                Message::Create { .. } | Message::Delete { .. } => {}
            }
        }
        Ok(())
    }

    fn apply_batch(&mut self, batch: &mut IncomingBatch, client: &ClientToken) -> Result<(), ObjectSyncError> {
        for object_id in batch.create_order() {
            // forward references may have materialized it already
            let Some(create) = batch.take_create(&object_id) else {
                continue;
            };
            let mut ctx = AgentContext::new(&mut self.world, Some(&mut *batch), Some(client.clone()));
            ctx.materialize(&object_id, create)?;
        }

        for message in batch.take_updates() {
            match message {
                Message::Change { object_id, data } => self.apply_change(&object_id, &data, batch, client)?,
                Message::Execute {
                    object_id,
                    invoke_id,
                    method,
                    parameters,
                } => {
                    let applied = self.world.with_agent(
                        &object_id,
                        Some(&mut *batch),
                        Some(client),
                        |agent, instance, ctx| agent.apply_execute(instance, invoke_id, &method, &parameters, ctx),
                    )?;
                    if applied.is_none() {
                        return Err(ObjectSyncError::UnknownObject { object_id });
                    }
                }
                Message::ExecuteFinished {
                    invoke_id,
                    result,
                    error,
                    ..
                } => self.apply_execute_finished(invoke_id, result, error, batch, client)?,
                Message::Create { .. } | Message::Delete { .. } => {}
            }
        }

        for message in batch.take_deletes() {
            if let Message::Delete { object_id } = message {
                self.apply_delete(object_id, client);
            }
        }
        Ok(())
    }

    fn apply_change(
        &mut self,
        object_id: &ObjectId,
        data: &JsonValue,
        batch: &mut IncomingBatch,
        client: &ClientToken,
    ) -> Result<(), ObjectSyncError> {
        let sender = self
            .world
            .pool
            .get_info_by_id(object_id)
            .and_then(|info| info.sender().cloned());
        if let Some(sender) = &sender {
            sender.set_muted(true);
        }
        let applied = self
            .world
            .with_agent(object_id, Some(batch), Some(client), |agent, instance, ctx| {
                agent.apply_change(instance, data, ctx)?;
                Ok(instance.clone())
            });
        if let Some(sender) = &sender {
            sender.set_muted(false);
        }
        let Some(instance) = applied? else {
            return Err(ObjectSyncError::UnknownObject {
                object_id: object_id.clone(),
            });
        };
        self.world.events.push(SyncEvent::Changed {
            object_id: object_id.clone(),
            instance,
            client: client.clone(),
        });
        Ok(())
    }

    fn apply_execute_finished(
        &mut self,
        invoke_id: InvokeId,
        result: Option<SerializedValue>,
        error: Option<SerializedValue>,
        batch: &mut IncomingBatch,
        client: &ClientToken,
    ) -> Result<(), ObjectSyncError> {
        if self.invocations.method_of(invoke_id, client).is_none() {
            debug!(
                "Ignoring result of unknown invocation {} from {}",
                invoke_id,
                client.identity()
            );
            return Ok(());
        }
        let outcome = {
            let mut ctx = AgentContext::new(&mut self.world, Some(batch), Some(client.clone()));
            match (result, error) {
                (_, Some(error)) => Err(InvokeError::Remote(ctx.resolve_value(&error)?.0)),
                (Some(result), None) => Ok(ctx.resolve_value(&result)?.0),
                (None, None) => Ok(Value::Null),
            }
        };
        self.invocations.resolve(invoke_id, client, outcome);
        Ok(())
    }

    /// Only objects a peer created can be deleted by it. Peers this engine
    /// forwarded the object to are sent a delete in turn.
    fn apply_delete(&mut self, object_id: ObjectId, client: &ClientToken) {
        let Some(info) = self.world.pool.get_info_by_id(&object_id) else {
            debug!("Ignoring delete of unknown object {}", object_id);
            return;
        };
        if info.is_owned() {
            warn!(
                "Ignoring delete of owned object {} from {}",
                object_id,
                client.identity()
            );
            return;
        }
        let forwarded: Vec<ClientToken> = info
            .agent()
            .map(|agent| {
                agent
                    .state()
                    .clients()
                    .filter(|known| *known != client)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let _ = self.world.with_agent(&object_id, None, None, |agent, instance, _| {
            agent.on_deleted(instance);
            Ok(())
        });
        let instance = self
            .world
            .remove_object(&object_id)
            .and_then(|mut info| info.clear_instance());
        for peer in forwarded {
            self.deferred_deletes
                .entry(peer)
                .or_default()
                .push(object_id.clone());
        }
        self.invocations.cancel_object(&object_id, "object deleted");
        debug!("Applied delete of object {}", object_id);
        self.world.events.push(SyncEvent::Deleted {
            object_id,
            instance,
            client: client.clone(),
        });
    }

    /// Holds taken while a batch was applied only last for that batch.
    fn release_own_holds(&mut self) {
        let own_token = self.world.own_token.clone();
        for object_id in self.world.pool.object_ids() {
            if let Some(info) = self.world.pool.get_info_by_id_mut(&object_id) {
                info.clear_references(Some(&own_token));
            }
        }
    }

    // Invocations

    /// Invokes `method` on every targeted peer that knows `instance`. Each
    /// result settles when that peer's reply arrives in a later batch.
    pub fn invoke(
        &mut self,
        instance: &Instance,
        method: &str,
        args: Vec<Value>,
        target: InvokeTarget,
    ) -> Result<Vec<InvokeResult>, InvokeError> {
        self.drain_mutations()?;
        for client in target.named() {
            self.check_peer(client)?;
        }
        let Some(object_id) = self.world.pool.object_id_of(instance).cloned() else {
            return Err(InvokeError::NotTracked);
        };
        let invoke_id = self.invocations.next_invoke_id();
        let peers = self.peers.clone();

        let targeted = self.world.with_agent(&object_id, None, None, |agent, instance, ctx| {
            let Some(tracked) = agent.outbound_method(method) else {
                return Ok(None);
            };
            if let Some(refused) = target.named().iter().find(|client| !tracked.tracks_for(client)) {
                warn!("{} may not receive {} on {}", refused.identity(), method, object_id);
                return Err(ObjectSyncError::NotAuthorized {
                    object_id: object_id.clone(),
                    member: method.to_string(),
                });
            }
            let mut targeted = Vec::new();
            for client in peers.iter().filter(|client| target.includes(client)) {
                if !agent.state().knows(client) || !tracked.tracks_for(client) {
                    continue;
                }
                let client_args = match &tracked.before_execute_on_client {
                    Some(hook) => match hook(instance, client, args.clone()) {
                        Some(rewritten) => rewritten,
                        None => continue,
                    },
                    None => args.clone(),
                };
                let mut parameters = Vec::with_capacity(client_args.len());
                for value in &client_args {
                    parameters.push(ctx.serialize_temporary(agent.state_mut(), value, client)?);
                }
                agent.state_mut().queue_outgoing(
                    client,
                    Message::Execute {
                        object_id: object_id.clone(),
                        invoke_id,
                        method: method.to_string(),
                        parameters,
                    },
                );
                targeted.push(client.clone());
            }
            Ok(Some(targeted))
        })?;

        let targeted = match targeted {
            None => return Err(InvokeError::NotTracked),
            Some(None) => {
                return Err(InvokeError::UnknownMethod {
                    method: method.to_string(),
                })
            }
            Some(Some(targeted)) => targeted,
        };
        debug!(
            "Invoking {} on {} for {} peers (invocation {})",
            method,
            object_id,
            targeted.len(),
            invoke_id
        );
        Ok(targeted
            .iter()
            .map(|client| self.invocations.register(invoke_id, client, &object_id, method))
            .collect())
    }

    pub fn pending_invocations(&self) -> usize {
        self.invocations.len()
    }

    // Transport

    /// Runs one full cycle over `send`: each peer's batch goes out, its
    /// response is applied, then the cycle is cleared.
    pub async fn exchange_messages<F, Fut>(&mut self, mut send: F) -> Result<(), ObjectSyncError>
    where
        F: FnMut(ClientToken, Vec<Message>) -> Fut,
        Fut: Future<Output = Result<Vec<Message>, ObjectSyncError>>,
    {
        for client in self.peers.clone() {
            let outgoing = self.get_messages(&client)?;
            let incoming = send(client.clone(), outgoing).await?;
            self.apply_messages(&client, incoming)?;
        }
        self.clear_states()
    }

    /// Like [`ObjectSyncCore::exchange_messages`] with one call for all
    /// peers.
    pub async fn exchange_messages_bulk<F, Fut>(&mut self, send_all: F) -> Result<(), ObjectSyncError>
    where
        F: FnOnce(HashMap<ClientToken, Vec<Message>>) -> Fut,
        Fut: Future<Output = Result<HashMap<ClientToken, Vec<Message>>, ObjectSyncError>>,
    {
        let outgoing = self.get_all_messages()?;
        let mut incoming = send_all(outgoing).await?;
        for client in self.peers.clone() {
            if let Some(messages) = incoming.remove(&client) {
                self.apply_messages(&client, messages)?;
            }
        }
        for client in incoming.keys() {
            warn!("Dropping response from unknown peer {}", client.identity());
        }
        self.clear_states()
    }

    // Events & lookups

    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.world.events)
    }

    pub fn object_id(&self, instance: &Instance) -> Option<ObjectId> {
        self.world.pool.object_id_of(instance).cloned()
    }

    pub fn instance_by_id(&self, object_id: &ObjectId) -> Option<Instance> {
        self.world.pool.get_object_by_id(object_id)
    }

    pub fn is_tracked(&self, instance: &Instance) -> bool {
        self.world.pool.object_id_of(instance).is_some()
    }

    pub fn is_root(&self, instance: &Instance) -> bool {
        self.world
            .pool
            .get_info_by_object(instance)
            .map_or(false, ObjectInfo::is_root)
    }

    /// Objects held strongly.
    pub fn tracked_count(&self) -> usize {
        self.world.pool.len()
    }

    /// Objects waiting in the weak pool for reclamation.
    pub fn weakly_held_count(&self) -> usize {
        self.world.weak_pool.len()
    }

    /// Peers that have received a create for `instance`.
    pub fn known_clients(&self, instance: &Instance) -> Vec<ClientToken> {
        self.world
            .pool
            .get_info_by_object(instance)
            .and_then(ObjectInfo::agent)
            .map(|agent| agent.state().clients().cloned().collect())
            .unwrap_or_default()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.world.registry
    }

    /// Id of a tracked instance, pulling it back from the weak pool if
    /// needed.
    fn tracked_id(&mut self, instance: &Instance) -> Result<ObjectId, ObjectSyncError> {
        if let Some(object_id) = self.world.pool.object_id_of(instance) {
            return Ok(object_id.clone());
        }
        match self.world.weak_pool.extract_by_instance(instance) {
            Some(info) => Ok(self.world.promote(info)),
            None => Err(ObjectSyncError::NotTracked),
        }
    }
}

impl Drop for ObjectSyncCore {
    fn drop(&mut self) {
        self.invocations.cancel_all("engine dropped");
        for info in self.world.pool.infos() {
            if let (Some(instance), Some(sender)) = (info.instance(), info.sender()) {
                instance.detach_observer(sender);
            }
        }
    }
}

/// Drops everything an agent keeps for `client`.
fn forget_client(agent: &mut dyn SyncAgent, client: &ClientToken, ctx: &mut AgentContext) {
    agent.release_client(client, ctx);
    for held in agent.state_mut().take_temporaries_for(client) {
        ctx.release(&held, Some(client));
    }
    agent.state_mut().remove_client(client);
}

fn validation_agent<'v>(
    world: &'v ObjectWorld,
    fresh: &'v HashMap<ObjectId, Box<dyn SyncAgent>>,
    object_id: &ObjectId,
) -> Result<&'v dyn SyncAgent, ObjectSyncError> {
    if let Some(agent) = world.pool.get_info_by_id(object_id).and_then(ObjectInfo::agent) {
        return Ok(agent);
    }
    fresh
        .get(object_id)
        .map(|agent| agent.as_ref())
        .ok_or_else(|| ObjectSyncError::UnknownObject {
            object_id: object_id.clone(),
        })
}
