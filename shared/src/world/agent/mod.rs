use std::{
    any::Any,
    collections::{HashMap, HashSet},
    task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    messages::{Message, MessageError, SerializedValue},
    value::Mutation,
    world::{
        descriptor::TrackedMethod,
        engine::BatchValidator,
        ObjectSyncError,
    },
    ClientFilter, ClientToken, Instance, InvokeId, ObjectId,
};

mod array_agent;
mod change_set;
mod context;
mod error;
mod error_agent;
mod map_agent;
mod object_agent;
mod provider;
mod reference_tracker;
mod set_agent;
mod simple_agent;

pub use array_agent::ArrayAgent;
pub use change_set::{changes_for, CollectionChange, MapChanges, OriginChange, SpliceLog};
pub use context::AgentContext;
pub use error::RegistryError;
pub use error_agent::ErrorAgent;
pub use map_agent::MapAgent;
pub use object_agent::ObjectAgent;
pub use provider::{agent_factory, AgentFactory, AgentRequest, ProviderOptions, ProviderRegistry};
pub use reference_tracker::ReferenceTracker;
pub use set_agent::SetAgent;
pub use simple_agent::SimpleValueAgent;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChangeSetMode {
    /// Diff the last sent snapshot against the live collection
    #[default]
    CompareStates,
    /// Record every mutation as it happens
    TrackSplices,
}

/// Reads an agent payload into its typed shape.
pub(crate) fn decode_data<T: DeserializeOwned>(
    object_id: &ObjectId,
    data: &JsonValue,
) -> Result<T, ObjectSyncError> {
    T::deserialize(data).map_err(|error| ObjectSyncError::invalid_data(object_id, error.to_string()))
}

pub(crate) fn encode_data<T: Serialize>(data: &T) -> Result<JsonValue, ObjectSyncError> {
    serde_json::to_value(data).map_err(|error| ObjectSyncError::Message(MessageError::from(error)))
}

/// Polls a method body once without a runtime. Bodies still pending are
/// polled again on the next generation pass.
pub(crate) fn poll_once<T>(future: &mut BoxFuture<'static, T>) -> Poll<T> {
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    future.poll_unpin(&mut cx)
}

/// What the engine asks of an agent for one peer.
pub struct GenerationRequest<'a> {
    pub client: &'a ClientToken,
    pub is_new_client: bool,
    pub is_root: bool,
}

/// State every agent carries: which peers know the object, who may see it,
/// and what is waiting to be flushed.
pub struct AgentState {
    object_id: ObjectId,
    clients: HashSet<ClientToken>,
    client_filter: Option<ClientFilter>,
    has_pending_changes: bool,
    flushed: HashSet<ClientToken>,
    outgoing: HashMap<ClientToken, Vec<Message>>,
    temporaries: HashMap<ClientToken, Vec<ObjectId>>,
}

impl AgentState {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            clients: HashSet::new(),
            client_filter: None,
            has_pending_changes: false,
            flushed: HashSet::new(),
            outgoing: HashMap::new(),
            temporaries: HashMap::new(),
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientToken> {
        self.clients.iter()
    }

    pub fn knows(&self, client: &ClientToken) -> bool {
        self.clients.contains(client)
    }

    pub fn add_client(&mut self, client: &ClientToken) {
        self.clients.insert(client.clone());
    }

    pub fn remove_client(&mut self, client: &ClientToken) {
        self.clients.remove(client);
        self.flushed.remove(client);
        self.outgoing.remove(client);
    }

    pub fn client_filter(&self) -> Option<&ClientFilter> {
        self.client_filter.as_ref()
    }

    pub fn set_client_filter(&mut self, filter: Option<ClientFilter>) {
        self.client_filter = filter;
    }

    pub fn is_visible_to(&self, client: &ClientToken) -> bool {
        self.client_filter
            .as_ref()
            .map_or(true, |filter| filter.allows(client))
    }

    pub fn has_pending_changes(&self) -> bool {
        self.has_pending_changes
    }

    pub fn mark_pending(&mut self) {
        self.has_pending_changes = true;
    }

    pub fn queue_outgoing(&mut self, client: &ClientToken, message: Message) {
        self.outgoing.entry(client.clone()).or_default().push(message);
    }

    pub fn take_outgoing(&mut self, client: &ClientToken) -> Vec<Message> {
        self.outgoing.remove(client).unwrap_or_default()
    }

    pub fn has_outgoing(&self) -> bool {
        self.outgoing.values().any(|messages| !messages.is_empty())
    }

    pub fn has_outgoing_for(&self, client: &ClientToken) -> bool {
        self.outgoing
            .get(client)
            .map_or(false, |messages| !messages.is_empty())
    }

    /// Records a reference held for `client` only until the end of the cycle.
    pub fn hold_temporary(&mut self, client: &ClientToken, object_id: ObjectId) {
        self.temporaries
            .entry(client.clone())
            .or_default()
            .push(object_id);
    }

    pub fn take_temporaries(&mut self) -> Vec<(ClientToken, ObjectId)> {
        self.temporaries
            .drain()
            .flat_map(|(client, ids)| ids.into_iter().map(move |id| (client.clone(), id)))
            .collect()
    }

    pub fn take_temporaries_for(&mut self, client: &ClientToken) -> Vec<ObjectId> {
        self.temporaries.remove(client).unwrap_or_default()
    }

    pub fn mark_flushed(&mut self, client: &ClientToken) {
        self.flushed.insert(client.clone());
    }

    /// A known peer still has something to receive this cycle.
    pub fn needs_generation(&self, client: &ClientToken) -> bool {
        (self.has_pending_changes && !self.flushed.contains(client)) || self.has_outgoing_for(client)
    }

    /// Ends a cycle. `still_pending` carries changes recorded after this
    /// cycle's messages were generated.
    pub fn end_cycle(&mut self, still_pending: bool) {
        self.flushed.clear();
        self.has_pending_changes = still_pending;
    }
}

/// Per-object unit that diffs, serializes and applies one tracked instance.
pub trait SyncAgent: Send {
    fn state(&self) -> &AgentState;
    fn state_mut(&mut self) -> &mut AgentState;
    /// Type id announced in create messages
    fn type_id(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    // Configuration

    fn change_set_mode(&self) -> Option<ChangeSetMode> {
        None
    }

    fn set_change_set_mode(&mut self, _mode: ChangeSetMode) -> Result<(), ObjectSyncError> {
        Err(ObjectSyncError::ChangeSetModeUnsupported {
            object_id: self.state().object_id().clone(),
            reason: format!("{} has no change set modes", SyncAgent::type_id(self)),
        })
    }

    /// Feeds an explicit change for a collection nothing can observe.
    fn report_mutation(
        &mut self,
        _instance: &Instance,
        _mutation: Mutation,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        Err(ObjectSyncError::ChangeSetModeUnsupported {
            object_id: self.state().object_id().clone(),
            reason: format!("{} does not accept reported changes", SyncAgent::type_id(self)),
        })
    }

    fn set_allowed_types_from_sender(&mut self, _types: Option<Vec<String>>) {}

    /// Method metadata used when this process invokes `method` on peers.
    fn outbound_method(&self, _method: &str) -> Option<TrackedMethod> {
        None
    }

    // Outgoing

    fn on_mutation(
        &mut self,
        instance: &Instance,
        mutation: Mutation,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError>;

    fn generate_messages(
        &mut self,
        instance: &Instance,
        request: &GenerationRequest,
        ctx: &mut AgentContext,
    ) -> Result<Vec<Message>, ObjectSyncError>;

    /// Ends a cycle: refreshes snapshots and per-cycle bookkeeping.
    fn clear_states(&mut self, instance: &Instance, ctx: &mut AgentContext) -> Result<(), ObjectSyncError>;

    /// Drives awaited method bodies, queueing replies that settled.
    fn poll_invocations(&mut self, _instance: &Instance, _ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        Ok(())
    }

    // Incoming

    fn validate_create(
        &self,
        data: &JsonValue,
        origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError>;

    fn validate_change(
        &self,
        data: &JsonValue,
        origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError>;

    fn validate_execute(
        &self,
        _method: &str,
        _parameters: &[SerializedValue],
        _origin: &ClientToken,
        _validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        Ok(())
    }

    fn validate_execute_result(
        &self,
        _method: &str,
        _value: &SerializedValue,
        _validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        Ok(())
    }

    /// Builds the instance from a create payload. Only constructor inputs may
    /// be resolved here; the engine registers the instance before
    /// [`SyncAgent::apply_create_data`] runs so cycles can resolve.
    fn construct(&mut self, data: &JsonValue, ctx: &mut AgentContext) -> Result<Instance, ObjectSyncError>;

    fn apply_create_data(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError>;

    fn apply_change(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError>;

    fn apply_execute(
        &mut self,
        _instance: &Instance,
        invoke_id: InvokeId,
        method: &str,
        _parameters: &[SerializedValue],
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let origin = ctx.require_origin()?;
        let error = AgentContext::not_authorized_error(self.state().object_id(), method);
        let reply = ctx.execute_finished(self.state_mut(), invoke_id, Err(error), &origin)?;
        self.state_mut().queue_outgoing(&origin, reply);
        Ok(())
    }

    // Teardown

    /// Drops every reference and per-peer state held for `client`.
    fn release_client(&mut self, client: &ClientToken, ctx: &mut AgentContext);

    /// Drops everything before the object leaves the pool.
    fn release_all(&mut self, ctx: &mut AgentContext);

    /// The object was deleted by its owner.
    fn on_deleted(&mut self, _instance: &Instance) {}
}
