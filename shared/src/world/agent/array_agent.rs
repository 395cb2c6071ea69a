use std::{any::Any, collections::HashMap};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    messages::{Message, SerializedValue},
    value::Mutation,
    world::{
        diff::{compute_splices, SpliceInstruction},
        engine::BatchValidator,
        ObjectSyncError,
    },
    ClientToken, Instance, ObjectId, Value,
};

use super::{
    decode_data, encode_data, AgentContext, AgentState, ChangeSetMode, GenerationRequest, SpliceLog,
    SyncAgent,
};

#[derive(Serialize, Deserialize)]
struct ArrayCreateData {
    items: Vec<SerializedValue>,
}

#[derive(Serialize, Deserialize)]
struct ArrayChangeData {
    splices: Vec<SpliceInstruction<SerializedValue>>,
}

struct ArrayCycle {
    items: Vec<Value>,
    log: SpliceLog,
}

/// Syncs an array as splices against the last state every peer holds.
pub struct ArrayAgent {
    state: AgentState,
    observable: bool,
    mode: ChangeSetMode,
    manual_reporting: bool,
    /// Switched into splice tracking: the first capture diffs instead
    resync: bool,
    snapshot: Vec<Value>,
    /// Local splices while tracking, and every splice relayed from a peer
    pending: SpliceLog,
    cycle: Option<ArrayCycle>,
    changed_since_capture: bool,
    /// Per peer, the object held at each index of its copy
    mirrors: HashMap<ClientToken, Vec<Option<ObjectId>>>,
    allowed_types: Option<Vec<String>>,
}

impl ArrayAgent {
    pub fn new(object_id: ObjectId, observable: bool) -> Self {
        Self {
            state: AgentState::new(object_id),
            observable,
            mode: if observable {
                ChangeSetMode::TrackSplices
            } else {
                ChangeSetMode::CompareStates
            },
            manual_reporting: false,
            resync: false,
            snapshot: Vec::new(),
            pending: SpliceLog::new(),
            cycle: None,
            changed_since_capture: false,
            mirrors: HashMap::new(),
            allowed_types: None,
        }
    }

    fn object_id(&self) -> &ObjectId {
        self.state.object_id()
    }

    fn capture(&mut self, instance: &Instance) {
        if self.cycle.is_some() {
            return;
        }
        let items = instance.items();
        let mut log = self.pending.take();
        if self.mode == ChangeSetMode::CompareStates || self.resync {
            let mut base = self.snapshot.clone();
            log.apply_to(&mut base);
            for splice in compute_splices(&base, &items) {
                log.push(None, splice);
            }
        }
        self.resync = false;
        self.changed_since_capture = false;
        self.cycle = Some(ArrayCycle { items, log });
    }

    fn record(&mut self, splice: SpliceInstruction<Value>) {
        if self.mode == ChangeSetMode::TrackSplices {
            self.pending.push(None, splice);
        }
        self.changed_since_capture = true;
        self.state.mark_pending();
    }

    fn serialize_items(
        &self,
        items: &[Value],
        client: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<(Vec<SerializedValue>, Vec<Option<ObjectId>>), ObjectSyncError> {
        let mut serialized = Vec::with_capacity(items.len());
        let mut held = Vec::with_capacity(items.len());
        for item in items {
            let (value, object_id) = ctx.serialize_value(item, client)?;
            serialized.push(value);
            held.push(object_id);
        }
        Ok((serialized, held))
    }

    /// Applies one splice to a peer's mirror, releasing what it removed.
    fn splice_mirror(
        &mut self,
        client: &ClientToken,
        start: usize,
        delete_count: usize,
        held: Vec<Option<ObjectId>>,
        ctx: &mut AgentContext,
    ) {
        let mirror = self.mirrors.entry(client.clone()).or_default();
        let start = start.min(mirror.len());
        let end = start.saturating_add(delete_count).min(mirror.len());
        let removed: Vec<ObjectId> = mirror.splice(start..end, held).flatten().collect();
        ctx.release_all(&removed, Some(client));
    }

    fn release_mirror(&mut self, client: &ClientToken, ctx: &mut AgentContext) {
        if let Some(mirror) = self.mirrors.remove(client) {
            ctx.release_all(mirror.iter().flatten(), Some(client));
        }
    }

    fn check_items<'i>(
        &self,
        items: impl IntoIterator<Item = &'i SerializedValue>,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        for item in items {
            validator.check_value(self.object_id(), item, self.allowed_types.as_deref())?;
        }
        Ok(())
    }

    fn resolve_items(
        &self,
        items: &[SerializedValue],
        origin: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<(Vec<Value>, Vec<Option<ObjectId>>), ObjectSyncError> {
        let mut values = Vec::with_capacity(items.len());
        let mut held = Vec::with_capacity(items.len());
        for item in items {
            let (value, object_id) = ctx.resolve_value(item)?;
            if let Some(object_id) = &object_id {
                ctx.hold(object_id, Some(origin));
            }
            values.push(value);
            held.push(object_id);
        }
        Ok((values, held))
    }
}

impl SyncAgent for ArrayAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    fn type_id(&self) -> &str {
        "Array"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn change_set_mode(&self) -> Option<ChangeSetMode> {
        Some(self.mode)
    }

    fn set_change_set_mode(&mut self, mode: ChangeSetMode) -> Result<(), ObjectSyncError> {
        if mode == self.mode {
            return Ok(());
        }
        if mode == ChangeSetMode::TrackSplices && !self.observable && !self.manual_reporting {
            return Err(ObjectSyncError::ChangeSetModeUnsupported {
                object_id: self.object_id().clone(),
                reason: "a plain array cannot record splices; report them or use an observable array"
                    .to_string(),
            });
        }
        self.mode = mode;
        self.resync = mode == ChangeSetMode::TrackSplices;
        Ok(())
    }

    fn report_mutation(
        &mut self,
        _instance: &Instance,
        mutation: Mutation,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        if self.observable {
            return Err(ObjectSyncError::ChangeSetModeUnsupported {
                object_id: self.object_id().clone(),
                reason: "observable arrays record their own splices".to_string(),
            });
        }
        let Mutation::Splice(splice) = mutation else {
            return Err(ObjectSyncError::invalid_data(
                self.object_id(),
                "arrays only accept reported splices",
            ));
        };
        self.manual_reporting = true;
        self.record(splice);
        Ok(())
    }

    fn set_allowed_types_from_sender(&mut self, types: Option<Vec<String>>) {
        self.allowed_types = types;
    }

    fn on_mutation(
        &mut self,
        _instance: &Instance,
        mutation: Mutation,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        match mutation {
            Mutation::Splice(splice) => self.record(splice),
            Mutation::Touched => {
                if self.mode == ChangeSetMode::TrackSplices && !self.manual_reporting {
                    warn!(
                        "Raw write on array {} while tracking splices; switching to state comparison",
                        self.object_id()
                    );
                    self.mode = ChangeSetMode::CompareStates;
                }
                self.changed_since_capture = true;
                self.state.mark_pending();
            }
            _ => {}
        }
        Ok(())
    }

    fn generate_messages(
        &mut self,
        instance: &Instance,
        request: &GenerationRequest,
        ctx: &mut AgentContext,
    ) -> Result<Vec<Message>, ObjectSyncError> {
        let client = request.client;
        self.capture(instance);
        let Some(cycle) = &self.cycle else {
            return Ok(Vec::new());
        };
        if request.is_new_client {
            let items = cycle.items.clone();
            self.release_mirror(client, ctx);
            let (serialized, held) = self.serialize_items(&items, client, ctx)?;
            self.mirrors.insert(client.clone(), held);
            return Ok(vec![Message::Create {
                object_id: self.object_id().clone(),
                type_id: "Array".to_string(),
                data: encode_data(&ArrayCreateData { items: serialized })?,
                is_root: request.is_root,
            }]);
        }

        let splices = match cycle.log.splices_for(client) {
            Some(splices) => splices,
            None => {
                let copy_len = self.mirrors.get(client).map_or(0, Vec::len);
                debug!(
                    "Edits from {} on array {} were interleaved with others; replacing its copy",
                    client.identity(),
                    self.object_id()
                );
                vec![SpliceInstruction::new(0, copy_len, cycle.items.clone())]
            }
        };
        if splices.is_empty() {
            return Ok(Vec::new());
        }
        let mut outgoing = Vec::with_capacity(splices.len());
        for splice in splices {
            let (serialized, held) = self.serialize_items(&splice.items, client, ctx)?;
            self.splice_mirror(client, splice.start, splice.delete_count, held, ctx);
            outgoing.push(SpliceInstruction::new(splice.start, splice.delete_count, serialized));
        }
        Ok(vec![Message::Change {
            object_id: self.object_id().clone(),
            data: encode_data(&ArrayChangeData { splices: outgoing })?,
        }])
    }

    fn clear_states(&mut self, instance: &Instance, _ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        let still_pending = match self.cycle.take() {
            Some(cycle) => {
                self.snapshot = cycle.items;
                self.changed_since_capture
            }
            None => self.state.has_pending_changes(),
        };
        if self.state.clients().next().is_none() {
            self.snapshot = instance.items();
            self.pending.clear();
            self.state.end_cycle(false);
            return Ok(());
        }
        self.state.end_cycle(still_pending);
        Ok(())
    }

    fn validate_create(
        &self,
        data: &JsonValue,
        _origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let create: ArrayCreateData = decode_data(self.object_id(), data)?;
        self.check_items(&create.items, validator)
    }

    fn validate_change(
        &self,
        data: &JsonValue,
        _origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let change: ArrayChangeData = decode_data(self.object_id(), data)?;
        self.check_items(change.splices.iter().flat_map(|splice| splice.items.iter()), validator)
    }

    fn construct(&mut self, data: &JsonValue, _ctx: &mut AgentContext) -> Result<Instance, ObjectSyncError> {
        let _: ArrayCreateData = decode_data(self.object_id(), data)?;
        Ok(Instance::new_observable_array(Vec::new()))
    }

    fn apply_create_data(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let create: ArrayCreateData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        let (values, held) = self.resolve_items(&create.items, &origin, ctx)?;
        instance.splice(0, instance.len(), values.clone());
        self.snapshot = values;
        self.release_mirror(&origin, ctx);
        self.mirrors.insert(origin, held);
        Ok(())
    }

    fn apply_change(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let change: ArrayChangeData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        for splice in change.splices {
            let (values, held) = self.resolve_items(&splice.items, &origin, ctx)?;
            let start = splice.start.min(instance.len());
            let removed = instance.splice(start, splice.delete_count, values.clone());
            self.splice_mirror(&origin, splice.start, splice.delete_count, held, ctx);
            // relayed to every other peer on the next generation
            self.pending
                .push(Some(&origin), SpliceInstruction::new(start, removed.len(), values));
        }
        self.changed_since_capture = true;
        self.state.mark_pending();
        Ok(())
    }

    fn release_client(&mut self, client: &ClientToken, ctx: &mut AgentContext) {
        self.release_mirror(client, ctx);
    }

    fn release_all(&mut self, ctx: &mut AgentContext) {
        let clients: Vec<ClientToken> = self.mirrors.keys().cloned().collect();
        for client in clients {
            self.release_mirror(&client, ctx);
        }
    }
}
