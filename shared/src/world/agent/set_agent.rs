use std::any::Any;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    messages::{Message, SerializedValue},
    value::Mutation,
    world::{engine::BatchValidator, ObjectSyncError},
    ClientToken, Instance, ObjectId, Value,
};

use super::{
    changes_for, decode_data, encode_data, AgentContext, AgentState, ChangeSetMode,
    CollectionChange, GenerationRequest, MapChanges, OriginChange, ReferenceTracker, SyncAgent,
};

#[derive(Serialize, Deserialize)]
struct SetCreateData {
    values: Vec<SerializedValue>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum SetChangeEntry {
    Add { value: SerializedValue },
    Delete { value: SerializedValue },
    Clear,
}

#[derive(Serialize, Deserialize)]
struct SetChangeData {
    changes: Vec<SetChangeEntry>,
}

struct SetCycle {
    values: Vec<Value>,
    changes: Vec<OriginChange>,
}

fn diff_values(before: &[Value], after: &[Value]) -> Vec<CollectionChange> {
    if after.is_empty() {
        if before.is_empty() {
            return Vec::new();
        }
        return vec![CollectionChange::Clear];
    }
    let deletes = before
        .iter()
        .filter(|value| !after.contains(value))
        .map(|value| CollectionChange::Delete { key: value.clone() });
    let adds = after
        .iter()
        .filter(|value| !before.contains(value))
        .map(|value| CollectionChange::Add {
            value: value.clone(),
        });
    deletes.chain(adds).collect()
}

fn apply_to_values(values: &mut Vec<Value>, change: &CollectionChange) {
    match change {
        CollectionChange::Add { value } | CollectionChange::Set { key: value, .. } => {
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
        CollectionChange::Delete { key } => values.retain(|existing| existing != key),
        CollectionChange::Clear => values.clear(),
    }
}

/// Syncs a set as discrete add/delete/clear changes.
pub struct SetAgent {
    state: AgentState,
    observable: bool,
    mode: ChangeSetMode,
    manual_reporting: bool,
    resync: bool,
    snapshot: Vec<Value>,
    pending: MapChanges,
    cycle: Option<SetCycle>,
    changed_since_capture: bool,
    references: ReferenceTracker<Value>,
    allowed_types: Option<Vec<String>>,
}

impl SetAgent {
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
            pending: MapChanges::new(),
            cycle: None,
            changed_since_capture: false,
            references: ReferenceTracker::new(),
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
        let values = instance.set_values();
        let mut base = None;
        if self.mode == ChangeSetMode::CompareStates || self.resync {
            let mut replayed = self.snapshot.clone();
            for change in self.pending.changes() {
                apply_to_values(&mut replayed, change);
            }
            base = Some(replayed);
        }
        let mut changes = self.pending.take();
        if let Some(base) = base {
            changes.extend(diff_values(&base, &values).into_iter().map(|change| (None, change)));
        }
        self.resync = false;
        self.changed_since_capture = false;
        self.cycle = Some(SetCycle { values, changes });
    }

    fn record(&mut self, change: CollectionChange) {
        if self.mode == ChangeSetMode::TrackSplices {
            self.pending.record(change, false);
        }
        self.changed_since_capture = true;
        self.state.mark_pending();
    }

    fn serialize_member(
        &mut self,
        value: &Value,
        client: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<SerializedValue, ObjectSyncError> {
        let (serialized, held) = ctx.serialize_value(value, client)?;
        self.references
            .store(value.clone(), client, held.into_iter().collect(), ctx);
        Ok(serialized)
    }

    fn resolve_member(
        &mut self,
        serialized: &SerializedValue,
        origin: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<Value, ObjectSyncError> {
        let (value, held) = ctx.resolve_value(serialized)?;
        if let Some(object_id) = &held {
            ctx.hold(object_id, Some(origin));
        }
        self.references
            .store(value.clone(), origin, held.into_iter().collect(), ctx);
        Ok(value)
    }
}

impl SyncAgent for SetAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    fn type_id(&self) -> &str {
        "Set"
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
                reason: "a plain set cannot record changes; report them or use an observable set"
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
                reason: "observable sets record their own changes".to_string(),
            });
        }
        let change = match mutation {
            Mutation::SetAdd { value } => CollectionChange::Add { value },
            Mutation::SetDelete { value } => CollectionChange::Delete { key: value },
            Mutation::Clear => CollectionChange::Clear,
            _ => {
                return Err(ObjectSyncError::invalid_data(
                    self.object_id(),
                    "sets only accept reported add, delete and clear changes",
                ))
            }
        };
        self.manual_reporting = true;
        self.record(change);
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
            Mutation::SetAdd { value } => self.record(CollectionChange::Add { value }),
            Mutation::SetDelete { value } => self.record(CollectionChange::Delete { key: value }),
            Mutation::Clear => self.record(CollectionChange::Clear),
            Mutation::Touched => {
                if self.mode == ChangeSetMode::TrackSplices && !self.manual_reporting {
                    warn!(
                        "Untracked write on set {}; switching to state comparison",
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
            let values = cycle.values.clone();
            self.references.release_client(client, ctx);
            let mut serialized = Vec::with_capacity(values.len());
            for value in &values {
                serialized.push(self.serialize_member(value, client, ctx)?);
            }
            return Ok(vec![Message::Create {
                object_id: self.object_id().clone(),
                type_id: "Set".to_string(),
                data: encode_data(&SetCreateData { values: serialized })?,
                is_root: request.is_root,
            }]);
        }

        let changes = changes_for(&cycle.changes, client);
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut outgoing = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                CollectionChange::Add { value } | CollectionChange::Set { key: value, .. } => {
                    let serialized = self.serialize_member(&value, client, ctx)?;
                    outgoing.push(SetChangeEntry::Add { value: serialized });
                }
                CollectionChange::Delete { key } => {
                    let serialized = ctx.serialize_known(&key, client);
                    self.references.store(key, client, Vec::new(), ctx);
                    match serialized {
                        Some(value) => outgoing.push(SetChangeEntry::Delete { value }),
                        None => debug!(
                            "Dropping delete on set {} for a value {} never received",
                            self.object_id(),
                            client.identity()
                        ),
                    }
                }
                CollectionChange::Clear => {
                    self.references.release_client(client, ctx);
                    outgoing.push(SetChangeEntry::Clear);
                }
            }
        }
        if outgoing.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Message::Change {
            object_id: self.object_id().clone(),
            data: encode_data(&SetChangeData { changes: outgoing })?,
        }])
    }

    fn clear_states(&mut self, instance: &Instance, _ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        let still_pending = match self.cycle.take() {
            Some(cycle) => {
                self.snapshot = cycle.values;
                self.changed_since_capture
            }
            None => self.state.has_pending_changes(),
        };
        if self.state.clients().next().is_none() {
            self.snapshot = instance.set_values();
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
        let create: SetCreateData = decode_data(self.object_id(), data)?;
        for value in &create.values {
            validator.check_value(self.object_id(), value, self.allowed_types.as_deref())?;
        }
        Ok(())
    }

    fn validate_change(
        &self,
        data: &JsonValue,
        _origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let change: SetChangeData = decode_data(self.object_id(), data)?;
        for entry in &change.changes {
            match entry {
                SetChangeEntry::Add { value } => {
                    validator.check_value(self.object_id(), value, self.allowed_types.as_deref())?
                }
                SetChangeEntry::Delete { value } => validator.check_value(self.object_id(), value, None)?,
                SetChangeEntry::Clear => {}
            }
        }
        Ok(())
    }

    fn construct(&mut self, data: &JsonValue, _ctx: &mut AgentContext) -> Result<Instance, ObjectSyncError> {
        let _: SetCreateData = decode_data(self.object_id(), data)?;
        Ok(Instance::new_observable_set(Vec::new()))
    }

    fn apply_create_data(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let create: SetCreateData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        for serialized in &create.values {
            let value = self.resolve_member(serialized, &origin, ctx)?;
            instance.set_add(value);
        }
        self.snapshot = instance.set_values();
        Ok(())
    }

    fn apply_change(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let change: SetChangeData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        for entry in &change.changes {
            let relayed = match entry {
                SetChangeEntry::Add { value } => {
                    let value = self.resolve_member(value, &origin, ctx)?;
                    instance.set_add(value.clone());
                    CollectionChange::Add { value }
                }
                SetChangeEntry::Delete { value } => {
                    let (value, _) = ctx.resolve_value(value)?;
                    instance.set_delete(&value);
                    self.references.store(value.clone(), &origin, Vec::new(), ctx);
                    CollectionChange::Delete { key: value }
                }
                SetChangeEntry::Clear => {
                    instance.clear();
                    self.references.release_client(&origin, ctx);
                    CollectionChange::Clear
                }
            };
            self.pending.relay(&origin, relayed);
        }
        self.changed_since_capture = true;
        self.state.mark_pending();
        Ok(())
    }

    fn release_client(&mut self, client: &ClientToken, ctx: &mut AgentContext) {
        self.references.release_client(client, ctx);
    }

    fn release_all(&mut self, ctx: &mut AgentContext) {
        self.references.release_all(ctx);
    }
}
