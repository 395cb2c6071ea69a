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
struct MapCreateData {
    entries: Vec<(SerializedValue, SerializedValue)>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum MapChangeEntry {
    Set {
        key: SerializedValue,
        value: SerializedValue,
    },
    Delete {
        key: SerializedValue,
    },
    Clear,
}

#[derive(Serialize, Deserialize)]
struct MapChangeData {
    changes: Vec<MapChangeEntry>,
}

struct MapCycle {
    entries: Vec<(Value, Value)>,
    changes: Vec<OriginChange>,
}

/// Changes turning `before` into `after`, deletes first.
pub(crate) fn diff_entries(before: &[(Value, Value)], after: &[(Value, Value)]) -> Vec<CollectionChange> {
    if after.is_empty() {
        if before.is_empty() {
            return Vec::new();
        }
        return vec![CollectionChange::Clear];
    }
    let mut changes = Vec::new();
    for (key, _) in before {
        if !after.iter().any(|(existing, _)| existing == key) {
            changes.push(CollectionChange::Delete { key: key.clone() });
        }
    }
    for (key, value) in after {
        let unchanged = before
            .iter()
            .any(|(existing, previous)| existing == key && previous == value);
        if !unchanged {
            changes.push(CollectionChange::Set {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    changes
}

fn apply_to_entries(entries: &mut Vec<(Value, Value)>, change: &CollectionChange) {
    match change {
        CollectionChange::Set { key, value } => {
            match entries.iter_mut().find(|(existing, _)| existing == key) {
                Some(slot) => slot.1 = value.clone(),
                None => entries.push((key.clone(), value.clone())),
            }
        }
        CollectionChange::Delete { key } => entries.retain(|(existing, _)| existing != key),
        CollectionChange::Clear => entries.clear(),
        CollectionChange::Add { .. } => {}
    }
}

/// Syncs a map as discrete set/delete/clear changes.
pub struct MapAgent {
    state: AgentState,
    observable: bool,
    mode: ChangeSetMode,
    manual_reporting: bool,
    resync: bool,
    snapshot: Vec<(Value, Value)>,
    pending: MapChanges,
    cycle: Option<MapCycle>,
    changed_since_capture: bool,
    /// Objects each peer's copy holds, by map key
    references: ReferenceTracker<Value>,
    allowed_key_types: Option<Vec<String>>,
    allowed_value_types: Option<Vec<String>>,
}

impl MapAgent {
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
            allowed_key_types: None,
            allowed_value_types: None,
        }
    }

    pub fn set_allowed_key_types(&mut self, types: Option<Vec<String>>) {
        self.allowed_key_types = types;
    }

    pub fn set_allowed_value_types(&mut self, types: Option<Vec<String>>) {
        self.allowed_value_types = types;
    }

    fn object_id(&self) -> &ObjectId {
        self.state.object_id()
    }

    fn capture(&mut self, instance: &Instance) {
        if self.cycle.is_some() {
            return;
        }
        let entries = instance.map_entries();
        let mut base = None;
        if self.mode == ChangeSetMode::CompareStates || self.resync {
            let mut replayed = self.snapshot.clone();
            for change in self.pending.changes() {
                apply_to_entries(&mut replayed, change);
            }
            base = Some(replayed);
        }
        let mut changes = self.pending.take();
        if let Some(base) = base {
            changes.extend(diff_entries(&base, &entries).into_iter().map(|change| (None, change)));
        }
        self.resync = false;
        self.changed_since_capture = false;
        self.cycle = Some(MapCycle { entries, changes });
    }

    fn record(&mut self, change: CollectionChange, previously_present: bool) {
        if self.mode == ChangeSetMode::TrackSplices {
            self.pending.record(change, previously_present);
        }
        self.changed_since_capture = true;
        self.state.mark_pending();
    }

    /// Serializes one entry for `client` and makes it what `key` holds.
    fn serialize_entry(
        &mut self,
        key: &Value,
        value: &Value,
        client: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<(SerializedValue, SerializedValue), ObjectSyncError> {
        let (serialized_key, key_held) = ctx.serialize_value(key, client)?;
        let (serialized_value, value_held) = ctx.serialize_value(value, client)?;
        let held = key_held.into_iter().chain(value_held).collect();
        self.references.store(key.clone(), client, held, ctx);
        Ok((serialized_key, serialized_value))
    }

    fn resolve_entry(
        &mut self,
        key: &SerializedValue,
        value: &SerializedValue,
        origin: &ClientToken,
        ctx: &mut AgentContext,
    ) -> Result<(Value, Value), ObjectSyncError> {
        let (key, key_held) = ctx.resolve_value(key)?;
        let (value, value_held) = ctx.resolve_value(value)?;
        let held: Vec<ObjectId> = key_held.into_iter().chain(value_held).collect();
        for object_id in &held {
            ctx.hold(object_id, Some(origin));
        }
        self.references.store(key.clone(), origin, held, ctx);
        Ok((key, value))
    }

    fn check_entry(
        &self,
        key: &SerializedValue,
        value: Option<&SerializedValue>,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        validator.check_value(self.object_id(), key, self.allowed_key_types.as_deref())?;
        if let Some(value) = value {
            validator.check_value(self.object_id(), value, self.allowed_value_types.as_deref())?;
        }
        Ok(())
    }
}

impl SyncAgent for MapAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    fn type_id(&self) -> &str {
        "Map"
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
                reason: "a plain map cannot record changes; report them or use an observable map"
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
                reason: "observable maps record their own changes".to_string(),
            });
        }
        let (change, previously_present) = match mutation {
            Mutation::MapSet {
                key,
                value,
                previously_present,
            } => (CollectionChange::Set { key, value }, previously_present),
            Mutation::MapDelete { key } => (CollectionChange::Delete { key }, true),
            Mutation::Clear => (CollectionChange::Clear, false),
            _ => {
                return Err(ObjectSyncError::invalid_data(
                    self.object_id(),
                    "maps only accept reported set, delete and clear changes",
                ))
            }
        };
        self.manual_reporting = true;
        self.record(change, previously_present);
        Ok(())
    }

    fn set_allowed_types_from_sender(&mut self, types: Option<Vec<String>>) {
        self.allowed_key_types = types.clone();
        self.allowed_value_types = types;
    }

    fn on_mutation(
        &mut self,
        _instance: &Instance,
        mutation: Mutation,
        _ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        match mutation {
            Mutation::MapSet {
                key,
                value,
                previously_present,
            } => self.record(CollectionChange::Set { key, value }, previously_present),
            Mutation::MapDelete { key } => self.record(CollectionChange::Delete { key }, true),
            Mutation::Clear => self.record(CollectionChange::Clear, false),
            Mutation::Touched => {
                if self.mode == ChangeSetMode::TrackSplices && !self.manual_reporting {
                    warn!(
                        "Untracked write on map {}; switching to state comparison",
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
            let entries = cycle.entries.clone();
            self.references.release_client(client, ctx);
            let mut serialized = Vec::with_capacity(entries.len());
            for (key, value) in &entries {
                serialized.push(self.serialize_entry(key, value, client, ctx)?);
            }
            return Ok(vec![Message::Create {
                object_id: self.object_id().clone(),
                type_id: "Map".to_string(),
                data: encode_data(&MapCreateData { entries: serialized })?,
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
                CollectionChange::Set { key, value } => {
                    let (key, value) = self.serialize_entry(&key, &value, client, ctx)?;
                    outgoing.push(MapChangeEntry::Set { key, value });
                }
                CollectionChange::Delete { key } | CollectionChange::Add { value: key } => {
                    let serialized = ctx.serialize_known(&key, client);
                    self.references.store(key, client, Vec::new(), ctx);
                    match serialized {
                        Some(key) => outgoing.push(MapChangeEntry::Delete { key }),
                        None => debug!(
                            "Dropping delete on map {} for a key {} never received",
                            self.object_id(),
                            client.identity()
                        ),
                    }
                }
                CollectionChange::Clear => {
                    self.references.release_client(client, ctx);
                    outgoing.push(MapChangeEntry::Clear);
                }
            }
        }
        if outgoing.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Message::Change {
            object_id: self.object_id().clone(),
            data: encode_data(&MapChangeData { changes: outgoing })?,
        }])
    }

    fn clear_states(&mut self, instance: &Instance, _ctx: &mut AgentContext) -> Result<(), ObjectSyncError> {
        let still_pending = match self.cycle.take() {
            Some(cycle) => {
                self.snapshot = cycle.entries;
                self.changed_since_capture
            }
            None => self.state.has_pending_changes(),
        };
        if self.state.clients().next().is_none() {
            self.snapshot = instance.map_entries();
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
        let create: MapCreateData = decode_data(self.object_id(), data)?;
        for (key, value) in &create.entries {
            self.check_entry(key, Some(value), validator)?;
        }
        Ok(())
    }

    fn validate_change(
        &self,
        data: &JsonValue,
        _origin: &ClientToken,
        validator: &BatchValidator,
    ) -> Result<(), ObjectSyncError> {
        let change: MapChangeData = decode_data(self.object_id(), data)?;
        for entry in &change.changes {
            match entry {
                MapChangeEntry::Set { key, value } => self.check_entry(key, Some(value), validator)?,
                MapChangeEntry::Delete { key } => self.check_entry(key, None, validator)?,
                MapChangeEntry::Clear => {}
            }
        }
        Ok(())
    }

    fn construct(&mut self, data: &JsonValue, _ctx: &mut AgentContext) -> Result<Instance, ObjectSyncError> {
        let _: MapCreateData = decode_data(self.object_id(), data)?;
        Ok(Instance::new_observable_map(Vec::new()))
    }

    fn apply_create_data(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let create: MapCreateData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        for (key, value) in &create.entries {
            let (key, value) = self.resolve_entry(key, value, &origin, ctx)?;
            instance.map_set(key, value);
        }
        self.snapshot = instance.map_entries();
        Ok(())
    }

    fn apply_change(
        &mut self,
        instance: &Instance,
        data: &JsonValue,
        ctx: &mut AgentContext,
    ) -> Result<(), ObjectSyncError> {
        let change: MapChangeData = decode_data(self.object_id(), data)?;
        let origin = ctx.require_origin()?;
        for entry in &change.changes {
            let relayed = match entry {
                MapChangeEntry::Set { key, value } => {
                    let (key, value) = self.resolve_entry(key, value, &origin, ctx)?;
                    instance.map_set(key.clone(), value.clone());
                    CollectionChange::Set { key, value }
                }
                MapChangeEntry::Delete { key } => {
                    let (key, _) = ctx.resolve_value(key)?;
                    instance.map_delete(&key);
                    self.references.store(key.clone(), &origin, Vec::new(), ctx);
                    CollectionChange::Delete { key }
                }
                MapChangeEntry::Clear => {
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
