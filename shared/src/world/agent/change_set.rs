use std::collections::HashSet;

use crate::{
    world::diff::{apply_splices, SpliceInstruction},
    ClientToken, Value,
};

/// Appends `splice` to the pending list, folding it into the last pending
/// instruction where the two touch.
pub fn push_splice(pending: &mut Vec<SpliceInstruction<Value>>, splice: SpliceInstruction<Value>) {
    if splice.delete_count == 0 && splice.items.is_empty() {
        return;
    }
    let Some(last) = pending.last_mut() else {
        pending.push(splice);
        return;
    };
    let inserted_end = last.start + last.items.len();

    // append right after the last insert
    if splice.delete_count == 0 && splice.start == inserted_end && !last.items.is_empty() {
        last.items.extend(splice.items);
        return;
    }

    if splice.items.is_empty() && !last.items.is_empty() && splice.start >= last.start {
        let delete_end = splice.start + splice.delete_count;

        // delete reaching past the end of the last insert
        if splice.start <= inserted_end && delete_end > inserted_end {
            last.items.truncate(splice.start - last.start);
            last.delete_count += delete_end - inserted_end;
            return;
        }

        // delete entirely inside the last insert
        if delete_end <= inserted_end {
            let offset = splice.start - last.start;
            last.items.drain(offset..offset + splice.delete_count);
            if last.items.is_empty() && last.delete_count == 0 {
                pending.pop();
            }
            return;
        }
    }

    pending.push(splice);
}

/// Recorded splices in runs of one origin: `None` for local edits, the
/// sending peer for splices relayed from it.
#[derive(Default)]
pub struct SpliceLog {
    runs: Vec<(Option<ClientToken>, Vec<SpliceInstruction<Value>>)>,
}

impl SpliceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn push(&mut self, origin: Option<&ClientToken>, splice: SpliceInstruction<Value>) {
        if let Some((last_origin, run)) = self.runs.last_mut() {
            if last_origin.as_ref() == origin {
                push_splice(run, splice);
                if run.is_empty() {
                    self.runs.pop();
                }
                return;
            }
        }
        let mut run = Vec::new();
        push_splice(&mut run, splice);
        if !run.is_empty() {
            self.runs.push((origin.cloned(), run));
        }
    }

    /// Replays every run onto `array`.
    pub fn apply_to(&self, array: &mut Vec<Value>) {
        for (_, run) in &self.runs {
            apply_splices(array, run);
        }
    }

    /// Splices `client` is missing. Runs it sent itself are skipped while
    /// they lead the log; `None` once its own splices follow someone else's,
    /// since its copy then has to be replaced outright.
    pub fn splices_for(&self, client: &ClientToken) -> Option<Vec<SpliceInstruction<Value>>> {
        let mut splices = Vec::new();
        let runs = self
            .runs
            .iter()
            .skip_while(|(origin, _)| origin.as_ref() == Some(client));
        for (origin, run) in runs {
            if origin.as_ref() == Some(client) {
                return None;
            }
            splices.extend(run.iter().cloned());
        }
        Some(splices)
    }

    pub fn take(&mut self) -> SpliceLog {
        std::mem::take(self)
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }
}

/// A discrete map or set change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionChange {
    Set { key: Value, value: Value },
    Add { value: Value },
    Delete { key: Value },
    Clear,
}

impl CollectionChange {
    fn key(&self) -> Option<&Value> {
        match self {
            CollectionChange::Set { key, .. } | CollectionChange::Delete { key } => Some(key),
            CollectionChange::Add { value } => Some(value),
            CollectionChange::Clear => None,
        }
    }
}

/// A change with where it came from: `None` for local edits.
pub type OriginChange = (Option<ClientToken>, CollectionChange);

/// Pending map or set changes, coalesced per key as they are recorded.
#[derive(Default)]
pub struct MapChanges {
    changes: Vec<OriginChange>,
    /// Keys added locally that no peer has been sent yet
    added_since_flush: HashSet<Value>,
}

impl MapChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// `previously_present` tells whether a local set/add replaced an
    /// existing key.
    pub fn record(&mut self, change: CollectionChange, previously_present: bool) {
        self.record_from(None, change, previously_present);
    }

    /// Records a change applied on behalf of `origin`.
    pub fn relay(&mut self, origin: &ClientToken, change: CollectionChange) {
        self.record_from(Some(origin.clone()), change, true);
    }

    fn record_from(&mut self, origin: Option<ClientToken>, change: CollectionChange, previously_present: bool) {
        match change {
            CollectionChange::Clear => {
                self.changes.clear();
                self.added_since_flush.clear();
                self.changes.push((origin, CollectionChange::Clear));
            }
            CollectionChange::Set { .. } | CollectionChange::Add { .. } => {
                let Some(key) = change.key().cloned() else {
                    return;
                };
                let replaced_pending = self.remove_pending(&key);
                if origin.is_some() {
                    self.added_since_flush.remove(&key);
                } else if !previously_present && !replaced_pending {
                    self.added_since_flush.insert(key);
                }
                self.changes.push((origin, change));
            }
            CollectionChange::Delete { key } => {
                self.remove_pending(&key);
                if self.added_since_flush.remove(&key) {
                    return;
                }
                self.changes.push((origin, CollectionChange::Delete { key }));
            }
        }
    }

    fn remove_pending(&mut self, key: &Value) -> bool {
        let before = self.changes.len();
        self.changes
            .retain(|(_, existing)| existing.key().map_or(true, |existing_key| existing_key != key));
        self.changes.len() != before
    }

    pub fn changes(&self) -> impl Iterator<Item = &CollectionChange> {
        self.changes.iter().map(|(_, change)| change)
    }

    pub fn take(&mut self) -> Vec<OriginChange> {
        self.added_since_flush.clear();
        std::mem::take(&mut self.changes)
    }

    pub fn clear(&mut self) {
        self.changes.clear();
        self.added_since_flush.clear();
    }
}

/// Changes `client` is missing. Its own changes are skipped unless a clear
/// from someone else came before them.
pub fn changes_for(changes: &[OriginChange], client: &ClientToken) -> Vec<CollectionChange> {
    let mut cleared_by_other = false;
    let mut missing = Vec::new();
    for (origin, change) in changes {
        let own = origin.as_ref() == Some(client);
        if own && !cleared_by_other {
            continue;
        }
        if !own && *change == CollectionChange::Clear {
            cleared_by_other = true;
        }
        missing.push(change.clone());
    }
    missing
}
