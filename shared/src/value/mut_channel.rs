use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use crate::{world::diff::SpliceInstruction, ObjectId};

use super::Value;

/// A change recorded by an instance mutator.
#[derive(Clone, Debug)]
pub enum Mutation {
    Property {
        key: String,
    },
    Splice(SpliceInstruction<Value>),
    MapSet {
        key: Value,
        value: Value,
        previously_present: bool,
    },
    MapDelete {
        key: Value,
    },
    SetAdd {
        value: Value,
    },
    SetDelete {
        value: Value,
    },
    Clear,
    /// Coarse notification from a plain collection or a simple value: something
    /// changed, diff to find out what.
    Touched,
}

type MutQueue = Mutex<Vec<(ObjectId, Mutation)>>;

// MutChannel
/// One per engine. Every instance the engine tracks holds a [`MutSender`] into
/// this channel.
#[derive(Clone, Default)]
pub struct MutChannel {
    queue: Arc<MutQueue>,
}

impl MutChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_sender(&self, object_id: &ObjectId) -> MutSender {
        MutSender {
            object_id: object_id.clone(),
            queue: Arc::downgrade(&self.queue),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn receive(&self) -> Vec<(ObjectId, Mutation)> {
        let Ok(mut queue) = self.queue.lock() else {
            panic!("Mutation queue poisoned");
        };
        std::mem::take(&mut *queue)
    }

    pub fn is_empty(&self) -> bool {
        let Ok(queue) = self.queue.lock() else {
            panic!("Mutation queue poisoned");
        };
        queue.is_empty()
    }
}

// MutSender
#[derive(Clone)]
pub struct MutSender {
    object_id: ObjectId,
    queue: Weak<MutQueue>,
    muted: Arc<AtomicBool>,
}

impl MutSender {
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// Returns false once the owning channel is gone, so the instance can
    /// drop this sender.
    pub fn send(&self, mutation: Mutation) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        if self.is_muted() {
            return true;
        }
        let Ok(mut queue) = queue.lock() else {
            panic!("Mutation queue poisoned");
        };
        queue.push((self.object_id.clone(), mutation));
        true
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_same(&self, other: &MutSender) -> bool {
        Arc::ptr_eq(&self.muted, &other.muted)
    }
}
