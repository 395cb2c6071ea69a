use std::sync::{Arc, Mutex, Weak};

use crate::ObjectId;

/// Collects ids of weakly held instances whose last strong handle was dropped.
#[derive(Clone, Default)]
pub struct FinalizationQueue {
    finalized: Arc<Mutex<Vec<ObjectId>>>,
}

impl FinalizationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self, object_id: &ObjectId) -> FinalizationHook {
        FinalizationHook {
            object_id: object_id.clone(),
            queue: Arc::downgrade(&self.finalized),
        }
    }

    pub fn drain(&self) -> Vec<ObjectId> {
        let Ok(mut finalized) = self.finalized.lock() else {
            panic!("Finalization queue poisoned");
        };
        std::mem::take(&mut *finalized)
    }

    pub fn is_empty(&self) -> bool {
        self.finalized
            .lock()
            .map(|finalized| finalized.is_empty())
            .unwrap_or(true)
    }
}

/// Registered on an instance; fires once when the instance is reclaimed.
pub struct FinalizationHook {
    object_id: ObjectId,
    queue: Weak<Mutex<Vec<ObjectId>>>,
}

impl FinalizationHook {
    pub fn targets(&self, other: &FinalizationHook) -> bool {
        self.object_id == other.object_id && Weak::ptr_eq(&self.queue, &other.queue)
    }

    pub(crate) fn fire(self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        if let Ok(mut finalized) = queue.lock() {
            finalized.push(self.object_id);
        };
    }
}
