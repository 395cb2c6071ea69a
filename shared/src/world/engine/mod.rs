mod config;
mod error;
mod incoming;
mod invocation_manager;
mod object_sync_core;
mod sync_event;

pub use config::{MemoryManagementMode, ObjectIdGenerator, ObjectSyncConfig, PrefixIdGenerator};
pub use error::InvokeError;
pub use incoming::{BatchValidator, IncomingBatch, PendingCreate};
pub use invocation_manager::{InvocationManager, InvokeResult};
pub use object_sync_core::{InvokeTarget, ObjectSyncCore, TrackHandle, TrackOptions};
pub use sync_event::SyncEvent;
