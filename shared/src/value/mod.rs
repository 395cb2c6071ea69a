mod error_value;
mod finalization;
mod instance;
mod mut_channel;
mod sync_object;
mod value;

pub use error_value::{ErrorKind, ErrorValue};
pub use finalization::{FinalizationHook, FinalizationQueue};
pub use instance::{Instance, InstanceKey, InstanceKind, WeakInstance};
pub use mut_channel::{MutChannel, MutSender, Mutation};
pub use sync_object::{DynamicObject, SyncObject};
pub use value::Value;
