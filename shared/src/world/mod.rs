pub mod agent;
pub mod descriptor;
pub mod diff;
pub mod engine;
pub mod pool;

mod error;
pub(crate) mod object_world;

pub use error::ObjectSyncError;
