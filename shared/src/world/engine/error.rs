use thiserror::Error;

use crate::{world::ObjectSyncError, Value};

/// Why an outbound invocation did not produce a value
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// The peer or the object went away before the result arrived
    #[error("Invocation cancelled: {reason}")]
    Cancelled { reason: String },

    /// The method ran on the peer and failed with this value
    #[error("Remote method failed with {0:?}")]
    Remote(Value),

    /// The instance is not tracked by this engine
    #[error("Instance is not tracked")]
    NotTracked,

    /// The object's type does not declare this method
    #[error("Method {method} is not tracked")]
    UnknownMethod { method: String },

    /// Building the execute messages failed
    #[error(transparent)]
    Sync(#[from] ObjectSyncError),
}
