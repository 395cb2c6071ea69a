use thiserror::Error;

/// Errors raised while building a provider registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Registry is locked and cannot be modified
    #[error("Provider registry is already locked and cannot be modified. ProviderRegistry.lock() has been called and no further providers may be added")]
    AlreadyLocked,

    /// A type descriptor with this type id is already registered
    #[error("Type {type_id} is already registered")]
    DuplicateType { type_id: String },
}
