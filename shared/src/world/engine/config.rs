use std::default::Default;

use crate::ObjectId;

/// Hands out ids for objects this engine starts tracking.
pub trait ObjectIdGenerator: Send {
    fn generate(&mut self) -> ObjectId;
}

/// Generates `prefix-1`, `prefix-2`, ... Ids are never reused.
pub struct PrefixIdGenerator {
    prefix: String,
    next: u64,
}

impl PrefixIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
        }
    }

    /// A generator with a random 8 character prefix.
    pub fn random() -> Self {
        Self::new(random_prefix())
    }
}

impl ObjectIdGenerator for PrefixIdGenerator {
    fn generate(&mut self) -> ObjectId {
        self.next += 1;
        ObjectId::new(format!("{}-{}", self.prefix, self.next))
    }
}

fn random_prefix() -> String {
    (0..8).map(|_| fastrand::alphanumeric()).collect()
}

/// How the engine decides an owned object is gone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemoryManagementMode {
    /// Reference counts per peer; an object nobody references is deleted
    #[default]
    Strong,
    /// Unreferenced objects are only watched, and deleted once the
    /// application drops the last handle to them
    Weak,
}

/// Contains Config properties which will be used by the engine
pub struct ObjectSyncConfig {
    /// Prefix of generated object ids, used when `id_generator` is unset
    pub id_prefix: String,
    /// Replaces the prefix generator
    pub id_generator: Option<Box<dyn ObjectIdGenerator>>,
    pub memory_management: MemoryManagementMode,
}

impl ObjectSyncConfig {
    pub(crate) fn take_generator(&mut self) -> Box<dyn ObjectIdGenerator> {
        match self.id_generator.take() {
            Some(generator) => generator,
            None => Box::new(PrefixIdGenerator::new(self.id_prefix.clone())),
        }
    }
}

impl Default for ObjectSyncConfig {
    fn default() -> Self {
        Self {
            id_prefix: random_prefix(),
            id_generator: None,
            memory_management: MemoryManagementMode::default(),
        }
    }
}
