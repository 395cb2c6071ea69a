//! # Objsync Shared
//! Object-graph synchronization: replicate a live graph of objects to any
//! number of peers as create/change/delete messages, and call methods on a
//! peer's copy of an object.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod messages;
mod serialize;
mod types;
mod value;
mod world;

pub use messages::{Message, MessageError, MessageKind, SerializedDocument, SerializedValue};
pub use serialize::{deserialize, serialize};
pub use types::{ClientFilter, ClientSelector, ClientToken, InvokeId, ObjectId, PeerSettings};
pub use value::{
    DynamicObject, ErrorKind, ErrorValue, Instance, InstanceKind, Mutation, SyncObject, Value,
    WeakInstance,
};
pub use world::{
    agent::{
        agent_factory, AgentContext, AgentFactory, AgentRequest, AgentState, ArrayAgent,
        ChangeSetMode, CollectionChange, ErrorAgent, GenerationRequest, MapAgent, MapChanges,
        ObjectAgent, OriginChange, ProviderOptions, ProviderRegistry, ReferenceTracker,
        RegistryError, SetAgent, SimpleValueAgent, SpliceLog, SyncAgent,
    },
    descriptor::{
        LifecycleHooks, MethodReturn, PromiseHandling, TrackedMethod, TrackedProperty,
        TypeDescriptor,
    },
    diff::{apply_splices, compute_splices, SpliceInstruction},
    engine::{
        BatchValidator, IncomingBatch, InvokeError, InvokeResult, InvokeTarget,
        MemoryManagementMode, ObjectIdGenerator, ObjectSyncConfig, ObjectSyncCore,
        PrefixIdGenerator, SyncEvent, TrackHandle, TrackOptions,
    },
    ObjectSyncError,
};
