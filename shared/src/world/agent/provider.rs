use std::{collections::HashMap, sync::Arc};

use log::debug;

use crate::{
    value::InstanceKind,
    world::{descriptor::TypeDescriptor, ObjectSyncError},
    Instance, ObjectId,
};

use super::{
    ArrayAgent, ErrorAgent, MapAgent, ObjectAgent, RegistryError, SetAgent, SimpleValueAgent,
    SyncAgent,
};

/// Builds the agent for one object.
pub type AgentFactory = Arc<dyn Fn(&AgentRequest) -> Box<dyn SyncAgent> + Send + Sync>;

pub fn agent_factory(
    factory: impl Fn(&AgentRequest) -> Box<dyn SyncAgent> + Send + Sync + 'static,
) -> AgentFactory {
    Arc::new(factory)
}

/// What a factory knows about the object it builds an agent for.
pub struct AgentRequest<'a> {
    pub object_id: &'a ObjectId,
    /// Local type id: the instance's type name, or the wire id mapped back
    pub type_id: &'a str,
    pub descriptor: Option<Arc<TypeDescriptor>>,
    /// Whether the collection records precise mutations. Objects built from
    /// a create message are always observable.
    pub observable: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    /// Tried only after every non-intrinsic provider
    pub is_intrinsic: bool,
    /// Match the instance's own type only, not its parents
    pub match_exact_type: bool,
    /// Higher runs first; later registrations win ties
    pub priority: i32,
}

#[derive(Clone)]
struct Provider {
    type_id: String,
    factory: AgentFactory,
    options: ProviderOptions,
}

impl Provider {
    fn matches_chain(&self, chain: &[String]) -> bool {
        if self.options.match_exact_type {
            chain.first() == Some(&self.type_id)
        } else {
            chain.contains(&self.type_id)
        }
    }
}

/// Maps instance types and wire type ids to the agent that syncs them.
#[derive(Clone)]
pub struct ProviderRegistry {
    /// Ordered by resolution precedence
    providers: Vec<Provider>,
    descriptors: HashMap<String, Arc<TypeDescriptor>>,
    wire_ids: HashMap<String, String>,
    locked: bool,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            providers: Vec::new(),
            descriptors: HashMap::new(),
            wire_ids: HashMap::new(),
            locked: false,
        };
        registry.add_intrinsics();
        registry
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> Self {
        Self::default()
    }

    fn add_intrinsics(&mut self) {
        let intrinsic = ProviderOptions {
            is_intrinsic: true,
            ..Default::default()
        };
        self.insert_provider(
            "Object",
            agent_factory(|request| {
                let type_id = request
                    .descriptor
                    .as_ref()
                    .map(|descriptor| descriptor.wire_type_id().to_string())
                    .unwrap_or_else(|| "Object".to_string());
                Box::new(ObjectAgent::new(
                    request.object_id.clone(),
                    &type_id,
                    request.descriptor.clone(),
                ))
            }),
            intrinsic,
        );
        self.insert_provider(
            "Error",
            agent_factory(|request| {
                Box::new(ErrorAgent::new(request.object_id.clone()))
            }),
            intrinsic,
        );
        self.insert_provider(
            "Set",
            agent_factory(|request| {
                Box::new(SetAgent::new(request.object_id.clone(), request.observable))
            }),
            intrinsic,
        );
        self.insert_provider(
            "Map",
            agent_factory(|request| {
                Box::new(MapAgent::new(request.object_id.clone(), request.observable))
            }),
            intrinsic,
        );
        self.insert_provider(
            "Array",
            agent_factory(|request| {
                Box::new(ArrayAgent::new(request.object_id.clone(), request.observable))
            }),
            intrinsic,
        );
    }

    fn insert_provider(&mut self, type_id: &str, factory: AgentFactory, options: ProviderOptions) {
        let provider = Provider {
            type_id: type_id.to_string(),
            factory,
            options,
        };
        // intrinsics after everything else, then priority descending, newest first on ties
        let position = self
            .providers
            .iter()
            .position(|existing| {
                (existing.options.is_intrinsic, -existing.options.priority)
                    >= (options.is_intrinsic, -options.priority)
            })
            .unwrap_or(self.providers.len());
        self.providers.insert(position, provider);
    }

    // Builder

    /// Registers a user type synced by the structured-object agent.
    pub fn add_type(&mut self, descriptor: TypeDescriptor) -> &mut Self {
        self.check_lock();
        if let Err(error) = self.register_type(descriptor) {
            panic!("{}", error);
        }
        self
    }

    /// Registers a leaf type copied by value, such as a date.
    pub fn add_simple_type(&mut self, type_id: &str) -> &mut Self {
        self.check_lock();
        self.register_simple_type(type_id);
        self
    }

    pub fn add_provider(
        &mut self,
        type_id: &str,
        factory: AgentFactory,
        options: ProviderOptions,
    ) -> &mut Self {
        self.check_lock();
        self.insert_provider(type_id, factory, options);
        self
    }

    // Non-panicking builder methods

    pub fn try_add_type(&mut self, descriptor: TypeDescriptor) -> Result<&mut Self, RegistryError> {
        self.try_check_lock()?;
        self.register_type(descriptor)?;
        Ok(self)
    }

    pub fn try_add_simple_type(&mut self, type_id: &str) -> Result<&mut Self, RegistryError> {
        self.try_check_lock()?;
        self.register_simple_type(type_id);
        Ok(self)
    }

    pub fn try_add_provider(
        &mut self,
        type_id: &str,
        factory: AgentFactory,
        options: ProviderOptions,
    ) -> Result<&mut Self, RegistryError> {
        self.try_check_lock()?;
        self.insert_provider(type_id, factory, options);
        Ok(self)
    }

    fn register_type(&mut self, descriptor: TypeDescriptor) -> Result<(), RegistryError> {
        let type_id = descriptor.type_id.clone();
        if self.descriptors.contains_key(&type_id) {
            return Err(RegistryError::DuplicateType { type_id });
        }
        let wire_id = descriptor.wire_type_id().to_string();
        if wire_id != type_id {
            self.wire_ids.insert(wire_id, type_id.clone());
        }
        self.descriptors.insert(type_id.clone(), Arc::new(descriptor));
        self.insert_provider(
            &type_id,
            agent_factory(|request| {
                let type_id = request
                    .descriptor
                    .as_ref()
                    .map(|descriptor| descriptor.wire_type_id())
                    .unwrap_or(request.type_id);
                Box::new(ObjectAgent::new(
                    request.object_id.clone(),
                    type_id,
                    request.descriptor.clone(),
                ))
            }),
            ProviderOptions::default(),
        );
        debug!("Registered type {}", type_id);
        Ok(())
    }

    fn register_simple_type(&mut self, type_id: &str) {
        self.insert_provider(
            type_id,
            agent_factory(|request| {
                Box::new(SimpleValueAgent::new(request.object_id.clone(), request.type_id))
            }),
            ProviderOptions {
                match_exact_type: true,
                ..Default::default()
            },
        );
    }

    pub fn try_lock(&mut self) -> Result<(), RegistryError> {
        self.try_check_lock()?;
        self.locked = true;
        Ok(())
    }

    pub fn lock(&mut self) {
        self.check_lock();
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Checks if the registry is locked without panicking
    pub fn try_check_lock(&self) -> Result<(), RegistryError> {
        if self.locked {
            Err(RegistryError::AlreadyLocked)
        } else {
            Ok(())
        }
    }

    /// Checks if the registry is locked, panics if it is
    pub fn check_lock(&self) {
        if self.locked {
            panic!("Provider registry already locked!");
        }
    }

    pub fn build(&mut self) -> Self {
        std::mem::take(self)
    }

    // Resolution

    pub fn descriptor(&self, type_id: &str) -> Option<Arc<TypeDescriptor>> {
        let local_id = self.local_type_id(type_id);
        self.descriptors.get(local_id).cloned()
    }

    fn local_type_id<'s>(&'s self, type_id: &'s str) -> &'s str {
        self.wire_ids.get(type_id).map(String::as_str).unwrap_or(type_id)
    }

    /// `type_id`, its declared ancestors, then the intrinsic base types.
    fn declared_chain(&self, type_id: &str, base: &[&str]) -> Vec<String> {
        let mut chain = vec![type_id.to_string()];
        let mut current = self.descriptors.get(type_id);
        while let Some(parent) = current.and_then(|descriptor| descriptor.parent.clone()) {
            if chain.contains(&parent) {
                break;
            }
            current = self.descriptors.get(&parent);
            chain.push(parent);
        }
        for name in base {
            if !chain.iter().any(|existing| existing == name) {
                chain.push(name.to_string());
            }
        }
        chain
    }

    fn instance_chain(&self, instance: &Instance) -> Vec<String> {
        let type_name = instance.type_name();
        match instance.kind() {
            InstanceKind::Object => self.declared_chain(&type_name, &["Object"]),
            InstanceKind::Array | InstanceKind::Map | InstanceKind::Set => {
                self.declared_chain(&type_name, &["Object"])
            }
            InstanceKind::Error => self.declared_chain(&type_name, &["Error", "Object"]),
            InstanceKind::Simple => vec![type_name],
        }
    }

    /// Every name a value arriving with `type_id` answers to, for allow-list
    /// checks.
    pub fn type_names_for_id(&self, type_id: &str) -> Vec<String> {
        let local_id = self.local_type_id(type_id);
        let base: &[&str] = match local_id {
            "Error" => &["Object"],
            _ if self.is_simple(local_id) => &[],
            _ => &["Object"],
        };
        let mut names = self.declared_chain(local_id, base);
        if local_id != type_id {
            names.insert(0, type_id.to_string());
        }
        names
    }

    fn is_simple(&self, type_id: &str) -> bool {
        self.providers
            .iter()
            .find(|provider| provider.type_id == type_id)
            .map_or(false, |provider| provider.options.match_exact_type)
    }

    /// Agent for a live instance tracked for the first time.
    pub fn agent_for_instance(
        &self,
        instance: &Instance,
        object_id: &ObjectId,
    ) -> Result<Box<dyn SyncAgent>, ObjectSyncError> {
        let chain = self.instance_chain(instance);
        let type_id = chain[0].as_str();
        let provider = self
            .providers
            .iter()
            .find(|provider| provider.matches_chain(&chain))
            .ok_or_else(|| ObjectSyncError::UnknownType {
                type_id: type_id.to_string(),
            })?;
        Ok((provider.factory)(&AgentRequest {
            object_id,
            type_id,
            descriptor: self.descriptors.get(type_id).cloned(),
            observable: instance.is_observable(),
        }))
    }

    /// Agent for an object announced by a create message.
    pub fn agent_for_type_id(
        &self,
        type_id: &str,
        object_id: &ObjectId,
    ) -> Result<Box<dyn SyncAgent>, ObjectSyncError> {
        let local_id = self.local_type_id(type_id);
        let provider = self
            .providers
            .iter()
            .find(|provider| provider.type_id == local_id)
            .ok_or_else(|| ObjectSyncError::UnknownType {
                type_id: type_id.to_string(),
            })?;
        Ok((provider.factory)(&AgentRequest {
            object_id,
            type_id: local_id,
            descriptor: self.descriptors.get(local_id).cloned(),
            observable: true,
        }))
    }

    pub fn has_type_id(&self, type_id: &str) -> bool {
        let local_id = self.local_type_id(type_id);
        self.providers.iter().any(|provider| provider.type_id == local_id)
    }
}
