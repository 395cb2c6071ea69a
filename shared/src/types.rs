use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

pub type InvokeId = u64;

/// Identifier of a tracked object, unique within one engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Settings supplied when registering a peer.
#[derive(Clone, Debug, Default)]
pub struct PeerSettings {
    /// Human readable identity, used by client filters and logs only
    pub identity: String,
}

impl PeerSettings {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

struct ClientTokenInner {
    identity: String,
}

/// Handle for one peer connection. Equality is handle identity, never the
/// identity string.
#[derive(Clone)]
pub struct ClientToken {
    inner: Arc<ClientTokenInner>,
}

impl ClientToken {
    pub(crate) fn new(identity: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClientTokenInner {
                identity: identity.into(),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }
}

impl PartialEq for ClientToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ClientToken {}

impl Hash for ClientToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientToken({}@{:x})",
            self.inner.identity,
            Arc::as_ptr(&self.inner) as usize
        )
    }
}

#[derive(Clone, Debug)]
pub enum ClientSelector {
    Token(ClientToken),
    Identity(String),
}

impl ClientSelector {
    pub fn matches(&self, client: &ClientToken) -> bool {
        match self {
            ClientSelector::Token(token) => token == client,
            ClientSelector::Identity(identity) => identity == client.identity(),
        }
    }
}

/// Restricts which peers see an object. An empty filter admits everyone.
#[derive(Clone, Debug, Default)]
pub struct ClientFilter {
    pub include: Option<Vec<ClientSelector>>,
    pub exclude: Vec<ClientSelector>,
}

impl ClientFilter {
    pub fn include(selectors: Vec<ClientSelector>) -> Self {
        Self {
            include: Some(selectors),
            exclude: Vec::new(),
        }
    }

    pub fn exclude(selectors: Vec<ClientSelector>) -> Self {
        Self {
            include: None,
            exclude: selectors,
        }
    }

    pub fn allows(&self, client: &ClientToken) -> bool {
        if let Some(include) = &self.include {
            if !include.iter().any(|selector| selector.matches(client)) {
                return false;
            }
        }
        !self.exclude.iter().any(|selector| selector.matches(client))
    }
}
