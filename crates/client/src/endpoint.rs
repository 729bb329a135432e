//! Endpoint identity.

use std::fmt;
use std::sync::Arc;

/// Unique key of one remote connection target (a PubSub topic, an Archipelago slot, ...).
///
/// Cheap to clone; immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Arc<str>);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into().into_boxed_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EndpointId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}
