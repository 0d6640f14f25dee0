//! Entity addressing: named queues and topics

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of broker entity a handler is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Queue,
    Topic,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Queue => write!(f, "queue"),
            EntityKind::Topic => write!(f, "topic"),
        }
    }
}

/// Identifies one registration and its dispatch loop.
///
/// Unique per registration; immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub name: String,
    pub kind: EntityKind,
}

impl EntityKey {
    pub fn new(name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(name, EntityKind::Queue)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, EntityKind::Topic)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::queue("orders").to_string(), "queue:orders");
        assert_eq!(EntityKey::topic("events").to_string(), "topic:events");
    }

    #[test]
    fn test_entity_key_equality_includes_kind() {
        assert_ne!(EntityKey::queue("orders"), EntityKey::topic("orders"));
        assert_eq!(EntityKey::queue("orders"), EntityKey::queue("orders"));
    }

    #[test]
    fn test_entity_kind_serialization() {
        assert_eq!(serde_json::to_string(&EntityKind::Queue).unwrap(), "\"queue\"");
        assert_eq!(serde_json::to_string(&EntityKind::Topic).unwrap(), "\"topic\"");
    }
}
