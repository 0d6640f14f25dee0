//! Wire-level types shared between the dispatcher and the broker
//!
//! This module owns the entity addressing model, the broker message shape,
//! and the retry/defer metadata mini-protocol that rides on message
//! properties. The metadata key names are a stable contract with deliveries
//! produced by prior versions of the system and must not change.

pub mod entity;
pub mod message;
pub mod metadata;

pub use entity::{EntityKey, EntityKind};
pub use message::{BrokerMessage, ErrorRecord, CONTENT_TYPE_JSON};
pub use metadata::MessageMetadata;
