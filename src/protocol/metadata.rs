//! Retry/defer metadata riding on broker message properties
//!
//! These key names interoperate with deliveries produced by prior versions
//! of the system; renaming any of them is a wire-breaking change.

use serde_json::Value;
use std::collections::HashMap;

/// Number of retry attempts already consumed by this logical message
pub const RETRY_COUNT: &str = "retryCount";
/// Reason reported by the most recent retryable failure
pub const LAST_ERROR: &str = "lastError";
/// Fully-qualified payload type name used to redeserialize on the next hop
pub const MESSAGE_TYPE: &str = "messageType";
/// Entity path that originated a topic retry (provenance tag)
pub const RETRY_SOURCE_ENTITY_PATH: &str = "retrySourceEntityPath";
/// Marks a message republished through the defer path
pub const DEFERRED: &str = "deferred";

/// Typed accessors over a broker metadata map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    properties: HashMap<String, Value>,
}

impl MessageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(properties: HashMap<String, Value>) -> Self {
        Self { properties }
    }

    pub fn into_map(self) -> HashMap<String, Value> {
        self.properties
    }

    pub fn as_map(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    /// Retry count; an absent key reads as 0
    pub fn retry_count(&self) -> u32 {
        self.properties
            .get(RETRY_COUNT)
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(0)
    }

    /// Whether a retry count was explicitly stamped on this message
    pub fn has_retry_count(&self) -> bool {
        self.properties.contains_key(RETRY_COUNT)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.properties.insert(RETRY_COUNT.to_string(), count.into());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.properties.get(LAST_ERROR).and_then(Value::as_str)
    }

    pub fn set_last_error(&mut self, reason: &str) {
        self.properties
            .insert(LAST_ERROR.to_string(), reason.into());
    }

    pub fn message_type(&self) -> Option<&str> {
        self.properties.get(MESSAGE_TYPE).and_then(Value::as_str)
    }

    pub fn set_message_type(&mut self, type_name: &str) {
        self.properties
            .insert(MESSAGE_TYPE.to_string(), type_name.into());
    }

    pub fn retry_source_entity_path(&self) -> Option<&str> {
        self.properties
            .get(RETRY_SOURCE_ENTITY_PATH)
            .and_then(Value::as_str)
    }

    pub fn set_retry_source_entity_path(&mut self, entity_path: &str) {
        self.properties
            .insert(RETRY_SOURCE_ENTITY_PATH.to_string(), entity_path.into());
    }

    pub fn deferred(&self) -> bool {
        self.properties
            .get(DEFERRED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_deferred(&mut self) {
        self.properties.insert(DEFERRED.to_string(), true.into());
    }
}
