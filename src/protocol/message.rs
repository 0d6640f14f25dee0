//! Broker message shape and the error-queue record

use crate::protocol::metadata::MessageMetadata;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message handed to the sender for delivery.
///
/// Carries body bytes, content type, an optional scheduled enqueue time and
/// the metadata property map.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub message_id: Uuid,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub metadata: MessageMetadata,
}

impl BrokerMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body: body.into(),
            content_type: None,
            scheduled_enqueue_time: None,
            metadata: MessageMetadata::new(),
        }
    }

    /// Build a JSON message from a serializable value
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        let mut message = Self::new(body);
        message.content_type = Some(CONTENT_TYPE_JSON.to_string());
        Ok(message)
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn scheduled_for(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_enqueue_time = Some(when);
        self
    }
}

/// Diagnostic record published to the error queue for terminally-failed
/// messages.
///
/// Field names match the records written by the prior implementation so
/// downstream tooling keeps working.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    #[serde(rename = "OriginalMessage")]
    pub original_message: String,
    #[serde(rename = "OriginalMessageType")]
    pub original_message_type: Option<String>,
    #[serde(rename = "OriginatingEntityPath")]
    pub originating_entity_path: String,
    #[serde(rename = "OriginatingApp")]
    pub originating_app: String,
    #[serde(rename = "ExceptionMessage")]
    pub exception_message: String,
    #[serde(rename = "ExceptionType")]
    pub exception_type: String,
    #[serde(rename = "ExceptionStackTrace")]
    pub exception_stack_trace: Option<String>,
    #[serde(rename = "InnerExceptionMessage")]
    pub inner_exception_message: Option<String>,
    #[serde(rename = "Occurred")]
    pub occurred: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Sample {
        id: u32,
    }

    #[test]
    fn test_json_message_sets_content_type() {
        let message = BrokerMessage::json(&Sample { id: 7 }).unwrap();
        assert_eq!(message.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(message.body.as_ref(), br#"{"id":7}"#);
        assert!(message.scheduled_enqueue_time.is_none());
    }

    #[test]
    fn test_scheduled_for() {
        let when = Utc::now() + chrono::Duration::seconds(30);
        let message = BrokerMessage::new(Bytes::from_static(b"{}")).scheduled_for(when);
        assert_eq!(message.scheduled_enqueue_time, Some(when));
    }

    #[test]
    fn test_error_record_field_names() {
        let record = ErrorRecord {
            original_message: "{}".to_string(),
            original_message_type: Some("billing::Invoice".to_string()),
            originating_entity_path: "invoices".to_string(),
            originating_app: "billing".to_string(),
            exception_message: "boom".to_string(),
            exception_type: "HandlerInvocationFailed".to_string(),
            exception_stack_trace: None,
            inner_exception_message: None,
            occurred: Utc::now(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["OriginalMessage"], json!("{}"));
        assert_eq!(value["OriginatingEntityPath"], json!("invoices"));
        assert_eq!(value["OriginatingApp"], json!("billing"));
        assert_eq!(value["ExceptionType"], json!("HandlerInvocationFailed"));
        assert!(value.get("occurred").is_none());
        assert!(value.get("Occurred").is_some());
    }
}
