//! Typed message client
//!
//! Applications bind payload types to destinations once, then dispatch
//! values without naming entities at the call site. Every outgoing message
//! is JSON-encoded and stamped with its payload type name so the receiving
//! side can redeserialize on retry hops.

use crate::error::{DispatchError, DispatchResult};
use crate::protocol::BrokerMessage;
use crate::transport::MessageSender;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Payload-type-to-destination routing table, fixed at startup
#[derive(Debug, Default)]
pub struct SendBindings {
    queues: HashMap<TypeId, String>,
    topics: HashMap<TypeId, String>,
}

impl SendBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route values of `T` to a queue
    pub fn queue<T: 'static>(mut self, queue_name: impl Into<String>) -> Self {
        self.queues.insert(TypeId::of::<T>(), queue_name.into());
        self
    }

    /// Route values of `T` to a topic
    pub fn topic<T: 'static>(mut self, topic_name: impl Into<String>) -> Self {
        self.topics.insert(TypeId::of::<T>(), topic_name.into());
        self
    }
}

/// Sends typed payloads through the bound destinations
pub struct MessageClient {
    sender: Arc<dyn MessageSender>,
    bindings: SendBindings,
}

impl MessageClient {
    pub fn new(sender: Arc<dyn MessageSender>, bindings: SendBindings) -> Self {
        Self { sender, bindings }
    }

    /// Send a value to its bound destination.
    ///
    /// Queue bindings win when a type is bound to both a queue and a topic.
    pub async fn dispatch<T: Serialize + 'static>(&self, value: &T) -> DispatchResult<()> {
        self.dispatch_message(value, None).await
    }

    /// Send a value that becomes visible at the given time
    pub async fn dispatch_scheduled<T: Serialize + 'static>(
        &self,
        value: &T,
        deliver_at: DateTime<Utc>,
    ) -> DispatchResult<()> {
        self.dispatch_message(value, Some(deliver_at)).await
    }

    async fn dispatch_message<T: Serialize + 'static>(
        &self,
        value: &T,
        deliver_at: Option<DateTime<Utc>>,
    ) -> DispatchResult<()> {
        let mut message = encode(value)?;
        if let Some(at) = deliver_at {
            message = message.scheduled_for(at);
        }

        let type_id = TypeId::of::<T>();
        if let Some(queue) = self.bindings.queues.get(&type_id) {
            debug!(queue = %queue, message_type = std::any::type_name::<T>(), "dispatching to queue");
            return self.sender.send_to_queue(queue, message).await;
        }
        if let Some(topic) = self.bindings.topics.get(&type_id) {
            debug!(topic = %topic, message_type = std::any::type_name::<T>(), "publishing to topic");
            return self.sender.publish_to_topic(topic, message).await;
        }
        Err(DispatchError::configuration(format!(
            "no destination bound for payload type {}",
            std::any::type_name::<T>()
        )))
    }

    /// Send to an explicit queue, bypassing the bindings
    pub async fn send_to_queue<T: Serialize + 'static>(
        &self,
        queue_name: &str,
        value: &T,
    ) -> DispatchResult<()> {
        self.sender.send_to_queue(queue_name, encode(value)?).await
    }

    /// Publish to an explicit topic, bypassing the bindings
    pub async fn publish_to_topic<T: Serialize + 'static>(
        &self,
        topic_name: &str,
        value: &T,
    ) -> DispatchResult<()> {
        self.sender
            .publish_to_topic(topic_name, encode(value)?)
            .await
    }
}

fn encode<T: Serialize + 'static>(value: &T) -> DispatchResult<BrokerMessage> {
    let mut message = BrokerMessage::json(value)
        .map_err(|e| DispatchError::transport("encode_message", e.to_string()))?;
    message
        .metadata
        .set_message_type(std::any::type_name::<T>());
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CONTENT_TYPE_JSON;
    use crate::testing::mocks::MockSender;

    #[derive(Serialize)]
    struct Invoice {
        total: u32,
    }

    #[derive(Serialize)]
    struct AuditEvent {
        action: String,
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_type() {
        let sender = Arc::new(MockSender::new());
        let client = MessageClient::new(
            sender.clone(),
            SendBindings::new()
                .queue::<Invoice>("invoices")
                .topic::<AuditEvent>("audit"),
        );

        client.dispatch(&Invoice { total: 12 }).await.unwrap();
        client
            .dispatch(&AuditEvent {
                action: "created".to_string(),
            })
            .await
            .unwrap();

        let sends = sender.queue_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "invoices");
        assert_eq!(sends[0].1.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(
            sends[0].1.metadata.message_type(),
            Some(std::any::type_name::<Invoice>())
        );

        let publishes = sender.topic_publishes();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].0, "audit");
    }

    #[tokio::test]
    async fn test_unbound_type_is_a_configuration_error() {
        let client = MessageClient::new(Arc::new(MockSender::new()), SendBindings::new());
        assert!(matches!(
            client.dispatch(&Invoice { total: 1 }).await,
            Err(DispatchError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_scheduled_dispatch_sets_enqueue_time() {
        let sender = Arc::new(MockSender::new());
        let client = MessageClient::new(
            sender.clone(),
            SendBindings::new().queue::<Invoice>("invoices"),
        );

        let at = Utc::now() + chrono::Duration::minutes(5);
        client
            .dispatch_scheduled(&Invoice { total: 3 }, at)
            .await
            .unwrap();
        assert_eq!(sender.queue_sends()[0].1.scheduled_enqueue_time, Some(at));
    }

    #[tokio::test]
    async fn test_explicit_destination_bypasses_bindings() {
        let sender = Arc::new(MockSender::new());
        let client = MessageClient::new(sender.clone(), SendBindings::new());

        client
            .send_to_queue("overflow", &Invoice { total: 9 })
            .await
            .unwrap();
        assert_eq!(sender.queue_sends()[0].0, "overflow");
    }
}
