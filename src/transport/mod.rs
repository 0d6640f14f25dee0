//! Broker transport abstraction
//!
//! These traits are the seam between dispatch orchestration and a concrete
//! broker. The worker provisions topology, pulls deliveries from processors,
//! settles them through their handles, and sends derived messages (retries,
//! deferrals, error records) through the sender.
//!
//! An in-memory implementation lives in [`memory`] for local runs and tests.

use crate::config::ProcessingConfig;
use crate::error::DispatchResult;
use crate::protocol::{BrokerMessage, EntityKey, MessageMetadata};
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod memory;

pub use memory::InMemoryBroker;

/// Provisions broker entities before processing starts.
///
/// Every operation is idempotent; existing entities are left untouched.
#[async_trait::async_trait]
pub trait TopologyManager: Send + Sync {
    async fn ensure_queue_exists(&self, queue_name: &str) -> DispatchResult<()>;

    async fn ensure_topic_exists(&self, topic_name: &str) -> DispatchResult<()>;

    async fn ensure_subscription_exists(
        &self,
        topic_name: &str,
        subscription_name: &str,
    ) -> DispatchResult<()>;
}

/// Sends derived messages back into the broker
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a message to a queue, honoring its scheduled enqueue time
    async fn send_to_queue(&self, queue_name: &str, message: BrokerMessage) -> DispatchResult<()>;

    /// Publish a message to a topic, fanning out to every subscription
    async fn publish_to_topic(&self, topic_name: &str, message: BrokerMessage)
        -> DispatchResult<()>;
}

/// Settlement operations for one in-flight delivery.
///
/// A delivery left unsettled goes back to the broker for redelivery; that is
/// the deliberate failure mode when settlement itself fails.
#[async_trait::async_trait]
pub trait DeliveryHandle: Send + Sync {
    /// Acknowledge the delivery; the broker forgets the message
    async fn complete(self: Box<Self>) -> DispatchResult<()>;

    /// Move the delivery to the entity's dead-letter store
    async fn dead_letter(self: Box<Self>, reason: &str) -> DispatchResult<()>;
}

/// One message pulled from the broker, not yet settled
pub struct Delivery {
    pub message_id: Uuid,
    pub body: Bytes,
    pub metadata: MessageMetadata,
    /// Path of the entity this delivery was consumed from
    pub entity_path: String,
    pub handle: Box<dyn DeliveryHandle>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("entity_path", &self.entity_path)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A running consumer for one entity
#[async_trait::async_trait]
pub trait Processor: Send {
    /// Begin pushing deliveries into the channel
    async fn start(&mut self, deliveries: mpsc::Sender<Delivery>) -> DispatchResult<()>;

    /// Stop consuming; in-flight deliveries keep their handles
    async fn stop(&mut self) -> DispatchResult<()>;
}

/// Creates processors bound to broker entities
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Create a processor for a queue, or for a topic subscription when the
    /// key names a topic.
    async fn create_processor(
        &self,
        entity: &EntityKey,
        subscription_name: &str,
        config: &ProcessingConfig,
    ) -> DispatchResult<Box<dyn Processor>>;
}
