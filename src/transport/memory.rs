//! In-memory broker for local runs and tests
//!
//! Implements the full transport surface against process-local state.
//! Queues and topic subscriptions are plain FIFO buffers; scheduled
//! messages stay invisible until their enqueue time passes. A delivery
//! handle dropped without settlement puts the message back at the front of
//! its buffer, mirroring broker lock expiry.

use crate::config::ProcessingConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{BrokerMessage, EntityKey, EntityKind};
use crate::transport::{
    BrokerClient, Delivery, DeliveryHandle, MessageSender, Processor, TopologyManager,
};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// A message parked in an entity's dead-letter store
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub message: BrokerMessage,
    pub reason: String,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<BrokerMessage>>,
    topics: HashMap<String, HashMap<String, VecDeque<BrokerMessage>>>,
    dead_letters: HashMap<String, Vec<DeadLetteredMessage>>,
}

/// Where a processor or delivery handle reads from / returns to
#[derive(Debug, Clone)]
enum Source {
    Queue(String),
    Subscription { topic: String, subscription: String },
}

impl BrokerState {
    fn buffer_mut(&mut self, source: &Source) -> Option<&mut VecDeque<BrokerMessage>> {
        match source {
            Source::Queue(name) => self.queues.get_mut(name),
            Source::Subscription {
                topic,
                subscription,
            } => self.topics.get_mut(topic)?.get_mut(subscription),
        }
    }

    /// Remove and return the first message whose scheduled time has passed
    fn pop_ready(&mut self, source: &Source) -> Option<BrokerMessage> {
        let buffer = self.buffer_mut(source)?;
        let now = Utc::now();
        let position = buffer
            .iter()
            .position(|m| m.scheduled_enqueue_time.map_or(true, |at| at <= now))?;
        buffer.remove(position)
    }
}

/// Process-local broker; cheap to clone, all clones share state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        // Lock is only held for map edits; a poisoned lock means a panic
        // mid-edit and the test run is already lost
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages currently buffered in a queue, including scheduled ones
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.lock().queues.get(queue_name).map_or(0, VecDeque::len)
    }

    /// Snapshot of a queue's buffered messages
    pub fn peek_queue(&self, queue_name: &str) -> Vec<BrokerMessage> {
        self.lock()
            .queues
            .get(queue_name)
            .map_or_else(Vec::new, |q| q.iter().cloned().collect())
    }

    /// Snapshot of one subscription's buffered messages
    pub fn peek_subscription(&self, topic_name: &str, subscription_name: &str) -> Vec<BrokerMessage> {
        self.lock()
            .topics
            .get(topic_name)
            .and_then(|subs| subs.get(subscription_name))
            .map_or_else(Vec::new, |q| q.iter().cloned().collect())
    }

    /// Messages dead-lettered from the given entity path
    pub fn dead_letters(&self, entity_path: &str) -> Vec<DeadLetteredMessage> {
        self.lock()
            .dead_letters
            .get(entity_path)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TopologyManager for InMemoryBroker {
    async fn ensure_queue_exists(&self, queue_name: &str) -> DispatchResult<()> {
        self.lock().queues.entry(queue_name.to_string()).or_default();
        Ok(())
    }

    async fn ensure_topic_exists(&self, topic_name: &str) -> DispatchResult<()> {
        self.lock().topics.entry(topic_name.to_string()).or_default();
        Ok(())
    }

    async fn ensure_subscription_exists(
        &self,
        topic_name: &str,
        subscription_name: &str,
    ) -> DispatchResult<()> {
        self.lock()
            .topics
            .entry(topic_name.to_string())
            .or_default()
            .entry(subscription_name.to_string())
            .or_default();
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageSender for InMemoryBroker {
    async fn send_to_queue(&self, queue_name: &str, message: BrokerMessage) -> DispatchResult<()> {
        self.lock()
            .queues
            .entry(queue_name.to_string())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn publish_to_topic(
        &self,
        topic_name: &str,
        message: BrokerMessage,
    ) -> DispatchResult<()> {
        // A topic with no subscriptions swallows the message, as brokers do
        let mut state = self.lock();
        let subscriptions = state.topics.entry(topic_name.to_string()).or_default();
        for buffer in subscriptions.values_mut() {
            buffer.push_back(message.clone());
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerClient for InMemoryBroker {
    async fn create_processor(
        &self,
        entity: &EntityKey,
        subscription_name: &str,
        _config: &ProcessingConfig,
    ) -> DispatchResult<Box<dyn Processor>> {
        let source = match entity.kind {
            EntityKind::Queue => {
                self.ensure_queue_exists(&entity.name).await?;
                Source::Queue(entity.name.clone())
            }
            EntityKind::Topic => {
                self.ensure_subscription_exists(&entity.name, subscription_name)
                    .await?;
                Source::Subscription {
                    topic: entity.name.clone(),
                    subscription: subscription_name.to_string(),
                }
            }
        };
        Ok(Box::new(MemoryProcessor {
            broker: self.clone(),
            source,
            entity_path: entity.name.clone(),
            task: None,
            stop: Arc::new(Notify::new()),
        }))
    }
}

struct MemoryProcessor {
    broker: InMemoryBroker,
    source: Source,
    entity_path: String,
    task: Option<JoinHandle<()>>,
    stop: Arc<Notify>,
}

#[async_trait::async_trait]
impl Processor for MemoryProcessor {
    async fn start(&mut self, deliveries: mpsc::Sender<Delivery>) -> DispatchResult<()> {
        if self.task.is_some() {
            return Err(DispatchError::transport(
                "start_processor",
                format!("processor for {} already started", self.entity_path),
            ));
        }
        let broker = self.broker.clone();
        let source = self.source.clone();
        let entity_path = self.entity_path.clone();
        let stop = Arc::clone(&self.stop);

        self.task = Some(tokio::spawn(async move {
            loop {
                let message = broker.lock().pop_ready(&source);
                match message {
                    Some(message) => {
                        let delivery = Delivery {
                            message_id: message.message_id,
                            body: message.body.clone(),
                            metadata: message.metadata.clone(),
                            entity_path: entity_path.clone(),
                            handle: Box::new(MemoryDeliveryHandle {
                                broker: broker.clone(),
                                source: source.clone(),
                                entity_path: entity_path.clone(),
                                message: Some(message),
                            }),
                        };
                        // Dropping an unsent delivery requeues it through
                        // the handle's Drop
                        if deliveries.send(delivery).await.is_err() {
                            debug!(entity = %entity_path, "delivery channel closed");
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = stop.notified() => break,
                            _ = broker.notify.notified() => {}
                            // Periodic wake so scheduled messages surface
                            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> DispatchResult<()> {
        self.stop.notify_waiters();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

struct MemoryDeliveryHandle {
    broker: InMemoryBroker,
    source: Source,
    entity_path: String,
    /// Present until the delivery settles; requeued on drop otherwise
    message: Option<BrokerMessage>,
}

#[async_trait::async_trait]
impl DeliveryHandle for MemoryDeliveryHandle {
    async fn complete(mut self: Box<Self>) -> DispatchResult<()> {
        self.message.take();
        Ok(())
    }

    async fn dead_letter(mut self: Box<Self>, reason: &str) -> DispatchResult<()> {
        if let Some(message) = self.message.take() {
            self.broker
                .lock()
                .dead_letters
                .entry(self.entity_path.clone())
                .or_default()
                .push(DeadLetteredMessage {
                    message,
                    reason: reason.to_string(),
                });
        }
        Ok(())
    }
}

/// How long an unsettled message stays invisible before redelivery
fn redelivery_delay() -> chrono::Duration {
    chrono::Duration::milliseconds(50)
}

impl Drop for MemoryDeliveryHandle {
    fn drop(&mut self) {
        if let Some(mut message) = self.message.take() {
            // Lock expiry takes time on a real broker; without the pause an
            // ignored message would bounce between pop and requeue nonstop
            message.scheduled_enqueue_time = Some(Utc::now() + redelivery_delay());
            let mut state = self.broker.lock();
            if let Some(buffer) = state.buffer_mut(&self.source) {
                buffer.push_front(message);
            }
            drop(state);
            self.broker.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(body: &'static [u8]) -> BrokerMessage {
        BrokerMessage::new(Bytes::from_static(body))
    }

    async fn started_queue_processor(
        broker: &InMemoryBroker,
        queue: &str,
    ) -> (Box<dyn Processor>, mpsc::Receiver<Delivery>) {
        let mut processor = broker
            .create_processor(
                &EntityKey::queue(queue),
                "unused",
                &ProcessingConfig::default(),
            )
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(8);
        processor.start(tx).await.unwrap();
        (processor, rx)
    }

    #[tokio::test]
    async fn test_queue_delivery_and_complete() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", message(b"one")).await.unwrap();

        let (mut processor, mut rx) = started_queue_processor(&broker, "orders").await;
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body.as_ref(), b"one");
        assert_eq!(delivery.entity_path, "orders");

        delivery.handle.complete().await.unwrap();
        assert_eq!(broker.queue_depth("orders"), 0);
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsettled_delivery_requeues() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", message(b"one")).await.unwrap();

        let (mut processor, mut rx) = started_queue_processor(&broker, "orders").await;
        let delivery = rx.recv().await.unwrap();
        processor.stop().await.unwrap();
        drop(rx);
        drop(delivery);

        assert_eq!(broker.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn test_unsettled_delivery_redelivers_after_pause() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", message(b"one")).await.unwrap();

        let (mut processor, mut rx) = started_queue_processor(&broker, "orders").await;
        let delivery = rx.recv().await.unwrap();
        drop(delivery);

        // Invisible for the redelivery pause, then back
        assert!(
            tokio::time::timeout(Duration::from_millis(20), rx.recv())
                .await
                .is_err()
        );
        let redelivered = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.body.as_ref(), b"one");
        redelivered.handle.complete().await.unwrap();
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_records_reason() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", message(b"bad")).await.unwrap();

        let (mut processor, mut rx) = started_queue_processor(&broker, "orders").await;
        let delivery = rx.recv().await.unwrap();
        delivery.handle.dead_letter("unparseable").await.unwrap();
        processor.stop().await.unwrap();

        let parked = broker.dead_letters("orders");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].reason, "unparseable");
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_subscriptions() {
        let broker = InMemoryBroker::new();
        broker.ensure_subscription_exists("events", "app-a").await.unwrap();
        broker.ensure_subscription_exists("events", "app-b").await.unwrap();

        broker.publish_to_topic("events", message(b"e")).await.unwrap();
        assert_eq!(broker.peek_subscription("events", "app-a").len(), 1);
        assert_eq!(broker.peek_subscription("events", "app-b").len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_message_invisible_until_due() {
        let broker = InMemoryBroker::new();
        let due = Utc::now() + chrono::Duration::milliseconds(80);
        broker
            .send_to_queue("orders", message(b"later").scheduled_for(due))
            .await
            .unwrap();

        let (mut processor, mut rx) = started_queue_processor(&broker, "orders").await;
        assert!(
            tokio::time::timeout(Duration::from_millis(30), rx.recv())
                .await
                .is_err()
        );

        let delivery = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body.as_ref(), b"later");
        delivery.handle.complete().await.unwrap();
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_topic_without_subscriptions_drops() {
        let broker = InMemoryBroker::new();
        broker.ensure_topic_exists("events").await.unwrap();
        broker.publish_to_topic("events", message(b"e")).await.unwrap();
        assert!(broker.peek_subscription("events", "anyone").is_empty());
    }
}
