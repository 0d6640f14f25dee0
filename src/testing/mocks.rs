//! Recording mocks for the transport traits
//!
//! Each mock records the calls it receives behind an `Arc<Mutex<_>>` so a
//! test can hand the mock to the code under test and inspect the recording
//! afterwards. `failing()` constructors simulate a broker outage.

use crate::config::ProcessingConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{BrokerMessage, EntityKey};
use crate::transport::{
    BrokerClient, Delivery, DeliveryHandle, MessageSender, Processor, TopologyManager,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records sends and publishes; optionally fails every operation
#[derive(Default)]
pub struct MockSender {
    queue_sends: Mutex<Vec<(String, BrokerMessage)>>,
    topic_publishes: Mutex<Vec<(String, BrokerMessage)>>,
    fail: bool,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sender whose every operation reports a transport failure
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn queue_sends(&self) -> Vec<(String, BrokerMessage)> {
        lock(&self.queue_sends).clone()
    }

    pub fn topic_publishes(&self) -> Vec<(String, BrokerMessage)> {
        lock(&self.topic_publishes).clone()
    }
}

#[async_trait::async_trait]
impl MessageSender for MockSender {
    async fn send_to_queue(&self, queue_name: &str, message: BrokerMessage) -> DispatchResult<()> {
        if self.fail {
            return Err(DispatchError::transport("send_to_queue", "broker unavailable"));
        }
        lock(&self.queue_sends).push((queue_name.to_string(), message));
        Ok(())
    }

    async fn publish_to_topic(
        &self,
        topic_name: &str,
        message: BrokerMessage,
    ) -> DispatchResult<()> {
        if self.fail {
            return Err(DispatchError::transport("publish_to_topic", "broker unavailable"));
        }
        lock(&self.topic_publishes).push((topic_name.to_string(), message));
        Ok(())
    }
}

/// How a mock delivery ended up settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    DeadLettered(String),
}

/// Shared view of a mock delivery's settlement state
#[derive(Clone, Default)]
pub struct SettlementProbe {
    state: Arc<Mutex<Option<Settlement>>>,
}

impl SettlementProbe {
    pub fn get(&self) -> Option<Settlement> {
        lock(&self.state).clone()
    }
}

/// Delivery handle that records how it was settled
pub struct MockDeliveryHandle {
    probe: SettlementProbe,
    fail: bool,
}

impl MockDeliveryHandle {
    pub fn new() -> (Box<dyn DeliveryHandle>, SettlementProbe) {
        let probe = SettlementProbe::default();
        (
            Box::new(Self {
                probe: probe.clone(),
                fail: false,
            }),
            probe,
        )
    }

    /// A handle whose settlement operations fail
    pub fn failing() -> (Box<dyn DeliveryHandle>, SettlementProbe) {
        let probe = SettlementProbe::default();
        (
            Box::new(Self {
                probe: probe.clone(),
                fail: true,
            }),
            probe,
        )
    }
}

#[async_trait::async_trait]
impl DeliveryHandle for MockDeliveryHandle {
    async fn complete(self: Box<Self>) -> DispatchResult<()> {
        if self.fail {
            return Err(DispatchError::transport("complete", "lock lost"));
        }
        *lock(&self.probe.state) = Some(Settlement::Completed);
        Ok(())
    }

    async fn dead_letter(self: Box<Self>, reason: &str) -> DispatchResult<()> {
        if self.fail {
            return Err(DispatchError::transport("dead_letter", "lock lost"));
        }
        *lock(&self.probe.state) = Some(Settlement::DeadLettered(reason.to_string()));
        Ok(())
    }
}

/// Records topology provisioning calls
#[derive(Default)]
pub struct MockTopologyManager {
    queues: Mutex<Vec<String>>,
    topics: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<(String, String)>>,
}

impl MockTopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queues(&self) -> Vec<String> {
        lock(&self.queues).clone()
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.topics).clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        lock(&self.subscriptions).clone()
    }
}

#[async_trait::async_trait]
impl TopologyManager for MockTopologyManager {
    async fn ensure_queue_exists(&self, queue_name: &str) -> DispatchResult<()> {
        lock(&self.queues).push(queue_name.to_string());
        Ok(())
    }

    async fn ensure_topic_exists(&self, topic_name: &str) -> DispatchResult<()> {
        lock(&self.topics).push(topic_name.to_string());
        Ok(())
    }

    async fn ensure_subscription_exists(
        &self,
        topic_name: &str,
        subscription_name: &str,
    ) -> DispatchResult<()> {
        lock(&self.subscriptions).push((topic_name.to_string(), subscription_name.to_string()));
        Ok(())
    }
}

/// Hands out no-op processors and records what was requested
#[derive(Default)]
pub struct MockBrokerClient {
    requests: Mutex<Vec<(EntityKey, String)>>,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(EntityKey, String)> {
        lock(&self.requests).clone()
    }
}

#[async_trait::async_trait]
impl BrokerClient for MockBrokerClient {
    async fn create_processor(
        &self,
        entity: &EntityKey,
        subscription_name: &str,
        _config: &ProcessingConfig,
    ) -> DispatchResult<Box<dyn Processor>> {
        lock(&self.requests).push((entity.clone(), subscription_name.to_string()));
        Ok(Box::new(IdleProcessor))
    }
}

/// Processor that never produces a delivery
struct IdleProcessor;

#[async_trait::async_trait]
impl Processor for IdleProcessor {
    async fn start(&mut self, _deliveries: mpsc::Sender<Delivery>) -> DispatchResult<()> {
        Ok(())
    }

    async fn stop(&mut self) -> DispatchResult<()> {
        Ok(())
    }
}
