//! Action execution: the impure half of dispatch
//!
//! Carries out classified actions against the transport. Send and settle
//! failures are logged and propagated without acknowledging the delivery,
//! so the broker redelivers instead of losing the message.

use crate::dispatch::classifier::Action;
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{BrokerMessage, EntityKey, EntityKind};
use crate::transport::{DeliveryHandle, MessageSender};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct ActionExecutor {
    sender: Arc<dyn MessageSender>,
}

impl ActionExecutor {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    /// Execute one action, consuming the delivery's handle.
    ///
    /// The original delivery is acknowledged only after any derived message
    /// has been accepted by the broker.
    pub async fn execute(
        &self,
        entity: &EntityKey,
        action: Action,
        handle: Box<dyn DeliveryHandle>,
    ) -> DispatchResult<()> {
        match action {
            Action::Complete => {
                self.settle(entity, handle.complete().await, "complete")
            }
            Action::Ignore { reason } => {
                warn!(entity = %entity, reason = %reason, "leaving delivery unsettled");
                drop(handle);
                Ok(())
            }
            Action::Republish { message } => {
                self.republish(entity, message).await?;
                self.settle(entity, handle.complete().await, "complete")
            }
            Action::DeadLetter { reason } => {
                debug!(entity = %entity, reason = %reason, "dead-lettering delivery");
                self.settle(entity, handle.dead_letter(&reason).await, "dead_letter")
            }
            Action::RouteToErrorQueue { queue, record } => {
                let message = BrokerMessage::json(&record).map_err(|e| {
                    DispatchError::transport("encode_error_record", e.to_string())
                })?;
                debug!(entity = %entity, error_queue = %queue, "routing failure to error queue");
                self.send(&queue, message).await?;
                self.settle(entity, handle.complete().await, "complete")
            }
        }
    }

    async fn republish(&self, entity: &EntityKey, message: BrokerMessage) -> DispatchResult<()> {
        let result = match entity.kind {
            EntityKind::Queue => self.sender.send_to_queue(&entity.name, message).await,
            EntityKind::Topic => self.sender.publish_to_topic(&entity.name, message).await,
        };
        if let Err(e) = &result {
            error!(entity = %entity, error = %e, "failed to republish derived message");
        }
        result
    }

    async fn send(&self, queue: &str, message: BrokerMessage) -> DispatchResult<()> {
        let result = self.sender.send_to_queue(queue, message).await;
        if let Err(e) = &result {
            error!(queue = %queue, error = %e, "failed to send to error queue");
        }
        result
    }

    fn settle(
        &self,
        entity: &EntityKey,
        result: DispatchResult<()>,
        operation: &str,
    ) -> DispatchResult<()> {
        if let Err(e) = &result {
            error!(entity = %entity, operation = %operation, error = %e, "failed to settle delivery");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorRecord;
    use crate::testing::mocks::{MockDeliveryHandle, MockSender, Settlement};
    use bytes::Bytes;
    use chrono::Utc;

    fn record() -> ErrorRecord {
        ErrorRecord {
            original_message: "{}".to_string(),
            original_message_type: None,
            originating_entity_path: "invoices".to_string(),
            originating_app: "billing".to_string(),
            exception_message: "boom".to_string(),
            exception_type: "HandlerInvocationFailed".to_string(),
            exception_stack_trace: None,
            inner_exception_message: None,
            occurred: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_complete() {
        let sender = Arc::new(MockSender::new());
        let executor = ActionExecutor::new(sender.clone());
        let (handle, settled) = MockDeliveryHandle::new();

        executor
            .execute(&EntityKey::queue("invoices"), Action::Complete, handle)
            .await
            .unwrap();
        assert_eq!(settled.get(), Some(Settlement::Completed));
        assert!(sender.queue_sends().is_empty());
    }

    #[tokio::test]
    async fn test_ignore_leaves_unsettled() {
        let sender = Arc::new(MockSender::new());
        let executor = ActionExecutor::new(sender);
        let (handle, settled) = MockDeliveryHandle::new();

        executor
            .execute(
                &EntityKey::topic("events"),
                Action::Ignore {
                    reason: "misrouted".to_string(),
                },
                handle,
            )
            .await
            .unwrap();
        assert_eq!(settled.get(), None);
    }

    #[tokio::test]
    async fn test_republish_to_queue_then_complete() {
        let sender = Arc::new(MockSender::new());
        let executor = ActionExecutor::new(sender.clone());
        let (handle, settled) = MockDeliveryHandle::new();

        executor
            .execute(
                &EntityKey::queue("invoices"),
                Action::Republish {
                    message: BrokerMessage::new(Bytes::from_static(b"{}")),
                },
                handle,
            )
            .await
            .unwrap();
        let sends = sender.queue_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "invoices");
        assert_eq!(settled.get(), Some(Settlement::Completed));
    }

    #[tokio::test]
    async fn test_republish_to_topic_uses_publish() {
        let sender = Arc::new(MockSender::new());
        let executor = ActionExecutor::new(sender.clone());
        let (handle, settled) = MockDeliveryHandle::new();

        executor
            .execute(
                &EntityKey::topic("events"),
                Action::Republish {
                    message: BrokerMessage::new(Bytes::from_static(b"{}")),
                },
                handle,
            )
            .await
            .unwrap();
        assert!(sender.queue_sends().is_empty());
        assert_eq!(sender.topic_publishes().len(), 1);
        assert_eq!(settled.get(), Some(Settlement::Completed));
    }

    #[tokio::test]
    async fn test_send_failure_keeps_delivery_unsettled() {
        let sender = Arc::new(MockSender::failing());
        let executor = ActionExecutor::new(sender);
        let (handle, settled) = MockDeliveryHandle::new();

        let result = executor
            .execute(
                &EntityKey::queue("invoices"),
                Action::Republish {
                    message: BrokerMessage::new(Bytes::from_static(b"{}")),
                },
                handle,
            )
            .await;
        assert!(matches!(result, Err(DispatchError::TransportFailure { .. })));
        assert_eq!(settled.get(), None);
    }

    #[tokio::test]
    async fn test_dead_letter_passes_reason() {
        let sender = Arc::new(MockSender::new());
        let executor = ActionExecutor::new(sender);
        let (handle, settled) = MockDeliveryHandle::new();

        executor
            .execute(
                &EntityKey::queue("invoices"),
                Action::DeadLetter {
                    reason: "unparseable".to_string(),
                },
                handle,
            )
            .await
            .unwrap();
        assert_eq!(
            settled.get(),
            Some(Settlement::DeadLettered("unparseable".to_string()))
        );
    }

    #[tokio::test]
    async fn test_error_queue_record_then_complete() {
        let sender = Arc::new(MockSender::new());
        let executor = ActionExecutor::new(sender.clone());
        let (handle, settled) = MockDeliveryHandle::new();

        executor
            .execute(
                &EntityKey::queue("invoices"),
                Action::RouteToErrorQueue {
                    queue: "billing-error".to_string(),
                    record: record(),
                },
                handle,
            )
            .await
            .unwrap();

        let sends = sender.queue_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "billing-error");
        let parsed: ErrorRecord = serde_json::from_slice(&sends[0].1.body).unwrap();
        assert_eq!(parsed.exception_message, "boom");
        assert_eq!(settled.get(), Some(Settlement::Completed));
    }
}
