//! The dispatch worker: topology, processors, and per-entity loops
//!
//! One loop per registered entity. Each loop pulls deliveries from its
//! processor, runs the resolve/invoke/classify/execute pipeline under a
//! concurrency limit, and drains in-flight work on shutdown within the
//! configured deadline.

use crate::config::WorkerConfig;
use crate::dispatch::classifier::{classify_outcome, pre_filter, ClassifyContext};
use crate::dispatch::executor::ActionExecutor;
use crate::error::DispatchResult;
use crate::handler::{Handler, HandlerDescriptor, HandlerRegistry, Outcome};
use crate::invoke::invoke;
use crate::protocol::{EntityKey, EntityKind};
use crate::resolve::resolve_parameters;
use crate::scope::CollaboratorRegistry;
use crate::transport::{BrokerClient, Delivery, MessageSender, Processor, TopologyManager};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// A fully-registered worker, ready to run against a broker
pub struct BusWorker {
    config: Arc<WorkerConfig>,
    registry: Arc<HandlerRegistry>,
    collaborators: Arc<CollaboratorRegistry>,
    client: Arc<dyn BrokerClient>,
    topology: Arc<dyn TopologyManager>,
    executor: Arc<ActionExecutor>,
}

/// Everything one entity loop needs, shared across its in-flight deliveries
struct EntityContext {
    key: EntityKey,
    handler: Handler,
    max_concurrent: usize,
    config: Arc<WorkerConfig>,
    collaborators: Arc<CollaboratorRegistry>,
    executor: Arc<ActionExecutor>,
}

impl BusWorker {
    pub(crate) fn new(
        config: WorkerConfig,
        registry: HandlerRegistry,
        collaborators: CollaboratorRegistry,
        client: Arc<dyn BrokerClient>,
        topology: Arc<dyn TopologyManager>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            collaborators: Arc::new(collaborators),
            client,
            topology,
            executor: Arc::new(ActionExecutor::new(sender)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Provision topology, start every processor, and dispatch until the
    /// shutdown signal flips to `true` (or its sender drops).
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> DispatchResult<()> {
        let span = crate::worker_span!(app = %self.config.app_name);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, shutdown: watch::Receiver<bool>) -> DispatchResult<()> {
        self.provision_topology().await?;

        // All fallible startup happens before any loop spawns, so a broken
        // registration never leaves half the worker running
        let mut entities = Vec::new();
        for descriptor in self.registry.descriptors() {
            match self.start_processor(descriptor).await {
                Ok(entry) => entities.push(entry),
                Err(e) => {
                    // Stop what already started before surfacing the error
                    for (context, mut processor, _) in entities.drain(..) {
                        if let Err(stop_err) = processor.stop().await {
                            warn!(
                                entity = %context.key,
                                error = %stop_err,
                                "processor did not stop cleanly"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        let mut loops = JoinSet::new();
        for (context, processor, rx) in entities {
            loops.spawn(entity_loop(context, processor, rx, shutdown.clone()));
        }

        while loops.join_next().await.is_some() {}
        info!(app = %self.config.app_name, "worker stopped");
        Ok(())
    }

    async fn start_processor(
        &self,
        descriptor: &HandlerDescriptor,
    ) -> DispatchResult<(Arc<EntityContext>, Box<dyn Processor>, mpsc::Receiver<Delivery>)> {
        let mut processor = self
            .client
            .create_processor(&descriptor.key, &self.config.app_name, &descriptor.processing)
            .await?;
        let capacity = descriptor.processing.prefetch_count.max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);
        processor.start(tx).await?;
        info!(entity = %descriptor.key, "processor started");

        let context = Arc::new(EntityContext {
            key: descriptor.key.clone(),
            handler: descriptor.handler.clone(),
            max_concurrent: descriptor.processing.max_concurrent_calls,
            config: Arc::clone(&self.config),
            collaborators: Arc::clone(&self.collaborators),
            executor: Arc::clone(&self.executor),
        });
        Ok((context, processor, rx))
    }

    async fn provision_topology(&self) -> DispatchResult<()> {
        for descriptor in self.registry.descriptors() {
            match descriptor.key.kind {
                EntityKind::Queue => {
                    self.topology.ensure_queue_exists(&descriptor.key.name).await?;
                }
                EntityKind::Topic => {
                    self.topology.ensure_topic_exists(&descriptor.key.name).await?;
                    self.topology
                        .ensure_subscription_exists(&descriptor.key.name, &self.config.app_name)
                        .await?;
                }
            }
        }
        if let Some(error_queue) = self.config.error_handling.error_queue_name.as_deref() {
            self.topology.ensure_queue_exists(error_queue).await?;
        }
        Ok(())
    }
}

async fn entity_loop(
    context: Arc<EntityContext>,
    mut processor: Box<dyn Processor>,
    mut deliveries: mpsc::Receiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(context.max_concurrent));
    let mut inflight = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                // Acquire inside the loop; backpressure is the limit
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let context = Arc::clone(&context);
                let span = crate::delivery_span!(
                    entity = %context.key,
                    message_id = %delivery.message_id
                );
                inflight.spawn(
                    async move {
                        let _permit = permit;
                        process_delivery(&context, delivery).await;
                    }
                    .instrument(span),
                );
                while inflight.try_join_next().is_some() {}
            }
        }
    }

    if let Err(e) = processor.stop().await {
        warn!(entity = %context.key, error = %e, "processor did not stop cleanly");
    }
    // Unread deliveries drop their handles and return to the broker
    deliveries.close();
    drop(deliveries);

    let deadline = context.config.shutdown_deadline();
    let drained = tokio::time::timeout(deadline, async {
        while inflight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            entity = %context.key,
            deadline_secs = deadline.as_secs(),
            "shutdown deadline elapsed with deliveries in flight"
        );
        inflight.shutdown().await;
    }
    debug!(entity = %context.key, "entity loop stopped");
}

async fn process_delivery(context: &EntityContext, delivery: Delivery) {
    let classify = ClassifyContext {
        entity: &context.key,
        app_name: &context.config.app_name,
        retry: &context.config.retry,
        error_handling: &context.config.error_handling,
    };

    if let Some(action) = pre_filter(
        &classify,
        &delivery.entity_path,
        &delivery.body,
        &delivery.metadata,
        Utc::now(),
    ) {
        debug!(
            entity = %context.key,
            message_id = %delivery.message_id,
            action = ?action,
            "delivery filtered before handler"
        );
        if let Err(e) = context
            .executor
            .execute(&context.key, action, delivery.handle)
            .await
        {
            error!(entity = %context.key, error = %e, "pre-filter action failed; delivery left for redelivery");
        }
        return;
    }

    let mut scope = context.collaborators.create_scope();
    let (outcome, payload_type) =
        match resolve_parameters(context.handler.params(), &mut scope, &delivery.body) {
            Ok(resolved) => {
                let payload_type = resolved
                    .payload_index
                    .map(|i| context.handler.params()[i].type_name);
                (invoke(&context.handler, resolved.args).await, payload_type)
            }
            Err(e) => (Outcome::from_error(e), None),
        };

    match &outcome {
        Outcome::Success => debug!(
            entity = %context.key,
            message_id = %delivery.message_id,
            "delivery handled"
        ),
        Outcome::RetryableFailure { reason } => warn!(
            entity = %context.key,
            message_id = %delivery.message_id,
            attempt = delivery.metadata.retry_count(),
            reason = %reason,
            "delivery failed; scheduling retry"
        ),
        Outcome::CompleteFailure { reason, .. } => error!(
            entity = %context.key,
            message_id = %delivery.message_id,
            reason = %reason,
            "delivery failed terminally"
        ),
        Outcome::Deferred { .. } => debug!(
            entity = %context.key,
            message_id = %delivery.message_id,
            "delivery deferred"
        ),
    }

    let message_type = payload_type.or_else(|| delivery.metadata.message_type());
    let action = classify_outcome(
        &classify,
        &delivery.body,
        &delivery.metadata,
        message_type,
        &outcome,
        Utc::now(),
    );
    if let Err(e) = context
        .executor
        .execute(&context.key, action, delivery.handle)
        .await
    {
        error!(entity = %context.key, error = %e, "action execution failed; delivery left for redelivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::handler::Param;
    use crate::testing::mocks::{MockBrokerClient, MockSender, MockTopologyManager};
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    struct Invoice {
        #[allow(dead_code)]
        total: u32,
    }

    fn worker(registry: HandlerRegistry, config: WorkerConfig) -> (BusWorker, Arc<MockTopologyManager>, Arc<MockBrokerClient>) {
        let topology = Arc::new(MockTopologyManager::new());
        let client = Arc::new(MockBrokerClient::new());
        let worker = BusWorker::new(
            config,
            registry,
            CollaboratorRegistry::new(),
            client.clone(),
            topology.clone(),
            Arc::new(MockSender::new()),
        );
        (worker, topology, client)
    }

    #[tokio::test]
    async fn test_topology_provisioned_per_kind() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                EntityKey::queue("invoices"),
                Handler::of1(Param::<Invoice>::message("invoice"), |_: Invoice| async {}),
                ProcessingConfig::default(),
            )
            .unwrap();
        registry
            .register(
                EntityKey::topic("events"),
                Handler::of1(Param::<Invoice>::message("invoice"), |_: Invoice| async {}),
                ProcessingConfig::default(),
            )
            .unwrap();

        let mut config = WorkerConfig::new("billing");
        config.error_handling.error_queue_name = Some("billing-error".to_string());
        let (worker, topology, client) = worker(registry, config);

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(worker.run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // The idle processors may have closed their channels already, in
        // which case the worker has stopped on its own
        let _ = tx.send(true);
        run.await.unwrap().unwrap();

        let queues = topology.queues();
        assert!(queues.contains(&"invoices".to_string()));
        assert!(queues.contains(&"billing-error".to_string()));
        assert_eq!(topology.topics(), vec!["events".to_string()]);
        assert_eq!(
            topology.subscriptions(),
            vec![("events".to_string(), "billing".to_string())]
        );

        // Topic processors subscribe under the app name
        let requests = client.requests();
        assert!(requests
            .iter()
            .any(|(key, sub)| key == &EntityKey::topic("events") && sub == "billing"));
    }

    #[tokio::test]
    async fn test_startup_failure_stops_started_processors() {
        use crate::error::DispatchError;
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        struct TrackedProcessor {
            stopped: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl Processor for TrackedProcessor {
            async fn start(&mut self, _deliveries: mpsc::Sender<Delivery>) -> DispatchResult<()> {
                Ok(())
            }

            async fn stop(&mut self) -> DispatchResult<()> {
                self.stopped.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        /// Hands out one processor, then fails every further request
        struct FlakyClient {
            calls: AtomicUsize,
            stopped: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl BrokerClient for FlakyClient {
            async fn create_processor(
                &self,
                _entity: &EntityKey,
                _subscription_name: &str,
                _config: &ProcessingConfig,
            ) -> DispatchResult<Box<dyn Processor>> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Box::new(TrackedProcessor {
                        stopped: Arc::clone(&self.stopped),
                    }))
                } else {
                    Err(DispatchError::transport("create_processor", "broker unavailable"))
                }
            }
        }

        let mut registry = HandlerRegistry::new();
        registry
            .register(
                EntityKey::queue("invoices"),
                Handler::of0(|| async {}),
                ProcessingConfig::default(),
            )
            .unwrap();
        registry
            .register(
                EntityKey::queue("receipts"),
                Handler::of0(|| async {}),
                ProcessingConfig::default(),
            )
            .unwrap();

        let stopped = Arc::new(AtomicBool::new(false));
        let client = Arc::new(FlakyClient {
            calls: AtomicUsize::new(0),
            stopped: Arc::clone(&stopped),
        });
        let worker = BusWorker::new(
            WorkerConfig::new("billing"),
            registry,
            CollaboratorRegistry::new(),
            client,
            Arc::new(MockTopologyManager::new()),
            Arc::new(MockSender::new()),
        );

        let (_tx, rx) = watch::channel(false);
        assert!(worker.run(rx).await.is_err());
        // The processor that did start must not leak its pump task
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                EntityKey::queue("invoices"),
                Handler::of0(|| async {}),
                ProcessingConfig::default(),
            )
            .unwrap();
        let (worker, _topology, _client) = worker(registry, WorkerConfig::new("billing"));

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(worker.run(rx));
        let _ = tx.send(true);
        tokio::time::timeout(std::time::Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
