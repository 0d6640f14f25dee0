//! Fluent worker registration
//!
//! Binds handlers to entities, tunes policy, and assembles a [`BusWorker`].
//! Each registration snapshots the processing template as it stands, so
//! later template changes never reach back into earlier registrations.
//! Registration errors are remembered and surfaced at [`build`], keeping
//! the chain fluent.
//!
//! [`build`]: WorkerRegistration::build

use crate::config::{ProcessingConfig, RetryConfig, WorkerConfig};
use crate::dispatch::BusWorker;
use crate::error::{DispatchError, DispatchResult};
use crate::handler::{Handler, HandlerRegistry};
use crate::protocol::EntityKey;
use crate::scope::CollaboratorRegistry;
use crate::transport::{BrokerClient, MessageSender, TopologyManager};
use std::sync::Arc;

pub struct WorkerRegistration {
    config: WorkerConfig,
    registry: HandlerRegistry,
    collaborators: CollaboratorRegistry,
    first_error: Option<DispatchError>,
}

impl WorkerRegistration {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            collaborators: CollaboratorRegistry::new(),
            first_error: None,
        }
    }

    /// Bind a handler to a queue
    pub fn process_queue(self, queue_name: impl Into<String>, handler: Handler) -> Self {
        let processing = self.config.processing.clone();
        self.register(EntityKey::queue(queue_name), handler, processing)
    }

    /// Bind a handler to a queue with per-entity processing overrides
    pub fn process_queue_with(
        self,
        queue_name: impl Into<String>,
        handler: Handler,
        configure: impl FnOnce(&mut ProcessingConfig),
    ) -> Self {
        let mut processing = self.config.processing.clone();
        configure(&mut processing);
        self.register(EntityKey::queue(queue_name), handler, processing)
    }

    /// Bind a handler to a topic; the subscription is named after the app
    pub fn subscribe_topic(self, topic_name: impl Into<String>, handler: Handler) -> Self {
        let processing = self.config.processing.clone();
        self.register(EntityKey::topic(topic_name), handler, processing)
    }

    /// Bind a handler to a topic with per-entity processing overrides
    pub fn subscribe_topic_with(
        self,
        topic_name: impl Into<String>,
        handler: Handler,
        configure: impl FnOnce(&mut ProcessingConfig),
    ) -> Self {
        let mut processing = self.config.processing.clone();
        configure(&mut processing);
        self.register(EntityKey::topic(topic_name), handler, processing)
    }

    fn register(
        mut self,
        key: EntityKey,
        handler: Handler,
        processing: ProcessingConfig,
    ) -> Self {
        if let Err(e) = self.registry.register(key, handler, processing) {
            self.first_error.get_or_insert(e);
        }
        self
    }

    /// Adjust the processing template used by subsequent registrations
    pub fn with_default_processing(
        mut self,
        configure: impl FnOnce(&mut ProcessingConfig),
    ) -> Self {
        configure(&mut self.config.processing);
        self
    }

    /// Adjust the worker-wide retry policy
    pub fn with_retry(mut self, configure: impl FnOnce(&mut RetryConfig)) -> Self {
        configure(&mut self.config.retry);
        self
    }

    /// Route terminal failures to the app's default error queue
    /// ("{app_name}-error") and enable routing for unhandled failures
    pub fn enable_error_handling(self) -> Self {
        let queue = self.config.default_error_queue();
        self.enable_error_handling_to(queue)
    }

    /// Same as [`enable_error_handling`], with an explicit queue name
    ///
    /// [`enable_error_handling`]: WorkerRegistration::enable_error_handling
    pub fn enable_error_handling_to(mut self, queue_name: impl Into<String>) -> Self {
        self.config.error_handling.error_queue_name = Some(queue_name.into());
        self.config.error_handling.send_unhandled_to_error_queue = true;
        self
    }

    /// Replace the collaborator registry wholesale
    pub fn collaborators(mut self, registry: CollaboratorRegistry) -> Self {
        self.collaborators = registry;
        self
    }

    /// Register a shared collaborator available to every delivery
    pub fn collaborator<T: Send + Sync + 'static>(mut self, value: Arc<T>) -> Self {
        self.collaborators.register(value);
        self
    }

    /// Register a factory producing one instance per delivery
    pub fn scoped_collaborator<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.collaborators.register_scoped(factory);
        self
    }

    /// Validate everything and assemble the worker
    pub fn build(
        self,
        client: Arc<dyn BrokerClient>,
        topology: Arc<dyn TopologyManager>,
        sender: Arc<dyn MessageSender>,
    ) -> DispatchResult<BusWorker> {
        if let Some(e) = self.first_error {
            return Err(e);
        }
        self.config
            .validate()
            .map_err(|e| DispatchError::configuration(e.to_string()))?;
        Ok(BusWorker::new(
            self.config,
            self.registry,
            self.collaborators,
            client,
            topology,
            sender,
        ))
    }
}
