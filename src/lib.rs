//! Minibus - message dispatch with outcome-driven retries
//!
//! A lightweight layer between a queue/topic broker and application message
//! handlers. Handlers return semantic outcomes instead of driving broker
//! settlement themselves; the dispatch pipeline turns those outcomes into
//! acknowledgements, counted retries with backoff, deferrals, dead-letters,
//! or error-queue records.
//!
//! # Overview
//!
//! This crate provides:
//! - A fluent registration surface binding handlers to queues and topic
//!   subscriptions
//! - Flexible handler signatures with collaborator injection and automatic
//!   payload deserialization
//! - An outcome state machine (`Success`, `RetryableFailure`,
//!   `CompleteFailure`, `Deferred`) with wire-level retry metadata
//! - A typed sending client routing payload types to bound destinations
//! - Transport traits plus an in-memory broker for local runs and tests
//!
//! # Quick Start
//!
//! ```rust
//! use minibus::config::WorkerConfig;
//! use minibus::handler::{Handler, Outcome, Param};
//! use minibus::registration::WorkerRegistration;
//! use minibus::transport::InMemoryBroker;
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct Invoice {
//!     total: u32,
//! }
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let worker = WorkerRegistration::new(WorkerConfig::new("billing"))
//!     .with_retry(|retry| retry.max_retries = 3)
//!     .enable_error_handling()
//!     .process_queue(
//!         "invoices",
//!         Handler::of1(Param::<Invoice>::message("invoice"), |invoice: Invoice| async move {
//!             if invoice.total == 0 {
//!                 return Outcome::retry("total not yet posted");
//!             }
//!             Outcome::Success
//!         }),
//!     )
//!     .build(broker.clone(), broker.clone(), broker)
//!     .unwrap();
//!
//! // worker.run(shutdown_receiver).await drives dispatch until shutdown
//! # let _ = worker;
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod invoke;
pub mod observability;
pub mod protocol;
pub mod registration;
pub mod resolve;
pub mod scope;
pub mod testing;
pub mod transport;

pub use client::{MessageClient, SendBindings};
pub use config::{
    ErrorHandlingConfig, ProcessingConfig, RetryConfig, RetryStrategy, WorkerConfig,
};
pub use dispatch::BusWorker;
pub use error::{DispatchError, DispatchResult};
pub use handler::{Handler, IntoOutcome, Outcome, Param};
pub use protocol::{BrokerMessage, EntityKey, EntityKind, ErrorRecord, MessageMetadata};
pub use registration::WorkerRegistration;
pub use scope::{CollaboratorRegistry, DeliveryScope};
pub use transport::{
    BrokerClient, Delivery, DeliveryHandle, InMemoryBroker, MessageSender, Processor,
    TopologyManager,
};
