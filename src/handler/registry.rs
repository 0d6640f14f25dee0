//! Entity-to-handler registration table
//!
//! Built once during worker registration, read-only afterwards. One handler
//! per entity; a second registration for the same queue or subscription is a
//! configuration error surfaced at build time, not at dispatch time.

use crate::config::ProcessingConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::handler::Handler;
use crate::protocol::EntityKey;
use std::collections::HashMap;

/// One registered entity: its handler plus per-entity processing options
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub key: EntityKey,
    pub handler: Handler,
    pub processing: ProcessingConfig,
}

/// All handler registrations for a worker
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EntityKey, HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        key: EntityKey,
        handler: Handler,
        processing: ProcessingConfig,
    ) -> DispatchResult<()> {
        if self.handlers.contains_key(&key) {
            return Err(DispatchError::DuplicateRegistration(key));
        }
        self.handlers.insert(
            key.clone(),
            HandlerDescriptor {
                key,
                handler,
                processing,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, key: &EntityKey) -> DispatchResult<&HandlerDescriptor> {
        self.handlers
            .get(key)
            .ok_or_else(|| DispatchError::UnknownEntity(key.clone()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityKey> {
        self.handlers.keys()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
