//! Collaborator provider and per-delivery resolution scope
//!
//! The registry is process-wide and read-only after startup. Each delivery
//! gets its own `DeliveryScope`: scoped factories run at most once per scope
//! and their products are dropped with the scope after the delivery's action
//! executes, whichever outcome path was taken.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type Shared = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn() -> Shared + Send + Sync>;

/// Process-wide collaborator registrations
#[derive(Default)]
pub struct CollaboratorRegistry {
    singletons: HashMap<TypeId, Shared>,
    factories: HashMap<TypeId, Factory>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared collaborator handed out to every delivery
    pub fn register<T: Send + Sync + 'static>(&mut self, value: Arc<T>) {
        self.singletons.insert(TypeId::of::<T>(), value);
    }

    /// Register a factory producing one fresh instance per delivery scope
    pub fn register_scoped<T, F>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<T>(),
            Arc::new(move || Arc::new(factory()) as Shared),
        );
    }

    /// Open a resolution scope for one delivery
    pub fn create_scope(self: &Arc<Self>) -> DeliveryScope {
        DeliveryScope {
            registry: Arc::clone(self),
            scoped: HashMap::new(),
        }
    }
}

/// Per-delivery resolution scope; never shared across deliveries
pub struct DeliveryScope {
    registry: Arc<CollaboratorRegistry>,
    scoped: HashMap<TypeId, Shared>,
}

impl DeliveryScope {
    /// Resolve a collaborator by type id, or signal "not available"
    pub fn resolve_raw(&mut self, type_id: TypeId) -> Option<Shared> {
        if let Some(singleton) = self.registry.singletons.get(&type_id) {
            return Some(Arc::clone(singleton));
        }
        if let Some(cached) = self.scoped.get(&type_id) {
            return Some(Arc::clone(cached));
        }
        let factory = self.registry.factories.get(&type_id)?;
        let instance = factory();
        self.scoped.insert(type_id, Arc::clone(&instance));
        Some(instance)
    }

    /// Typed resolution convenience
    pub fn get<T: Send + Sync + 'static>(&mut self) -> Option<Arc<T>> {
        self.resolve_raw(TypeId::of::<T>())
            .and_then(|shared| shared.downcast::<T>().ok())
    }
}
