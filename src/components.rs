//! Component resolution.
//!
//! Subscribers may live on components resolved at dispatch time, and may
//! ask for services as additional handler arguments. Both go through a
//! [`ComponentResolver`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Type-erased shared component.
pub type Component = Arc<dyn Any + Send + Sync>;

/// Looks up components by type.
pub trait ComponentResolver: Send + Sync {
    fn resolve_component(&self, type_id: TypeId) -> Option<Component>;
}

impl dyn ComponentResolver {
    pub fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resolve_component(TypeId::of::<T>())
            .and_then(|component| component.downcast::<T>().ok())
    }
}

/// Map-backed resolver, one instance per type.
#[derive(Clone, Default)]
pub struct Components {
    components: HashMap<TypeId, Component>,
}

impl Components {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, component: Arc<T>) -> Self {
        self.insert(component);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, component: Arc<T>) {
        self.components.insert(TypeId::of::<T>(), component);
    }
}

impl ComponentResolver for Components {
    fn resolve_component(&self, type_id: TypeId) -> Option<Component> {
        self.components.get(&type_id).cloned()
    }
}
