//! Component lookup by type.
//!
//! Plugins publish their shared state here at install time so later
//! plugins, the binary and tests can find it without global statics.

use crate::error::ServerError;
use dashmap::DashMap;
use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

#[derive(Default)]
pub struct ComponentRegistry {
    components: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `component`, returning the one it replaced.
    pub fn insert<T: Any + Send + Sync>(&self, component: Arc<T>) -> Option<Arc<T>> {
        self.components
            .insert(TypeId::of::<T>(), component)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let component = self.components.get(&TypeId::of::<T>())?.value().clone();
        component.downcast::<T>().ok()
    }

    /// Like [`get`](Self::get), failing with `MissingComponent`.
    pub fn require<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ServerError> {
        self.get::<T>()
            .ok_or(ServerError::MissingComponent(type_name::<T>()))
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.components.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
