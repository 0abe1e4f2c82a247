//! Service resolution hook handed to jobs and pipeline stages.
//!
//! A `ServiceProvider` is configured once at startup. Every job run and every
//! pipeline run gets its own `ServiceScope`: singletons are shared, scoped
//! services are built fresh from their factory. Lookups are keyed by type, so a
//! caller can never receive a value of the wrong type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};

type AnyService = Arc<dyn Any + Send + Sync>;
type ScopedFactory = Arc<dyn Fn() -> AnyService + Send + Sync>;

/// Registry of services available to business code.
#[derive(Clone, Default)]
pub struct ServiceProvider {
    singletons: HashMap<TypeId, AnyService>,
    scoped: HashMap<TypeId, ScopedFactory>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value shared by every scope.
    pub fn with_singleton<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.singletons.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Register a factory invoked once per created scope.
    pub fn with_scoped<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.scoped.insert(
            TypeId::of::<T>(),
            Arc::new(move || Arc::new(factory()) as AnyService),
        );
        self
    }

    /// Create a fresh scope for one job run / pipeline run.
    pub fn create_scope(&self) -> ServiceScope {
        let mut services = self.singletons.clone();
        for (type_id, factory) in &self.scoped {
            services.insert(*type_id, factory());
        }
        ServiceScope {
            services: Arc::new(services),
        }
    }
}

impl core::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("singletons", &self.singletons.len())
            .field("scoped", &self.scoped.len())
            .finish()
    }
}

/// Services resolved for one unit of work.
#[derive(Clone, Default)]
pub struct ServiceScope {
    services: Arc<HashMap<TypeId, AnyService>>,
}

impl ServiceScope {
    /// An empty scope (no services registered).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|svc| svc.downcast::<T>().ok())
    }

    /// Like `get`, but reports which type was missing.
    pub fn require<T>(&self) -> CoreResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get::<T>()
            .ok_or(CoreError::MissingService(std::any::type_name::<T>()))
    }
}

impl core::fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceScope")
            .field("services", &self.services.len())
            .finish()
    }
}
