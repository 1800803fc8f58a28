//! Shared collaborators handed to builders, loaders and lifecycle hooks

use crate::config::OdmConfig;
use crate::relationships::binding::Binder;
use crate::relationships::registry::TypeRegistry;
use crate::store::DocumentStore;

/// Borrowed view of the registry, store and configuration for one operation
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub registry: &'a TypeRegistry,
    pub store: &'a dyn DocumentStore,
    pub config: &'a OdmConfig,
}

impl<'a> Context<'a> {
    pub fn new(registry: &'a TypeRegistry, store: &'a dyn DocumentStore, config: &'a OdmConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn binder(&self) -> Binder<'a> {
        Binder::new(self.registry)
    }
}
