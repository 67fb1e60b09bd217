//! Registered-backend selection
//!
//! Backends are created through a name-to-factory map so the engine can
//! choose its device at startup without compile-time coupling to any one
//! graphics API. The headless backend is always registered; native
//! backends register themselves alongside it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RendererConfig;
use crate::gpu::{headless, GpuDevice, GpuError, GpuResult, PresentSurface};

/// A backend constructor: builds the device context and the presentable
/// surface from renderer configuration.
pub type BackendFactory =
    fn(&RendererConfig) -> GpuResult<(Arc<dyn GpuDevice>, Box<dyn PresentSurface>)>;

/// Name-keyed backend factory map.
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Registry with the built-in backends registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("headless", headless::create);
        registry
    }

    /// Register a backend under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) {
        log::debug!("Registered render backend '{name}'");
        self.factories.insert(name, factory);
    }

    /// Instantiate the backend registered under `name`.
    ///
    /// # Errors
    /// [`GpuError::UnknownBackend`] when no factory is registered under
    /// `name`; otherwise whatever the factory reports.
    pub fn create(
        &self,
        name: &str,
        config: &RendererConfig,
    ) -> GpuResult<(Arc<dyn GpuDevice>, Box<dyn PresentSurface>)> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| GpuError::UnknownBackend(name.to_string()))?;
        log::info!("Creating render backend '{name}'");
        factory(config)
    }

    /// Names of all registered backends.
    #[must_use]
    pub fn backend_names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
