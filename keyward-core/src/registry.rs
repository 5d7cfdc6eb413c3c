//! Service registry.
//!
//! Maps service names to shared [`Service`] instances. Tokens only record the
//! name of their service; the registry is how a stored token finds its engine
//! again.

use std::collections::HashMap;
use std::sync::Arc;

use crate::basic::HttpBasicService;
use crate::error::KeywardError;
use crate::model::ServiceId;
use crate::oauth1::OAuth1Service;
use crate::oauth2::OAuth2Service;
use crate::service::{Flow, Service, ServiceConfig};

/// Registry of services by name.
///
/// # Example
///
/// ```
/// use keyward_core::{ServiceRegistry, presets};
///
/// let mut registry = ServiceRegistry::new();
/// registry.register_config(presets::pinboard()).unwrap();
/// assert!(registry.contains("pinboard"));
/// ```
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<ServiceId, Arc<dyn Service>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service.
    ///
    /// Returns `Ok(false)` if a service with the same name is already
    /// registered; the first registration wins.
    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<bool, KeywardError> {
        let config = service.config();
        if config.name.as_str().is_empty() {
            return Err(KeywardError::Config {
                message: "service has no name".to_string(),
            });
        }
        for purpose in service.required_endpoints() {
            config.required_endpoint(purpose)?;
        }

        let name = config.name.clone();
        if self.services.contains_key(&name) {
            tracing::debug!("Service {} already registered", name);
            return Ok(false);
        }

        tracing::debug!("Registered service {}", name);
        self.services.insert(name, service);
        Ok(true)
    }

    /// Build the engine named by `config.flow` and register it.
    pub fn register_config(&mut self, config: ServiceConfig) -> Result<bool, KeywardError> {
        let service: Arc<dyn Service> = match config.flow {
            Flow::OAuth1 => Arc::new(OAuth1Service::new(config)),
            Flow::OAuth2 => Arc::new(OAuth2Service::new(config)),
            Flow::Basic => Arc::new(HttpBasicService::new(config)),
        };
        self.register(service)
    }

    /// Get a service by name.
    pub fn get(&self, name: impl Into<ServiceId>) -> Option<&Arc<dyn Service>> {
        self.services.get(&name.into())
    }

    /// Check if a service is registered.
    pub fn contains(&self, name: impl Into<ServiceId>) -> bool {
        self.services.contains_key(&name.into())
    }

    /// All registered services, sorted by name.
    pub fn list(&self) -> Vec<Arc<dyn Service>> {
        let mut services: Vec<_> = self.services.values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Registered services whose application credentials are present.
    pub fn configured(&self) -> Vec<Arc<dyn Service>> {
        self.list().into_iter().filter(|s| s.is_configured()).collect()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.services.keys().collect();
        names.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .finish()
    }
}
