//! Transport registry for resolving transports from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::transport::RemoteTransport;
use offsync_common::{Error, Result};

/// Factory function type for creating transports.
pub type TransportFactory =
    Box<dyn Fn(Value) -> Result<Arc<dyn RemoteTransport>> + Send + Sync>;

/// Registry for transport factories.
///
/// Lets front ends pick a transport by name from a config file.
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a transport factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: TransportFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Transport '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a transport by name and configuration.
    ///
    /// # Errors
    /// - Transport not registered
    /// - Configuration invalid for the transport
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteTransport>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Transport '{}' is not registered", name))
        })?;
        factory(config)
    }

    /// Get list of registered transport names.
    pub fn transports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a transport is registered.
    pub fn has_transport(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in transports.
pub fn create_default_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();

    // Registration into a fresh registry cannot clash, so results are ignored.
    let _ = registry.register(
        "memory",
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryTransport::new()))),
    );

    let _ = registry.register(
        "http",
        Box::new(|config| Ok(Arc::new(crate::http::HttpTransport::from_config(&config)?))),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = TransportRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryTransport::new()))))
            .unwrap();

        let transport = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(transport.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = TransportRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryTransport::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryTransport::new()))));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = TransportRegistry::new();
        let result = registry.resolve("unknown", Value::Null);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        assert_eq!(registry.transports(), vec!["http", "memory"]);

        let http = registry
            .resolve("http", json!({ "endpoint": "http://127.0.0.1:9000" }))
            .unwrap();
        assert_eq!(http.name(), "http");

        assert!(registry.resolve("http", json!({})).is_err());
    }
}
