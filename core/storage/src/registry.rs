//! Provider registry for dynamic service resolution.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use stowage_common::{Error, Result};

use crate::service::BackupService;

/// Factory function type for creating services.
pub type ProviderFactory = Box<dyn Fn(Value) -> Result<Arc<dyn BackupService>> + Send + Sync>;

/// Registry for backup service factories.
///
/// Allows dynamic registration and resolution of backup services
/// by provider name and configuration.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Preconditions
    /// - `name` must be unique within the registry
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a service by provider name and configuration.
    ///
    /// # Errors
    /// - `NotFound` if the provider is not registered
    /// - `InvalidInput` if the configuration is invalid for the provider
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn BackupService>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not registered", name)))?;
        factory(config)
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with every built-in provider.
pub fn create_default_registry() -> ProviderRegistry {
    let builtin: [(&str, ProviderFactory); 6] = [
        ("memory", Box::new(crate::memory::create_memory_service)),
        ("s3", Box::new(crate::s3::create_s3_service)),
        ("glacier", Box::new(crate::glacier::create_glacier_service)),
        ("azure", Box::new(crate::azure::create_azure_service)),
        ("yandex", Box::new(crate::yandex::create_yandex_service)),
        ("mega", Box::new(crate::mega::create_mega_service)),
    ];

    ProviderRegistry {
        factories: builtin
            .into_iter()
            .map(|(name, factory)| (name.to_string(), factory))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::create_memory_service;
    use crate::service::ProviderKind;
    use serde_json::json;

    fn memory_factory() -> ProviderFactory {
        Box::new(create_memory_service)
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ProviderRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let service = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(service.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProviderRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let result = registry.register("test", memory_factory());
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = ProviderRegistry::new();
        let result = registry.resolve("unknown", Value::Null);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_registry_lists_builtins() {
        let registry = create_default_registry();
        assert_eq!(
            registry.providers(),
            vec!["azure", "glacier", "mega", "memory", "s3", "yandex"]
        );
        assert!(registry.has_provider("glacier"));
        assert!(!registry.has_provider("ftp"));
    }

    #[test]
    fn test_default_registry_validates_config() {
        let registry = create_default_registry();
        assert!(matches!(
            registry.resolve("s3", json!({"region": "eu-west-1"})),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.resolve("mega", json!({})),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_default_registry_builds_services() {
        let registry = create_default_registry();
        let memory = registry.resolve("memory", Value::Null).unwrap();
        assert_eq!(memory.kind(), ProviderKind::Memory);

        let yandex = registry
            .resolve("yandex", json!({"oauth_token": "token"}))
            .unwrap();
        assert_eq!(yandex.kind(), ProviderKind::YandexDisk);
        assert!(yandex.can_folders());
    }
}
