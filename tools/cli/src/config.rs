//! Provider profile loading.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use stowage_storage::{BackupService, ProviderRegistry};

/// A provider name plus the configuration handed to its factory.
#[derive(Debug, Deserialize)]
pub struct Profile {
    pub provider: String,
    #[serde(default)]
    pub config: Value,
}

impl Profile {
    /// Read a profile from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Build the configured service.
    pub fn connect(self, registry: &ProviderRegistry) -> Result<Arc<dyn BackupService>> {
        if !registry.has_provider(&self.provider) {
            anyhow::bail!(
                "Unknown provider '{}'. Available: {}",
                self.provider,
                registry.providers().join(", ")
            );
        }
        registry
            .resolve(&self.provider, self.config)
            .with_context(|| format!("Failed to configure provider '{}'", self.provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use stowage_storage::{create_default_registry, ProviderKind};
    use tempfile::NamedTempFile;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_connect() {
        let file = write_config(r#"{"provider": "memory"}"#);
        let profile = Profile::load(file.path()).unwrap();
        assert_eq!(profile.provider, "memory");
        assert!(profile.config.is_null());

        let service = profile.connect(&create_default_registry()).unwrap();
        assert_eq!(service.kind(), ProviderKind::Memory);
    }

    #[test]
    fn test_provider_config_is_passed_through() {
        let file = write_config(
            r#"{"provider": "s3", "config": {"bucket": "backups", "region": "eu-central-1",
                "access_key_id": "AKID", "secret_access_key": "secret"}}"#,
        );
        let service = Profile::load(file.path())
            .unwrap()
            .connect(&create_default_registry())
            .unwrap();
        assert_eq!(service.kind(), ProviderKind::AmazonS3);
    }

    #[test]
    fn test_unknown_provider() {
        let file = write_config(r#"{"provider": "floppy"}"#);
        let profile = Profile::load(file.path()).unwrap();
        let Err(err) = profile.connect(&create_default_registry()) else {
            panic!("unknown provider accepted");
        };
        assert!(err.to_string().contains("floppy"));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{not json");
        assert!(Profile::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Profile::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
