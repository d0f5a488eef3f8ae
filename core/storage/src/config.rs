//! Storage configuration: providers and routing, as data.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crmcontent_common::{Error, Result};

use crate::registry::{ProviderCatalog, ProviderRegistry};
use crate::router::{RoutingConfig, RuleRouter};

/// One configured provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name; becomes the URI namespace.
    pub name: String,
    /// Provider kind from the catalog (e.g., "memory", "local").
    pub kind: String,
    /// Byte limit for this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    /// Kind-specific options.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Complete storage configuration supplied by the host at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Providers in registration order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Routing policy for new content.
    #[serde(default)]
    pub routing: RoutingConfig,
}

impl StorageConfig {
    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Build the registry and router this configuration describes.
    ///
    /// # Errors
    /// - Unknown provider kind or invalid options
    /// - Duplicate provider names
    /// - Routing names a provider that is not configured
    pub fn build(&self, catalog: &ProviderCatalog) -> Result<(ProviderRegistry, RuleRouter)> {
        let mut registry = ProviderRegistry::new();
        for provider in &self.providers {
            let instance =
                catalog.build(&provider.kind, &provider.name, &provider.options, provider.quota)?;
            registry.register(instance)?;
            info!(
                provider = %provider.name,
                kind = %provider.kind,
                quota = ?provider.quota,
                "Configured content provider"
            );
        }

        let router = RuleRouter::new(self.routing.clone());
        router.validate(&registry)?;
        Ok((registry, router))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::create_default_catalog;
    use crate::router::RouteRule;
    use tempfile::TempDir;

    #[test]
    fn test_build_from_json() {
        let temp = TempDir::new().unwrap();
        let json = serde_json::json!({
            "providers": [
                {"name": "scratch", "kind": "memory", "quota": 1024},
                {"name": "archive", "kind": "local", "options": {"root": temp.path()}}
            ],
            "routing": {
                "rules": [{"provider": "archive", "min_length": 1024}],
                "fallback": "scratch"
            }
        })
        .to_string();

        let config = StorageConfig::from_json(&json).unwrap();
        assert_eq!(config.providers[0].quota, Some(1024));
        assert_eq!(config.routing.rules, vec![RouteRule::to("archive").with_min_length(1024)]);

        let (registry, router) = config.build(&create_default_catalog()).unwrap();
        let names: Vec<_> = registry.providers().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["scratch", "archive"]);
        assert_eq!(router.config().fallback.as_deref(), Some("scratch"));
    }

    #[test]
    fn test_build_rejects_unknown_routing_target() {
        let config = StorageConfig {
            providers: vec![ProviderConfig {
                name: "scratch".into(),
                kind: "memory".into(),
                quota: None,
                options: serde_json::Value::Null,
            }],
            routing: RoutingConfig {
                fallback: Some("missing".into()),
                ..RoutingConfig::default()
            },
        };
        let result = config.build(&create_default_catalog());
        assert!(matches!(result, Err(Error::NoProvider(_))));
    }

    #[test]
    fn test_build_rejects_duplicate_names() {
        let provider = ProviderConfig {
            name: "scratch".into(),
            kind: "memory".into(),
            quota: None,
            options: serde_json::Value::Null,
        };
        let config = StorageConfig {
            providers: vec![provider.clone(), provider],
            routing: RoutingConfig::default(),
        };
        assert!(matches!(
            config.build(&create_default_catalog()),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_load_and_serialize() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("storage.json");
        let config = StorageConfig {
            providers: vec![ProviderConfig {
                name: "scratch".into(),
                kind: "memory".into(),
                quota: Some(10),
                options: serde_json::Value::Null,
            }],
            routing: RoutingConfig::default(),
        };
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        assert_eq!(StorageConfig::load(&path).unwrap(), config);
        assert!(matches!(
            StorageConfig::from_json("{not json"),
            Err(Error::Serialization(_))
        ));
    }
}
