//! Provider registry and builder catalog.

use std::collections::HashMap;
use std::sync::Arc;
use serde_json::Value;
use tracing::debug;

use crmcontent_common::{Error, ResourceUri, Result};
use crate::provider::ContentProvider;

/// Ordered set of configured providers.
///
/// Registration order is configuration order; it decides which provider
/// claims a URI first and is the router's tie-break.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ContentProvider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider.
    ///
    /// # Errors
    /// - A provider with the same name is already registered
    pub fn register(&mut self, provider: Arc<dyn ContentProvider>) -> Result<()> {
        if self.get(provider.name()).is_some() {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                provider.name()
            )));
        }
        debug!(provider = provider.name(), scheme = provider.scheme(), "Registered provider");
        self.providers.push(provider);
        Ok(())
    }

    /// All providers in registration order.
    pub fn providers(&self) -> &[Arc<dyn ContentProvider>] {
        &self.providers
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ContentProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// First provider that handles `uri`.
    ///
    /// # Errors
    /// - `NoProvider` when no registered provider claims the URI. This is a
    ///   configuration problem, not a missing resource.
    pub fn find(&self, uri: &ResourceUri) -> Result<Arc<dyn ContentProvider>> {
        self.providers
            .iter()
            .find(|p| p.handles(uri))
            .cloned()
            .ok_or_else(|| Error::NoProvider(format!("No provider handles {}", uri)))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Builder function: `(name, options, quota)` to a provider instance.
pub type ProviderBuilder =
    Box<dyn Fn(&str, &Value, Option<u64>) -> Result<Arc<dyn ContentProvider>> + Send + Sync>;

/// Catalog of provider builders keyed by kind.
///
/// Lets configuration name a provider kind ("memory", "local", ...) and
/// have it constructed without the caller knowing the concrete type.
pub struct ProviderCatalog {
    builders: HashMap<String, ProviderBuilder>,
}

impl ProviderCatalog {
    /// Create a new empty catalog.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register a builder.
    ///
    /// # Errors
    /// - Returns error if the kind is already registered
    pub fn register(&mut self, kind: impl Into<String>, builder: ProviderBuilder) -> Result<()> {
        let kind = kind.into();
        if self.builders.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Provider kind '{}' is already registered",
                kind
            )));
        }
        self.builders.insert(kind, builder);
        Ok(())
    }

    /// Build a provider of `kind`.
    ///
    /// # Errors
    /// - Unknown kind
    /// - Options invalid for the kind
    pub fn build(
        &self,
        kind: &str,
        name: &str,
        options: &Value,
        quota: Option<u64>,
    ) -> Result<Arc<dyn ContentProvider>> {
        let builder = self.builders.get(kind).ok_or_else(|| {
            Error::InvalidInput(format!("Provider kind '{}' is not registered", kind))
        })?;
        builder(name, options, quota)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    /// Check if a kind is registered.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a catalog with the built-in provider kinds.
pub fn create_default_catalog() -> ProviderCatalog {
    let mut builders: HashMap<String, ProviderBuilder> = HashMap::new();

    builders.insert(
        "memory".to_string(),
        Box::new(|name, _options, quota| {
            let provider = crate::memory::MemoryProvider::new(name)?;
            Ok(Arc::new(match quota {
                Some(limit) => provider.with_quota(limit),
                None => provider,
            }))
        }),
    );

    builders.insert(
        "local".to_string(),
        Box::new(|name, options, quota| {
            let root = options
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Local provider '{}' requires a 'root' path",
                        name
                    ))
                })?;
            let provider = crate::local::LocalProvider::new(name, root)?;
            Ok(Arc::new(match quota {
                Some(limit) => provider.with_quota(limit),
                None => provider,
            }))
        }),
    );

    ProviderCatalog { builders }
}
