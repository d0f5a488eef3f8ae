//! Content provider factory: the entry point hosts use.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crmcontent_common::{Error, Principal, Reference, ResourceUri, Result};

use crate::config::StorageConfig;
use crate::provider::ContentProvider;
use crate::registry::{ProviderCatalog, ProviderRegistry};
use crate::router::{ContentRouter, RoutingRequest};

struct Configured {
    registry: ProviderRegistry,
    router: Box<dyn ContentRouter>,
}

/// Per-provider result of a maintenance scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Provider name.
    pub provider: String,
    /// Bytes of the objects the predicate accepted.
    pub total: u64,
}

/// Access point for content providers.
///
/// Starts unconfigured; every lookup fails with `NotConfigured` until
/// [`configure`](Self::configure) has run once. After that the registry and
/// router are immutable, so lookups take no lock.
#[derive(Default)]
pub struct ContentProviderFactory {
    state: OnceLock<Configured>,
}

impl ContentProviderFactory {
    /// Create an unconfigured factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the registry and router.
    ///
    /// # Errors
    /// - `AlreadyExists` if the factory was configured before
    pub fn configure(
        &self,
        registry: ProviderRegistry,
        router: impl ContentRouter + 'static,
    ) -> Result<()> {
        let providers = registry.len();
        self.state
            .set(Configured {
                registry,
                router: Box::new(router),
            })
            .map_err(|_| {
                Error::AlreadyExists("Content provider factory is already configured".to_string())
            })?;
        info!(providers, "Content provider factory configured");
        Ok(())
    }

    /// Build providers and routing from configuration, then install them.
    pub fn configure_from(&self, config: &StorageConfig, catalog: &ProviderCatalog) -> Result<()> {
        let (registry, router) = config.build(catalog)?;
        self.configure(registry, router)
    }

    /// Whether [`configure`](Self::configure) has completed.
    pub fn is_configured(&self) -> bool {
        self.state.get().is_some()
    }

    fn configured(&self) -> Result<&Configured> {
        self.state.get().ok_or(Error::NotConfigured)
    }

    /// Provider that should store new content.
    ///
    /// # Errors
    /// - `NotConfigured`
    /// - `NoProvider` when no provider accepts the content
    pub fn provider_for_new_content(
        &self,
        filename: &str,
        length: u64,
        reference: Option<&Reference>,
        principal: &Principal,
    ) -> Result<Arc<dyn ContentProvider>> {
        let configured = self.configured()?;
        let request = RoutingRequest {
            filename,
            length,
            reference,
            principal,
        };
        let provider = configured.router.select(&request, &configured.registry)?;
        debug!(
            filename,
            length,
            principal = %principal,
            provider = provider.name(),
            "Selected provider for new content"
        );
        Ok(provider)
    }

    /// Provider that owns an existing resource.
    ///
    /// # Errors
    /// - `NotConfigured`
    /// - `NoProvider` when no provider handles the URI
    pub fn provider_for_resource(&self, uri: &ResourceUri) -> Result<Arc<dyn ContentProvider>> {
        self.configured()?.registry.find(uri)
    }

    /// All providers in configuration order.
    pub fn providers(&self) -> Result<Vec<Arc<dyn ContentProvider>>> {
        Ok(self.configured()?.registry.providers().to_vec())
    }

    /// Run `check` on every provider in order.
    ///
    /// Stops after the current provider once `cancel` fires.
    pub async fn check_all(
        &self,
        visitor: &mut (dyn for<'u> FnMut(&'u ResourceUri) -> bool + Send),
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckReport>> {
        let mut reports = Vec::new();
        for provider in self.providers()? {
            if cancel.is_cancelled() {
                break;
            }
            let total = provider.check(visitor, cancel).await?;
            debug!(provider = provider.name(), total, "Checked provider");
            reports.push(CheckReport {
                provider: provider.name().to_string(),
                total,
            });
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use crate::provider::{bytes_stream, ContentProviderExt};
    use crate::registry::create_default_catalog;
    use crate::router::{FirstProviderRouter, RouteRule, RoutingConfig, RuleRouter};

    fn registry(names: &[&str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for name in names {
            registry
                .register(Arc::new(MemoryProvider::new(*name).unwrap()))
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_unconfigured_factory_fails() {
        let factory = ContentProviderFactory::new();
        let uri = ResourceUri::parse("mem://scratch/a/b").unwrap();
        let anna = Principal::new("anna");

        assert!(!factory.is_configured());
        assert!(matches!(
            factory.provider_for_resource(&uri),
            Err(Error::NotConfigured)
        ));
        assert!(matches!(
            factory.provider_for_new_content("a.txt", 1, None, &anna),
            Err(Error::NotConfigured)
        ));
        assert!(matches!(factory.providers(), Err(Error::NotConfigured)));
        assert!(matches!(
            factory
                .check_all(&mut |_: &ResourceUri| true, &CancellationToken::new())
                .await,
            Err(Error::NotConfigured)
        ));
    }

    #[test]
    fn test_configure_only_once() {
        let factory = ContentProviderFactory::new();
        factory.configure(registry(&["a"]), FirstProviderRouter).unwrap();
        let again = factory.configure(registry(&["b"]), FirstProviderRouter);
        assert!(matches!(again, Err(Error::AlreadyExists(_))));
        assert_eq!(factory.providers().unwrap()[0].name(), "a");
    }

    #[test]
    fn test_zero_providers_is_no_provider() {
        let factory = ContentProviderFactory::new();
        factory
            .configure(ProviderRegistry::new(), RuleRouter::default())
            .unwrap();
        let uri = ResourceUri::parse("mem://scratch/a/b").unwrap();

        assert!(matches!(
            factory.provider_for_resource(&uri),
            Err(Error::NoProvider(_))
        ));
        assert!(matches!(
            factory.provider_for_new_content("a.txt", 1, None, &Principal::new("anna")),
            Err(Error::NoProvider(_))
        ));
        assert!(factory.providers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_routing_and_resolution() {
        let factory = ContentProviderFactory::new();
        let router = RuleRouter::new(RoutingConfig {
            rules: vec![RouteRule::to("bulk").with_min_length(100)],
            fallback: Some("small".to_string()),
            reject_unmatched: false,
        });
        factory.configure(registry(&["small", "bulk"]), router).unwrap();
        let anna = Principal::new("anna");
        let invoice = Reference::new("invoice", "42");

        let small = factory
            .provider_for_new_content("a.txt", 5, Some(&invoice), &anna)
            .unwrap();
        assert_eq!(small.name(), "small");
        let meta = small
            .create(bytes_stream("hello"), "text/plain", "a.txt", &anna)
            .await
            .unwrap();

        let bulk = factory
            .provider_for_new_content("b.bin", 500, Some(&invoice), &anna)
            .unwrap();
        assert_eq!(bulk.name(), "bulk");
        let big = bulk
            .create(bytes_stream(vec![0u8; 500]), "application/octet-stream", "b.bin", &anna)
            .await
            .unwrap();

        let owner = factory.provider_for_resource(&meta.uri).unwrap();
        assert_eq!(owner.name(), "small");
        assert_eq!(owner.read_text(&meta.uri, None).await.unwrap(), "hello");
        assert_eq!(factory.provider_for_resource(&big.uri).unwrap().name(), "bulk");

        let reports = factory
            .check_all(&mut |_: &ResourceUri| true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            reports,
            vec![
                CheckReport { provider: "small".into(), total: 5 },
                CheckReport { provider: "bulk".into(), total: 500 },
            ]
        );
    }

    #[tokio::test]
    async fn test_provider_errors_pass_through_unchanged() {
        let factory = ContentProviderFactory::new();
        factory
            .configure_from(
                &StorageConfig::from_json(
                    r#"{"providers": [{"name": "tiny", "kind": "memory", "quota": 4}]}"#,
                )
                .unwrap(),
                &create_default_catalog(),
            )
            .unwrap();
        let anna = Principal::new("anna");

        let provider = factory
            .provider_for_new_content("a.bin", 8, None, &anna)
            .unwrap();
        let result = provider
            .create(bytes_stream(vec![0u8; 8]), "application/octet-stream", "a.bin", &anna)
            .await;
        assert!(matches!(result, Err(Error::Quota(_))));

        let missing = ResourceUri::parse("mem://tiny/none/a.bin").unwrap();
        let owner = factory.provider_for_resource(&missing).unwrap();
        assert!(matches!(owner.metadata(&missing).await, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_routing_is_stable_across_calls() {
        let factory = ContentProviderFactory::new();
        let router = RuleRouter::new(RoutingConfig {
            rules: vec![RouteRule::to("images").with_content_types(["image/*"])],
            ..RoutingConfig::default()
        });
        factory.configure(registry(&["docs", "images"]), router).unwrap();
        let anna = Principal::new("anna");

        for _ in 0..10 {
            let picked = factory
                .provider_for_new_content("logo.png", 2048, None, &anna)
                .unwrap();
            assert_eq!(picked.name(), "images");
        }
    }

    #[tokio::test]
    async fn test_factory_shared_across_tasks() {
        let factory = Arc::new(ContentProviderFactory::new());
        factory.configure(registry(&["shared"]), FirstProviderRouter).unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let factory = factory.clone();
            tasks.push(tokio::spawn(async move {
                let anna = Principal::new("anna");
                let name = format!("f{}.txt", i);
                let provider = factory
                    .provider_for_new_content(&name, 2, None, &anna)
                    .unwrap();
                provider
                    .create(bytes_stream(format!("{:02}", i)), "text/plain", &name, &anna)
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            let meta = task.await.unwrap();
            let owner = factory.provider_for_resource(&meta.uri).unwrap();
            assert!(owner.exists(&meta.uri).await.unwrap());
            assert_eq!(owner.length(&meta.uri).await.unwrap(), 2);
        }
    }
}
