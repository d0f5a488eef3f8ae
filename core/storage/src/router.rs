//! Routing policy: which provider stores new content.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crmcontent_common::{Error, Principal, Reference, Result, TenantId};

use crate::provider::ContentProvider;
use crate::registry::ProviderRegistry;

/// Everything a router may look at when placing new content.
#[derive(Debug, Clone, Copy)]
pub struct RoutingRequest<'a> {
    /// Name of the content.
    pub filename: &'a str,
    /// Declared length in bytes.
    pub length: u64,
    /// Domain object the content is attached to.
    pub reference: Option<&'a Reference>,
    /// User storing the content.
    pub principal: &'a Principal,
}

impl RoutingRequest<'_> {
    /// Lowercase filename extension, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Content type guessed from the filename.
    pub fn guessed_content_type(&self) -> String {
        mime_guess::from_path(self.filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

/// Chooses the provider for new content.
///
/// Implementations must be deterministic: the same request against the same
/// registry always yields the same provider, so a failed write can be
/// retried through the router safely.
pub trait ContentRouter: Send + Sync {
    /// Pick a provider.
    ///
    /// # Errors
    /// - `NoProvider` when no registered provider accepts the content
    fn select(
        &self,
        request: &RoutingRequest<'_>,
        registry: &ProviderRegistry,
    ) -> Result<Arc<dyn ContentProvider>>;
}

/// Sends all content to the first registered provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstProviderRouter;

impl ContentRouter for FirstProviderRouter {
    fn select(
        &self,
        request: &RoutingRequest<'_>,
        registry: &ProviderRegistry,
    ) -> Result<Arc<dyn ContentProvider>> {
        registry.providers().first().cloned().ok_or_else(|| {
            Error::NoProvider(format!(
                "No provider configured for '{}'",
                request.filename
            ))
        })
    }
}

/// One routing rule. Every matcher that is set must match; unset matchers
/// match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Target provider name.
    pub provider: String,
    /// Filename extensions without the dot, case-insensitive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    /// Content types guessed from the filename; `type/*` matches a family.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_types: Vec<String>,
    /// Reference kinds, e.g. `invoice`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_kinds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<TenantId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usernames: Vec<String>,
    /// Inclusive lower length bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    /// Inclusive upper length bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
}

impl RouteRule {
    /// Rule that sends everything to `provider`.
    pub fn to(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Self::default()
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = content_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reference_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reference_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tenants(mut self, tenants: impl IntoIterator<Item = TenantId>) -> Self {
        self.tenants = tenants.into_iter().collect();
        self
    }

    pub fn with_usernames<I, S>(mut self, usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.usernames = usernames.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_length(mut self, bytes: u64) -> Self {
        self.min_length = Some(bytes);
        self
    }

    pub fn with_max_length(mut self, bytes: u64) -> Self {
        self.max_length = Some(bytes);
        self
    }

    /// Check the rule against a request.
    pub fn matches(&self, request: &RoutingRequest<'_>) -> bool {
        if self.min_length.is_some_and(|min| request.length < min) {
            return false;
        }
        if self.max_length.is_some_and(|max| request.length > max) {
            return false;
        }

        if !self.extensions.is_empty() {
            let Some(ext) = request.extension() else {
                return false;
            };
            if !self
                .extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
            {
                return false;
            }
        }

        if !self.content_types.is_empty() {
            let guessed = request.guessed_content_type();
            if !self
                .content_types
                .iter()
                .any(|pattern| content_type_matches(pattern, &guessed))
            {
                return false;
            }
        }

        if !self.reference_kinds.is_empty() {
            let Some(reference) = request.reference else {
                return false;
            };
            if !self.reference_kinds.iter().any(|k| *k == reference.kind) {
                return false;
            }
        }

        if !self.tenants.is_empty() {
            let Some(tenant) = request.principal.tenant else {
                return false;
            };
            if !self.tenants.contains(&tenant) {
                return false;
            }
        }

        if !self.usernames.is_empty()
            && !self.usernames.iter().any(|u| *u == request.principal.username)
        {
            return false;
        }

        true
    }
}

fn content_type_matches(pattern: &str, content_type: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(family) => content_type
            .split_once('/')
            .is_some_and(|(top, _)| top.eq_ignore_ascii_case(family)),
        None => pattern.eq_ignore_ascii_case(content_type),
    }
}

/// Routing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Rules tried in order.
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    /// Provider used when no rule matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// Fail unmatched requests instead of using the first provider.
    #[serde(default)]
    pub reject_unmatched: bool,
}

/// Rule-based router.
///
/// Resolution order:
/// 1. the first matching rule whose provider is registered
/// 2. the fallback provider, if configured; `NoProvider` if it is not
///    registered
/// 3. the first registered provider, unless `reject_unmatched` is set
#[derive(Debug, Clone, Default)]
pub struct RuleRouter {
    config: RoutingConfig,
}

impl RuleRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Check that every provider the configuration names is registered.
    pub fn validate(&self, registry: &ProviderRegistry) -> Result<()> {
        let named = self
            .config
            .rules
            .iter()
            .map(|rule| rule.provider.as_str())
            .chain(self.config.fallback.as_deref());
        for name in named {
            if registry.get(name).is_none() {
                return Err(Error::NoProvider(format!(
                    "Routing names unknown provider '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl ContentRouter for RuleRouter {
    fn select(
        &self,
        request: &RoutingRequest<'_>,
        registry: &ProviderRegistry,
    ) -> Result<Arc<dyn ContentProvider>> {
        for (index, rule) in self.config.rules.iter().enumerate() {
            if !rule.matches(request) {
                continue;
            }
            match registry.get(&rule.provider) {
                Some(provider) => {
                    debug!(
                        filename = request.filename,
                        length = request.length,
                        rule = index,
                        provider = provider.name(),
                        "Routed content"
                    );
                    return Ok(provider);
                }
                None => warn!(
                    rule = index,
                    provider = %rule.provider,
                    "Routing rule names an unregistered provider"
                ),
            }
        }

        if let Some(fallback) = &self.config.fallback {
            let provider = registry.get(fallback).ok_or_else(|| {
                Error::NoProvider(format!(
                    "Fallback provider '{}' for '{}' is not registered",
                    fallback, request.filename
                ))
            })?;
            debug!(filename = request.filename, provider = provider.name(), "Routed to fallback");
            return Ok(provider);
        }

        if self.config.reject_unmatched {
            return Err(Error::NoProvider(format!(
                "No provider accepts '{}' ({} bytes)",
                request.filename, request.length
            )));
        }
        FirstProviderRouter.select(request, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use proptest::prelude::*;

    fn registry(names: &[&str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for name in names {
            registry
                .register(Arc::new(MemoryProvider::new(*name).unwrap()))
                .unwrap();
        }
        registry
    }

    fn request<'a>(
        filename: &'a str,
        length: u64,
        reference: Option<&'a Reference>,
        principal: &'a Principal,
    ) -> RoutingRequest<'a> {
        RoutingRequest {
            filename,
            length,
            reference,
            principal,
        }
    }

    fn tiered_router() -> RuleRouter {
        RuleRouter::new(RoutingConfig {
            rules: vec![
                RouteRule::to("images").with_content_types(["image/*"]),
                RouteRule::to("bulk").with_min_length(1024 * 1024),
                RouteRule::to("invoices").with_reference_kinds(["invoice"]),
                RouteRule::to("tenant7").with_tenants([TenantId(7)]),
            ],
            fallback: Some("default".to_string()),
            reject_unmatched: false,
        })
    }

    #[test]
    fn test_empty_registry_is_no_provider() {
        let registry = ProviderRegistry::new();
        let anna = Principal::new("anna");
        let req = request("a.txt", 1, None, &anna);

        assert!(matches!(
            FirstProviderRouter.select(&req, &registry),
            Err(Error::NoProvider(_))
        ));
        assert!(matches!(
            RuleRouter::default().select(&req, &registry),
            Err(Error::NoProvider(_))
        ));
    }

    #[test]
    fn test_rules_route_by_request_attributes() {
        let registry = registry(&["default", "images", "bulk", "invoices", "tenant7"]);
        let router = tiered_router();
        let anna = Principal::new("anna");
        let invoice = Reference::new("invoice", "42");

        let pick = |req: RoutingRequest<'_>| router.select(&req, &registry).unwrap().name().to_string();

        assert_eq!(pick(request("photo.JPG", 10, None, &anna)), "images");
        assert_eq!(pick(request("dump.sql", 5 * 1024 * 1024, None, &anna)), "bulk");
        assert_eq!(pick(request("inv.pdf", 10, Some(&invoice), &anna)), "invoices");
        assert_eq!(pick(request("notes.txt", 10, None, &anna)), "default");

        let tenant_user = Principal::new("bob").with_tenant(TenantId(7));
        assert_eq!(pick(request("notes.txt", 10, None, &tenant_user)), "tenant7");
    }

    #[test]
    fn test_rule_order_breaks_ties() {
        let registry = registry(&["default", "images", "bulk"]);
        let router = tiered_router();
        let anna = Principal::new("anna");
        let selected = router
            .select(&request("huge.png", 10 * 1024 * 1024, None, &anna), &registry)
            .unwrap();
        assert_eq!(selected.name(), "images");
    }

    #[test]
    fn test_unregistered_targets_are_skipped() {
        let registry = registry(&["default"]);
        let router = tiered_router();
        let anna = Principal::new("anna");
        let selected = router
            .select(&request("photo.png", 10, None, &anna), &registry)
            .unwrap();
        assert_eq!(selected.name(), "default");
        assert!(router.validate(&registry).is_err());
    }

    #[test]
    fn test_unregistered_fallback_is_no_provider() {
        let registry = registry(&["first", "second"]);
        let router = RuleRouter::new(RoutingConfig {
            rules: vec![RouteRule::to("second").with_extensions(["pdf"])],
            fallback: Some("archive".to_string()),
            reject_unmatched: false,
        });
        let anna = Principal::new("anna");

        let pdf = router.select(&request("a.pdf", 1, None, &anna), &registry).unwrap();
        assert_eq!(pdf.name(), "second");
        assert!(matches!(
            router.select(&request("a.txt", 1, None, &anna), &registry),
            Err(Error::NoProvider(_))
        ));
    }

    #[test]
    fn test_reject_unmatched() {
        let registry = registry(&["small"]);
        let router = RuleRouter::new(RoutingConfig {
            rules: vec![RouteRule::to("small").with_max_length(100)],
            fallback: None,
            reject_unmatched: true,
        });
        let anna = Principal::new("anna");

        assert!(router.select(&request("a", 100, None, &anna), &registry).is_ok());
        assert!(matches!(
            router.select(&request("a", 101, None, &anna), &registry),
            Err(Error::NoProvider(_))
        ));
    }

    #[test]
    fn test_no_fallback_uses_first_provider() {
        let registry = registry(&["first", "second"]);
        let router = RuleRouter::new(RoutingConfig {
            rules: vec![RouteRule::to("second").with_extensions([".PDF"])],
            ..RoutingConfig::default()
        });
        let anna = Principal::new("anna");

        let pdf = router.select(&request("a.pdf", 1, None, &anna), &registry).unwrap();
        assert_eq!(pdf.name(), "second");
        let txt = router.select(&request("a.txt", 1, None, &anna), &registry).unwrap();
        assert_eq!(txt.name(), "first");
    }

    #[test]
    fn test_username_and_missing_attributes() {
        let rule = RouteRule::to("x")
            .with_usernames(["admin"])
            .with_reference_kinds(["contact"]);
        let admin = Principal::new("admin");
        let contact = Reference::new("contact", "1");

        assert!(rule.matches(&request("a", 1, Some(&contact), &admin)));
        assert!(!rule.matches(&request("a", 1, None, &admin)));
        assert!(!rule.matches(&request("a", 1, Some(&contact), &Principal::new("anna"))));
        assert!(!RouteRule::to("x")
            .with_extensions(["txt"])
            .matches(&request("README", 1, None, &admin)));
    }

    #[test]
    fn test_routing_config_deserializes_with_defaults() {
        let config: RoutingConfig = serde_json::from_str(
            r#"{"rules": [{"provider": "bulk", "min_length": 1048576}], "fallback": "default"}"#,
        )
        .unwrap();
        assert_eq!(config.rules, vec![RouteRule::to("bulk").with_min_length(1048576)]);
        assert!(!config.reject_unmatched);
    }

    proptest! {
        #[test]
        fn selection_is_deterministic(
            filename in "[a-z]{1,8}(\\.(png|pdf|txt|sql))?",
            length in 0u64..(4 * 1024 * 1024),
            tenant in proptest::option::of(0i64..10),
            invoice in any::<bool>(),
        ) {
            let registry = registry(&["default", "images", "bulk", "invoices", "tenant7"]);
            let router = tiered_router();
            let principal = Principal { username: "anna".to_string(), tenant: tenant.map(TenantId) };
            let reference = Reference::new(if invoice { "invoice" } else { "contact" }, "1");
            let req = request(&filename, length, Some(&reference), &principal);

            let first = router.select(&req, &registry).unwrap();
            let second = router.select(&req, &registry).unwrap();
            prop_assert_eq!(first.name(), second.name());
        }
    }
}
