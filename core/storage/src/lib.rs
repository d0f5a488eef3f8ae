//! Pluggable, routed content storage.
//!
//! This module provides a trait-based interface for content providers
//! (in-memory, local filesystem, ...), a registry of configured providers,
//! a router that places new content, and the factory hosts use as their
//! single entry point.
//!
//! # Design Principles
//! - Provider isolation: callers address content by URI, never by backend
//! - Deterministic routing: the same request always lands on the same provider
//! - Scoped reads: stream handles are released on every exit path
//! - Unified error semantics: provider errors pass through unchanged

pub mod config;
pub mod factory;
pub mod local;
pub mod memory;
pub mod provider;
pub mod quota;
pub mod registry;
pub mod router;

pub use config::{ProviderConfig, StorageConfig};
pub use factory::{CheckReport, ContentProviderFactory};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{
    bytes_stream, reader_stream, ByteStream, ContentProvider, ContentProviderExt, ContentReader,
    Metadata,
};
pub use quota::QuotaTracker;
pub use registry::{create_default_catalog, ProviderBuilder, ProviderCatalog, ProviderRegistry};
pub use router::{
    ContentRouter, FirstProviderRouter, RouteRule, RoutingConfig, RoutingRequest, RuleRouter,
};

pub use crmcontent_common::{Error, Principal, Reference, ResourceUri, Result, TenantId};
pub use tokio_util::sync::CancellationToken;
