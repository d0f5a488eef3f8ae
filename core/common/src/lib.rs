//! Common types shared by the content-storage crates.
//!
//! This module provides the error taxonomy and the identity types that flow
//! through every provider call: resource identifiers, principals, tenants and
//! domain references.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{validate_namespace, Principal, Reference, ResourceUri, TenantId};
