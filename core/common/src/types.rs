//! Identity types used throughout content storage.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// Characters escaped inside a single URI path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Address of one stored object.
///
/// Shape: `<scheme>://<namespace>/<object key>`. The scheme names the provider
/// kind and the namespace names the provider instance, which is enough for a
/// provider to claim ownership. The rendered string is stable for the
/// lifetime of the object and safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceUri(Url);

impl ResourceUri {
    /// Parse a URI string.
    ///
    /// # Errors
    /// - Not a URI
    /// - Missing namespace (host) or object key (path)
    /// - Query or fragment present
    pub fn parse(uri: &str) -> crate::Result<Self> {
        let url = Url::parse(uri).map_err(|e| {
            crate::Error::InvalidInput(format!("Invalid resource URI '{}': {}", uri, e))
        })?;
        Self::from_url(url)
    }

    /// Wrap an already parsed URL.
    pub fn from_url(url: Url) -> crate::Result<Self> {
        if url.host_str().map_or(true, str::is_empty) {
            return Err(crate::Error::InvalidInput(format!(
                "Resource URI '{}' has no namespace",
                url
            )));
        }
        if url.path().is_empty() || url.path() == "/" {
            return Err(crate::Error::InvalidInput(format!(
                "Resource URI '{}' has no object key",
                url
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(crate::Error::InvalidInput(format!(
                "Resource URI '{}' must not carry a query or fragment",
                url
            )));
        }
        Ok(Self(url))
    }

    /// Mint a fresh identifier for new content named `name`.
    ///
    /// The key is `/<uuid>/<name>`, so two calls never collide even for the
    /// same name.
    pub fn mint(scheme: &str, namespace: &str, name: &str) -> crate::Result<Self> {
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Content name cannot be empty".to_string(),
            ));
        }
        if name == "." || name == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Content name '{}' is reserved",
                name
            )));
        }
        let key = format!(
            "/{}/{}",
            Uuid::new_v4(),
            utf8_percent_encode(name, SEGMENT)
        );
        Self::for_key(scheme, namespace, &key)
    }

    /// Build an identifier from its parts. `key` must start with `/`.
    pub fn for_key(scheme: &str, namespace: &str, key: &str) -> crate::Result<Self> {
        validate_namespace(namespace)?;
        if !key.starts_with('/') {
            return Err(crate::Error::InvalidInput(format!(
                "Object key '{}' must start with '/'",
                key
            )));
        }
        Self::parse(&format!("{}://{}{}", scheme, namespace, key))
    }

    /// Provider kind this identifier belongs to.
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// Provider instance this identifier belongs to.
    pub fn namespace(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Object key within the namespace, percent-encoded, always starting with `/`.
    pub fn key(&self) -> &str {
        self.0.path()
    }

    /// Decoded last path segment, usually the content name.
    pub fn name(&self) -> Option<String> {
        let last = self.0.path().rsplit('/').next()?;
        if last.is_empty() {
            return None;
        }
        Some(percent_decode_str(last).decode_utf8_lossy().into_owned())
    }

    /// The URI string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The underlying URL.
    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

/// Check that a provider name is usable as a URI namespace.
///
/// Allowed: ASCII lowercase letters, digits, `-`, `_` and `.`, starting with a
/// letter or digit.
pub fn validate_namespace(namespace: &str) -> crate::Result<()> {
    let mut chars = namespace.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_rest = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')
    });
    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(crate::Error::InvalidInput(format!(
            "Invalid provider name '{}': use lowercase letters, digits, '-', '_' or '.'",
            namespace
        )))
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceUri {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceUri {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourceUri> for String {
    fn from(uri: ResourceUri) -> Self {
        uri.0.into()
    }
}

/// Tenant identifier in a multi-tenant deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The acting user, with the tenant they act in.
///
/// The tenant travels with every call instead of living in thread-local
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Username.
    pub username: String,
    /// Tenant the user acts in, if the deployment is multi-tenant.
    #[serde(default)]
    pub tenant: Option<TenantId>,
}

impl Principal {
    /// Create a principal without tenant context.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            tenant: None,
        }
    }

    /// Attach a tenant.
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tenant {
            Some(tenant) => write!(f, "{}[{}]", self.username, tenant),
            None => write!(f, "{}", self.username),
        }
    }
}

/// Handle to the domain object that owns a piece of content, e.g. `invoice@42`.
///
/// Never interpreted by storage; routing rules may look at `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Domain type, e.g. `invoice`.
    pub kind: String,
    /// Identifier within that type.
    pub id: String,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Parse the `kind@id` form.
    pub fn parse(value: &str) -> crate::Result<Self> {
        match value.split_once('@') {
            Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Self::new(kind, id)),
            _ => Err(crate::Error::InvalidInput(format!(
                "Reference '{}' must look like kind@id",
                value
            ))),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.id)
    }
}
