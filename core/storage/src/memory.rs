//! In-memory content provider.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{stream, StreamExt};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crmcontent_common::{validate_namespace, Error, Principal, ResourceUri, Result};

use crate::provider::{
    checksum_hex, validate_content_type, ByteStream, ContentProvider, Metadata,
};
use crate::quota::QuotaTracker;

/// URI scheme of memory providers.
pub const MEMORY_SCHEME: &str = "mem";

/// In-memory storage entry.
#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    metadata: Metadata,
}

/// In-memory content provider.
///
/// Useful for testing and scratch content. All data is stored in memory and
/// lost on drop. Writes are visible to readers as soon as they return.
pub struct MemoryProvider {
    name: String,
    storage: RwLock<BTreeMap<String, Entry>>,
    quota: QuotaTracker,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    ///
    /// # Errors
    /// - `name` is not a valid URI namespace
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_namespace(&name)?;
        let quota = QuotaTracker::new(name.clone(), None, 0);
        Ok(Self {
            name,
            storage: RwLock::new(BTreeMap::new()),
            quota,
        })
    }

    /// Limit the total bytes this provider may hold.
    pub fn with_quota(mut self, limit: u64) -> Self {
        self.quota = QuotaTracker::new(self.name.clone(), Some(limit), self.quota.used());
        self
    }

    /// Quota accounting for this provider.
    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Entry>>> {
        self.storage
            .read()
            .map_err(|_| Error::Storage(format!("Provider '{}' lock poisoned", self.name)))
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Entry>>> {
        self.storage
            .write()
            .map_err(|_| Error::Storage(format!("Provider '{}' lock poisoned", self.name)))
    }

    fn ensure_owned(&self, uri: &ResourceUri) -> Result<()> {
        if self.handles(uri) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "Provider '{}' does not handle {}",
                self.name, uri
            )))
        }
    }

    /// Drain a stream, failing as soon as the data cannot fit the quota.
    async fn collect(&self, mut content: ByteStream, already_owned: u64) -> Result<Bytes> {
        let mut data = BytesMut::new();
        while let Some(chunk) = content.next().await {
            data.extend_from_slice(&chunk?);
            let growth = (data.len() as u64).saturating_sub(already_owned);
            self.quota.ensure_fits(growth)?;
        }
        Ok(data.freeze())
    }
}

#[async_trait]
impl ContentProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    async fn create(
        &self,
        content: ByteStream,
        content_type: &str,
        name: &str,
        principal: &Principal,
    ) -> Result<Metadata> {
        validate_content_type(content_type)?;
        let uri = ResourceUri::mint(MEMORY_SCHEME, &self.name, name)?;
        let data = self.collect(content, 0).await?;

        let now = Utc::now();
        let metadata = Metadata {
            uri: uri.clone(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            length: data.len() as u64,
            created: now,
            modified: now,
            checksum: Some(checksum_hex(crc32fast::hash(&data))),
            principal: Some(principal.username.clone()),
            provider_data: None,
        };

        let mut storage = self.write_storage()?;
        self.quota.reserve(metadata.length)?;
        storage.insert(
            uri.key().to_string(),
            Entry {
                data,
                metadata: metadata.clone(),
            },
        );
        debug!(provider = %self.name, uri = %uri, length = metadata.length, "Created content");

        Ok(metadata)
    }

    async fn update(
        &self,
        uri: &ResourceUri,
        content: ByteStream,
        content_type: Option<&str>,
    ) -> Result<Metadata> {
        if let Some(content_type) = content_type {
            validate_content_type(content_type)?;
        }
        let current = self.metadata(uri).await?.length;
        let data = self.collect(content, current).await?;

        let mut storage = self.write_storage()?;
        let entry = storage
            .get_mut(uri.key())
            .filter(|_| self.handles(uri))
            .ok_or_else(|| Error::NotFound(format!("Resource not found: {}", uri)))?;

        let new_length = data.len() as u64;
        self.quota.resize(entry.metadata.length, new_length)?;

        entry.metadata.length = new_length;
        entry.metadata.modified = Utc::now();
        entry.metadata.checksum = Some(checksum_hex(crc32fast::hash(&data)));
        if let Some(content_type) = content_type {
            entry.metadata.content_type = content_type.to_string();
        }
        entry.data = data;
        debug!(provider = %self.name, uri = %uri, length = new_length, "Updated content");

        Ok(entry.metadata.clone())
    }

    async fn open_read_stream(&self, uri: &ResourceUri) -> Result<ByteStream> {
        let data = {
            let storage = self.read_storage()?;
            match storage.get(uri.key()) {
                Some(entry) if self.handles(uri) => entry.data.clone(),
                _ => return Err(Error::NotFound(format!("Resource not found: {}", uri))),
            }
        };
        Ok(Box::pin(stream::once(async move { Ok(data) })))
    }

    async fn copy(&self, from: &ResourceUri, to: &ResourceUri) -> Result<bool> {
        self.ensure_owned(from)?;
        self.ensure_owned(to)?;

        let mut storage = self.write_storage()?;
        if storage.contains_key(to.key()) {
            return Ok(false);
        }
        let Some(source) = storage.get(from.key()) else {
            return Ok(false);
        };

        self.quota.reserve(source.metadata.length)?;
        let now = Utc::now();
        let metadata = Metadata {
            uri: to.clone(),
            name: to.name().unwrap_or_else(|| source.metadata.name.clone()),
            created: now,
            modified: now,
            ..source.metadata.clone()
        };
        let entry = Entry {
            data: source.data.clone(),
            metadata,
        };
        storage.insert(to.key().to_string(), entry);
        debug!(provider = %self.name, from = %from, to = %to, "Copied content");

        Ok(true)
    }

    async fn delete(&self, uri: &ResourceUri) -> Result<bool> {
        if !self.handles(uri) {
            return Ok(false);
        }
        let removed = self.write_storage()?.remove(uri.key());
        match removed {
            Some(entry) => {
                self.quota.release(entry.metadata.length);
                debug!(provider = %self.name, uri = %uri, "Deleted content");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn metadata(&self, uri: &ResourceUri) -> Result<Metadata> {
        let storage = self.read_storage()?;
        match storage.get(uri.key()) {
            Some(entry) if self.handles(uri) => Ok(entry.metadata.clone()),
            _ => Err(Error::NotFound(format!("Resource not found: {}", uri))),
        }
    }

    async fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        Ok(self.handles(uri) && self.read_storage()?.contains_key(uri.key()))
    }

    async fn check(
        &self,
        visitor: &mut (dyn for<'u> FnMut(&'u ResourceUri) -> bool + Send),
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut total = 0u64;
        let mut cursor: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                debug!(provider = %self.name, total, "Check cancelled");
                break;
            }

            // One lock acquisition per object; entries written meanwhile
            // are picked up if they sort after the cursor.
            let next = {
                let storage = self.read_storage()?;
                let lower = match &cursor {
                    Some(key) => Bound::Excluded(key.as_str()),
                    None => Bound::Unbounded,
                };
                storage
                    .range::<str, _>((lower, Bound::Unbounded))
                    .next()
                    .map(|(key, entry)| {
                        (key.clone(), entry.metadata.uri.clone(), entry.metadata.length)
                    })
            };

            let Some((key, uri, length)) = next else {
                break;
            };
            if visitor(&uri) {
                total += length;
            }
            cursor = Some(key);
        }

        Ok(total)
    }
}
