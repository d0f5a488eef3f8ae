//! Local filesystem content provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crmcontent_common::{validate_namespace, Error, Principal, ResourceUri, Result};

use crate::provider::{
    checksum_hex, validate_content_type, ByteStream, ContentProvider, Metadata,
};
use crate::quota::QuotaTracker;

/// URI scheme of local providers.
pub const LOCAL_SCHEME: &str = "local";

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const CONTENT_FILE: &str = "content";
const META_FILE: &str = "meta.json";

/// Local filesystem content provider.
///
/// Layout under the root directory:
/// - `objects/<object id>/content`: the bytes
/// - `objects/<object id>/meta.json`: the metadata, including the full URI
/// - `tmp/`: in-flight writes
///
/// The object id is a name-based UUID of the URI, so directory names have a
/// fixed length whatever the content name is. Every write lands in `tmp/`,
/// is synced, then renamed into place, so readers see either the old or the
/// new content and the last writer wins.
pub struct LocalProvider {
    name: String,
    root: PathBuf,
    quota: QuotaTracker,
    /// Serializes the short commit step of writes and deletes.
    commit: Mutex<()>,
}

impl LocalProvider {
    /// Create a new local provider with the given root directory.
    ///
    /// # Postconditions
    /// - Root, objects and tmp directories exist
    /// - Leftover temp files from interrupted writes are removed
    /// - Quota usage reflects the objects already on disk
    ///
    /// # Errors
    /// - Invalid provider name
    /// - Permission denied
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let name = name.into();
        validate_namespace(&name)?;
        let root = root.as_ref().to_path_buf();

        // Sync I/O is fine here: providers are built once at startup.
        std::fs::create_dir_all(root.join(OBJECTS_DIR))?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;

        for entry in std::fs::read_dir(root.join(TMP_DIR))? {
            let path = entry?.path();
            debug!(provider = %name, path = ?path, "Removing stale temp file");
            std::fs::remove_file(&path)?;
        }

        let mut used = 0u64;
        for entry in std::fs::read_dir(root.join(OBJECTS_DIR))? {
            match std::fs::metadata(entry?.path().join(CONTENT_FILE)) {
                Ok(meta) => used += meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let quota = QuotaTracker::new(name.clone(), None, used);
        Ok(Self {
            name,
            root,
            quota,
            commit: Mutex::new(()),
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

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one object.
    fn object_dir(&self, uri: &ResourceUri) -> Result<PathBuf> {
        if !self.handles(uri) {
            return Err(Error::InvalidInput(format!(
                "Provider '{}' does not handle {}",
                self.name, uri
            )));
        }
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, uri.as_str().as_bytes());
        Ok(self.root.join(OBJECTS_DIR).join(id.to_string()))
    }

    /// Like `object_dir`, but `None` for URIs this provider does not own.
    fn owned_object_dir(&self, uri: &ResourceUri) -> Option<PathBuf> {
        self.object_dir(uri).ok()
    }

    fn tmp_path(&self) -> PathBuf {
        self.root.join(TMP_DIR).join(Uuid::new_v4().to_string())
    }

    /// Write a stream into a synced temp file.
    ///
    /// Returns the temp path, the length and the CRC-32. Fails early when the
    /// data cannot fit the quota; the temp file is removed on every error.
    async fn spool(&self, mut content: ByteStream, already_owned: u64) -> Result<(PathBuf, u64, u32)> {
        let tmp = self.tmp_path();
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            let mut hasher = crc32fast::Hasher::new();
            let mut length = 0u64;
            while let Some(chunk) = content.next().await {
                let chunk = chunk?;
                length += chunk.len() as u64;
                self.quota.ensure_fits(length.saturating_sub(already_owned))?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            Ok::<_, Error>((length, hasher.finalize()))
        }
        .await;

        match result {
            Ok((length, crc)) => Ok((tmp, length, crc)),
            Err(e) => {
                discard(&tmp).await;
                Err(e)
            }
        }
    }

    /// Write metadata into a synced temp file, ready to be renamed into place.
    async fn stage_metadata(&self, metadata: &Metadata) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = self.tmp_path();
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            Ok::<_, Error>(())
        }
        .await;
        match result {
            Ok(()) => Ok(tmp),
            Err(e) => {
                discard(&tmp).await;
                Err(e)
            }
        }
    }

    async fn write_metadata(&self, dir: &Path, metadata: &Metadata) -> Result<()> {
        let staged = self.stage_metadata(metadata).await?;
        if let Err(e) = fs::rename(&staged, dir.join(META_FILE)).await {
            discard(&staged).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Stored metadata of an object directory, `None` if it has none yet.
    async fn load_metadata(dir: &Path) -> Result<Option<Metadata>> {
        let json = match fs::read(dir.join(META_FILE)).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read stored metadata, with length and modification time from disk.
    async fn read_metadata(&self, dir: &Path, uri: &ResourceUri) -> Result<Metadata> {
        let not_found = || Error::NotFound(format!("Resource not found: {}", uri));

        let mut metadata = Self::load_metadata(dir)
            .await?
            .filter(|metadata| metadata.uri == *uri)
            .ok_or_else(not_found)?;

        let fs_meta = fs::metadata(dir.join(CONTENT_FILE))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => not_found(),
                _ => e.into(),
            })?;
        metadata.length = fs_meta.len();
        if let Ok(modified) = fs_meta.modified() {
            metadata.modified = DateTime::<Utc>::from(modified);
        }
        Ok(metadata)
    }

    async fn content_length(dir: &Path) -> Result<Option<u64>> {
        match fs::metadata(dir.join(CONTENT_FILE)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Undo a quota resize from `old` to `new` bytes.
    fn restore_quota(&self, old: u64, new: u64) {
        if let Err(e) = self.quota.resize(new, old) {
            warn!(provider = %self.name, error = %e, "Failed to restore quota after aborted write");
        }
    }
}

/// Best-effort removal of a temp file after a failed write.
async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove temp file");
        }
    }
}

#[async_trait]
impl ContentProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> &str {
        LOCAL_SCHEME
    }

    async fn create(
        &self,
        content: ByteStream,
        content_type: &str,
        name: &str,
        principal: &Principal,
    ) -> Result<Metadata> {
        validate_content_type(content_type)?;
        let uri = ResourceUri::mint(LOCAL_SCHEME, &self.name, name)?;
        let dir = self.object_dir(&uri)?;
        let (tmp, length, crc) = self.spool(content, 0).await?;

        let now = Utc::now();
        let metadata = Metadata {
            uri: uri.clone(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            length,
            created: now,
            modified: now,
            checksum: Some(checksum_hex(crc)),
            principal: Some(principal.username.clone()),
            provider_data: None,
        };

        let _guard = self.commit.lock().await;
        if let Err(e) = self.quota.reserve(length) {
            discard(&tmp).await;
            return Err(e);
        }
        let result = async {
            fs::create_dir(&dir).await?;
            fs::rename(&tmp, dir.join(CONTENT_FILE)).await?;
            self.write_metadata(&dir, &metadata).await
        }
        .await;

        if let Err(e) = result {
            self.quota.release(length);
            discard(&tmp).await;
            let _ = fs::remove_dir_all(&dir).await;
            return Err(e);
        }
        debug!(provider = %self.name, uri = %uri, length, "Created content");

        Ok(metadata)
    }

    /// Replace the content of an existing object.
    ///
    /// Content and metadata are both synced to temp files before either is
    /// moved into place, so a failed stream, quota check or metadata write
    /// leaves the object untouched. Only a failure of the final metadata
    /// rename, after the content rename succeeded, leaves the new content
    /// next to the previous metadata; the error is returned in that case.
    async fn update(
        &self,
        uri: &ResourceUri,
        content: ByteStream,
        content_type: Option<&str>,
    ) -> Result<Metadata> {
        if let Some(content_type) = content_type {
            validate_content_type(content_type)?;
        }
        let dir = self
            .owned_object_dir(uri)
            .ok_or_else(|| Error::NotFound(format!("Resource not found: {}", uri)))?;
        let current = self.read_metadata(&dir, uri).await?;
        let (tmp, length, crc) = self.spool(content, current.length).await?;

        let _guard = self.commit.lock().await;

        // Re-read under the commit lock: a concurrent writer may have
        // changed or deleted the object while we were spooling.
        let mut metadata = match self.read_metadata(&dir, uri).await {
            Ok(metadata) => metadata,
            Err(e) => {
                discard(&tmp).await;
                return Err(e);
            }
        };
        let previous = metadata.length;
        if let Err(e) = self.quota.resize(previous, length) {
            discard(&tmp).await;
            return Err(e);
        }

        metadata.length = length;
        metadata.modified = Utc::now();
        metadata.checksum = Some(checksum_hex(crc));
        if let Some(content_type) = content_type {
            metadata.content_type = content_type.to_string();
        }

        let staged = match self.stage_metadata(&metadata).await {
            Ok(staged) => staged,
            Err(e) => {
                self.restore_quota(previous, length);
                discard(&tmp).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, dir.join(CONTENT_FILE)).await {
            self.restore_quota(previous, length);
            discard(&tmp).await;
            discard(&staged).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&staged, dir.join(META_FILE)).await {
            warn!(provider = %self.name, uri = %uri, error = %e, "Content replaced but metadata rename failed");
            discard(&staged).await;
            return Err(e.into());
        }
        debug!(provider = %self.name, uri = %uri, length, "Updated content");

        Ok(metadata)
    }

    async fn open_read_stream(&self, uri: &ResourceUri) -> Result<ByteStream> {
        let dir = self
            .owned_object_dir(uri)
            .ok_or_else(|| Error::NotFound(format!("Resource not found: {}", uri)))?;
        let file = fs::File::open(dir.join(CONTENT_FILE))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::NotFound(format!("Resource not found: {}", uri)),
                _ => e.into(),
            })?;
        Ok(crate::provider::reader_stream(file))
    }

    async fn copy(&self, from: &ResourceUri, to: &ResourceUri) -> Result<bool> {
        let from_dir = self.object_dir(from)?;
        let to_dir = self.object_dir(to)?;

        let _guard = self.commit.lock().await;
        if fs::try_exists(&to_dir).await? {
            return Ok(false);
        }
        let source = match self.read_metadata(&from_dir, from).await {
            Ok(metadata) => metadata,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        self.quota.reserve(source.length)?;
        let tmp = self.tmp_path();
        let now = Utc::now();
        let metadata = Metadata {
            uri: to.clone(),
            name: to.name().unwrap_or_else(|| source.name.clone()),
            created: now,
            modified: now,
            ..source.clone()
        };

        let result = async {
            fs::copy(from_dir.join(CONTENT_FILE), &tmp).await?;
            fs::create_dir(&to_dir).await?;
            fs::rename(&tmp, to_dir.join(CONTENT_FILE)).await?;
            self.write_metadata(&to_dir, &metadata).await
        }
        .await;

        if let Err(e) = result {
            self.quota.release(source.length);
            discard(&tmp).await;
            let _ = fs::remove_dir_all(&to_dir).await;
            return Err(e);
        }
        debug!(provider = %self.name, from = %from, to = %to, "Copied content");

        Ok(true)
    }

    async fn delete(&self, uri: &ResourceUri) -> Result<bool> {
        let Some(dir) = self.owned_object_dir(uri) else {
            return Ok(false);
        };

        let _guard = self.commit.lock().await;
        let length = Self::content_length(&dir).await?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.quota.release(length.unwrap_or(0));
        debug!(provider = %self.name, uri = %uri, "Deleted content");

        Ok(true)
    }

    async fn metadata(&self, uri: &ResourceUri) -> Result<Metadata> {
        let dir = self
            .owned_object_dir(uri)
            .ok_or_else(|| Error::NotFound(format!("Resource not found: {}", uri)))?;
        self.read_metadata(&dir, uri).await
    }

    async fn length(&self, uri: &ResourceUri) -> Result<u64> {
        let dir = self
            .owned_object_dir(uri)
            .ok_or_else(|| Error::NotFound(format!("Resource not found: {}", uri)))?;
        Self::content_length(&dir)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Resource not found: {}", uri)))
    }

    async fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        match self.owned_object_dir(uri) {
            Some(dir) => Ok(fs::try_exists(dir.join(CONTENT_FILE)).await?),
            None => Ok(false),
        }
    }

    async fn check(
        &self,
        visitor: &mut (dyn for<'u> FnMut(&'u ResourceUri) -> bool + Send),
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(self.root.join(OBJECTS_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                debug!(provider = %self.name, total, "Check cancelled");
                break;
            }

            let dir = entry.path();
            let metadata = match Self::load_metadata(&dir).await {
                Ok(Some(metadata)) => metadata,
                // Still being created, or deleted since read_dir listed it.
                Ok(None) => continue,
                Err(e) => {
                    warn!(provider = %self.name, dir = ?dir, error = %e, "Skipping unreadable object");
                    continue;
                }
            };
            let Some(length) = Self::content_length(&dir).await? else {
                continue;
            };
            if visitor(&metadata.uri) {
                total += length;
            }
        }

        Ok(total)
    }
}
