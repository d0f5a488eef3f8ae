//! Content provider trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{stream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use crmcontent_common::{Error, Principal, ResourceUri, Result};

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Identifier of the object.
    pub uri: ResourceUri,
    /// Name the content was stored under.
    pub name: String,
    /// MIME content type.
    pub content_type: String,
    /// Size in bytes.
    pub length: u64,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// CRC-32 of the content as 8 lowercase hex digits.
    pub checksum: Option<String>,
    /// Username of the creator.
    pub principal: Option<String>,
    /// Provider-specific metadata.
    pub provider_data: Option<Value>,
}

impl Metadata {
    /// Last modification time in milliseconds since the Unix epoch.
    pub fn last_modified_millis(&self) -> i64 {
        self.modified.timestamp_millis()
    }

    /// Key/value view of the metadata for hosts that persist it as a map.
    ///
    /// `uri`, `contentType`, `length` and `lastModified` are always present.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("uri".into(), Value::String(self.uri.to_string()));
        map.insert("name".into(), Value::String(self.name.clone()));
        map.insert(
            "contentType".into(),
            Value::String(self.content_type.clone()),
        );
        map.insert("length".into(), Value::from(self.length));
        map.insert(
            "lastModified".into(),
            Value::from(self.last_modified_millis()),
        );
        map.insert("created".into(), Value::from(self.created.timestamp_millis()));
        if let Some(checksum) = &self.checksum {
            map.insert("checksum".into(), Value::String(checksum.clone()));
        }
        if let Some(principal) = &self.principal {
            map.insert("principal".into(), Value::String(principal.clone()));
        }
        if let Some(data) = &self.provider_data {
            map.insert("providerData".into(), data.clone());
        }
        map
    }
}

/// Byte stream type for content transfer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Readable view of stored content.
pub type ContentReader = Pin<Box<dyn AsyncRead + Send>>;

/// Wrap in-memory data as a single-chunk stream.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Wrap any reader as a chunked stream.
pub fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(ReaderStream::new(reader).map_err(Error::from))
}

/// Content provider trait for different storage media.
///
/// A provider owns every URI whose scheme matches [`scheme`](Self::scheme)
/// and whose namespace matches [`name`](Self::name). Implementations guard
/// their own state: concurrent writes to the same URI must not corrupt
/// content or metadata, and the last writer wins unless documented otherwise.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Provider instance name, used as the URI namespace.
    fn name(&self) -> &str;

    /// URI scheme served by this kind of provider (e.g., "mem", "local").
    fn scheme(&self) -> &str;

    /// Decide if this provider owns an existing resource.
    fn handles(&self, uri: &ResourceUri) -> bool {
        uri.scheme() == self.scheme() && uri.namespace() == self.name()
    }

    /// Persist new content.
    ///
    /// # Postconditions
    /// - Content is durable and visible to `exists`/`read` once this returns
    /// - Returns metadata with a freshly minted URI
    ///
    /// # Errors
    /// - Empty name or content type
    /// - Quota exceeded
    /// - I/O errors, including errors yielded by `content`
    async fn create(
        &self,
        content: ByteStream,
        content_type: &str,
        name: &str,
        principal: &Principal,
    ) -> Result<Metadata>;

    /// Replace the content of an existing resource.
    ///
    /// `content_type` of `None` keeps the current type.
    ///
    /// # Errors
    /// - Resource not found
    /// - Quota exceeded
    async fn update(
        &self,
        uri: &ResourceUri,
        content: ByteStream,
        content_type: Option<&str>,
    ) -> Result<Metadata>;

    /// Open the content as a lazily read stream.
    ///
    /// The backing handle is released when the stream is dropped.
    async fn open_read_stream(&self, uri: &ResourceUri) -> Result<ByteStream>;

    /// Write the full content to `sink`.
    ///
    /// Returns the number of bytes written. Bytes already written when a
    /// fault occurs mid-stream stay in the sink.
    async fn read(
        &self,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        uri: &ResourceUri,
    ) -> Result<u64> {
        let mut stream = self.open_read_stream(uri).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }

    /// Copy a resource within this provider.
    ///
    /// Returns `false` when `to` already exists or `from` does not.
    ///
    /// # Errors
    /// - Either URI is not owned by this provider
    /// - Quota exceeded
    async fn copy(&self, from: &ResourceUri, to: &ResourceUri) -> Result<bool>;

    /// Delete a resource. Returns `false` when nothing was deleted.
    async fn delete(&self, uri: &ResourceUri) -> Result<bool>;

    /// Get metadata for a resource.
    ///
    /// # Errors
    /// - Resource not found
    async fn metadata(&self, uri: &ResourceUri) -> Result<Metadata>;

    /// Length of a resource in bytes.
    async fn length(&self, uri: &ResourceUri) -> Result<u64> {
        Ok(self.metadata(uri).await?.length)
    }

    /// Last modification time in milliseconds since the Unix epoch.
    async fn last_modified(&self, uri: &ResourceUri) -> Result<i64> {
        Ok(self.metadata(uri).await?.last_modified_millis())
    }

    /// Check if a resource exists.
    async fn exists(&self, uri: &ResourceUri) -> Result<bool>;

    /// Visit every stored object.
    ///
    /// `visitor` is called once per object; the lengths of objects it
    /// accepts are summed. Only metadata is read. The scan stops between
    /// objects once `cancel` fires and returns the total so far.
    async fn check(
        &self,
        visitor: &mut (dyn for<'u> FnMut(&'u ResourceUri) -> bool + Send),
        cancel: &CancellationToken,
    ) -> Result<u64>;
}

/// Scoped read helpers available on every provider.
#[async_trait]
pub trait ContentProviderExt: ContentProvider {
    /// Open the content as an `AsyncRead`.
    async fn open_reader(&self, uri: &ResourceUri) -> Result<ContentReader> {
        let stream = self.open_read_stream(uri).await?;
        Ok(Box::pin(StreamReader::new(stream)))
    }

    /// Run `work` with a reader over the content.
    ///
    /// The reader is opened before and released after exactly one call to
    /// `work`, whether it succeeds or fails.
    async fn with_readable<T, F>(&self, uri: &ResourceUri, work: F) -> Result<T>
    where
        T: Send,
        F: for<'r> FnOnce(&'r mut ContentReader) -> BoxFuture<'r, Result<T>> + Send,
    {
        let mut reader = self.open_reader(uri).await?;
        let result = work(&mut reader).await;
        drop(reader);
        result
    }

    /// Read the whole content into memory.
    async fn read_to_vec(&self, uri: &ResourceUri) -> Result<Vec<u8>> {
        self.with_readable(uri, |reader| {
            Box::pin(async move {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(buf)
            })
        })
        .await
    }

    /// Read the content as text.
    ///
    /// Supported charsets: UTF-8 (the default) and US-ASCII.
    async fn read_text(&self, uri: &ResourceUri, charset: Option<&str>) -> Result<String> {
        let ascii_only = match charset.map(str::to_ascii_lowercase).as_deref() {
            None | Some("utf-8") | Some("utf8") => false,
            Some("us-ascii") | Some("ascii") => true,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "Unsupported charset: {}",
                    other
                )))
            }
        };

        let bytes = self.read_to_vec(uri).await?;
        if ascii_only && !bytes.is_ascii() {
            return Err(Error::InvalidInput(format!(
                "Content of {} is not US-ASCII",
                uri
            )));
        }
        String::from_utf8(bytes)
            .map_err(|_| Error::InvalidInput(format!("Content of {} is not valid UTF-8", uri)))
    }
}

impl<P: ContentProvider + ?Sized> ContentProviderExt for P {}

/// Reject content types that cannot be stored.
pub(crate) fn validate_content_type(content_type: &str) -> Result<()> {
    if content_type.trim().is_empty() {
        return Err(Error::InvalidInput(
            "Content type cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Render a CRC-32 the way metadata carries it.
pub(crate) fn checksum_hex(crc: u32) -> String {
    format!("{:08x}", crc)
}
