//! Layer source for dynamic content layers carried by the spec.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{FacadeError, Result};
use crate::oci::Digest;
use crate::spec::{ContentLayer, ImageSpec, LayerContent};
use crate::store::BlobStore;

use super::{BlobRead, LayerEntry, LayerSource};

/// Serves the spec's `contentLayer` entries.
///
/// Inline payloads are written into the blob store on first use and
/// served from there, which also gives them full range support. URL
/// payloads are streamed through from the upstream on demand.
pub struct ContentLayerSource {
    store: Arc<BlobStore>,
    client: reqwest::Client,
}

impl ContentLayerSource {
    /// Creates a content layer source backed by the given store.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(store: Arc<BlobStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("regfacade/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| FacadeError::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { store, client })
    }

    fn find<'a>(&self, spec: &'a ImageSpec, digest: &Digest) -> Option<&'a ContentLayer> {
        spec.content_layer
            .iter()
            .find(|l| &l.descriptor.digest == digest)
    }

    /// Serves an inline layer, materializing it into the store first.
    async fn serve_inline(
        &self,
        layer: &ContentLayer,
        data: &bytes::Bytes,
        offset: Option<u64>,
    ) -> Result<BlobRead> {
        let digest = &layer.descriptor.digest;
        if !self.store.has(digest).await {
            self.store.put_bytes(data, Some(digest)).await?;
            debug!(digest = %digest, "materialized inline content layer");
        }

        let offset = offset.unwrap_or(0);
        let (reader, _, total) = self.store.open_range(digest, offset, None).await?;
        Ok(BlobRead {
            stream: Box::pin(ReaderStream::new(reader)),
            offset,
            total: Some(total),
        })
    }

    /// Streams a layer through from its upstream URL.
    async fn serve_url(&self, url: &str, offset: Option<u64>) -> Result<BlobRead> {
        let mut request = self.client.get(url);
        if let Some(offset) = offset.filter(|o| *o > 0) {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FacadeError::UpstreamUnavailable(format!("{url}: {e}")))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FacadeError::BlobUnknown(url.to_string()));
        }
        if !status.is_success() {
            return Err(FacadeError::UpstreamUnavailable(format!("{url}: {status}")));
        }

        let served_offset = if status == StatusCode::PARTIAL_CONTENT {
            offset.unwrap_or(0)
        } else {
            0
        };
        let total = response.content_length().map(|l| l + served_offset);

        Ok(BlobRead {
            stream: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed(),
            offset: served_offset,
            total,
        })
    }
}

#[async_trait]
impl LayerSource for ContentLayerSource {
    async fn envelope(&self, spec: &ImageSpec) -> Result<Vec<LayerEntry>> {
        Ok(spec
            .content_layer
            .iter()
            .map(|layer| LayerEntry {
                descriptor: layer.descriptor.clone(),
                diff_id: layer.diff_id.clone(),
            })
            .collect())
    }

    async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        self.find(spec, digest).is_some()
    }

    async fn get_blob(
        &self,
        spec: &ImageSpec,
        digest: &Digest,
        offset: Option<u64>,
    ) -> Result<BlobRead> {
        let layer = self
            .find(spec, digest)
            .ok_or_else(|| FacadeError::BlobUnknown(digest.to_string()))?;

        match &layer.content {
            LayerContent::Inline(data) => self.serve_inline(layer, data, offset).await,
            LayerContent::Url(url) => self.serve_url(url, offset).await,
            LayerContent::None => {
                // No payload carried by the spec; the blob may still have
                // been ingested earlier.
                if self.store.has(digest).await {
                    let offset = offset.unwrap_or(0);
                    let (reader, _, total) = self.store.open_range(digest, offset, None).await?;
                    Ok(BlobRead {
                        stream: Box::pin(ReaderStream::new(reader)),
                        offset,
                        total: Some(total),
                    })
                } else {
                    Err(FacadeError::BlobUnknown(digest.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{Descriptor, MEDIA_TYPE_OCI_LAYER_GZIP};
    use bytes::Bytes;

    fn inline_spec(data: &'static [u8]) -> (ImageSpec, Digest) {
        let digest = Digest::from_bytes(data);
        let spec = ImageSpec {
            base_ref: "reg.example.com/base:1".to_string(),
            content_layer: vec![ContentLayer {
                descriptor: Descriptor::new(
                    MEDIA_TYPE_OCI_LAYER_GZIP,
                    digest.clone(),
                    data.len() as u64,
                ),
                diff_id: None,
                content: LayerContent::Inline(Bytes::from_static(data)),
            }],
            ..ImageSpec::default()
        };
        (spec, digest)
    }

    #[tokio::test]
    async fn test_inline_layer_materializes_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()).unwrap());
        let source = ContentLayerSource::new(Arc::clone(&store)).unwrap();

        let (spec, digest) = inline_spec(b"inline layer bytes");
        assert!(source.has_blob(&spec, &digest).await);
        assert!(!store.has(&digest).await);

        let mut read = source.get_blob(&spec, &digest, None).await.unwrap();
        let mut served = Vec::new();
        while let Some(chunk) = read.stream.next().await {
            served.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(served, b"inline layer bytes");
        assert!(store.has(&digest).await, "first use persists the blob");
    }

    #[tokio::test]
    async fn test_inline_layer_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()).unwrap());
        let source = ContentLayerSource::new(store).unwrap();

        let (spec, digest) = inline_spec(b"0123456789");
        let mut read = source.get_blob(&spec, &digest, Some(4)).await.unwrap();
        assert_eq!(read.offset, 4);

        let mut served = Vec::new();
        while let Some(chunk) = read.stream.next().await {
            served.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(served, b"456789");
    }

    #[tokio::test]
    async fn test_unknown_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()).unwrap());
        let source = ContentLayerSource::new(store).unwrap();

        let (spec, _) = inline_spec(b"data");
        let missing = Digest::from_bytes(b"other");
        assert!(!source.has_blob(&spec, &missing).await);
        assert!(matches!(
            source.get_blob(&spec, &missing, None).await,
            Err(FacadeError::BlobUnknown(_))
        ));
    }
}
