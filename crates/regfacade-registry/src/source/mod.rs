//! Layer sources.
//!
//! A layer source contributes layers to synthesized manifests and serves
//! the corresponding blobs. The facade composes a small closed set of
//! variants:
//!
//! - [`SpecImageSource`] - layers of an image named by the spec
//!   (`base` or `ide` selector)
//! - [`StaticImageSource`] - layers of one reference pinned at startup
//! - [`FileLayerSource`] - a local gzip'd tar file as a single layer
//! - [`ContentLayerSource`] - dynamic layers carried by the spec itself
//! - [`CompositeLayerSource`] - ordered concatenation of the above
//!
//! [`SpecImageSource`]: spec_image::SpecImageSource
//! [`StaticImageSource`]: static_image::StaticImageSource
//! [`FileLayerSource`]: file::FileLayerSource
//! [`ContentLayerSource`]: content::ContentLayerSource

mod content;
mod file;
mod spec_image;
mod static_image;

pub use content::ContentLayerSource;
pub use file::FileLayerSource;
pub use spec_image::{RefSelector, ResolvedImage, SpecImageSource};
pub use static_image::StaticImageSource;

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::{FacadeError, Result};
use crate::oci::{Descriptor, Digest};
use crate::spec::ImageSpec;

/// Stream of blob bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// One layer contributed by a source: the descriptor that goes into the
/// manifest plus the diff-id when the source already knows it.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    /// Descriptor of the compressed layer blob.
    pub descriptor: Descriptor,
    /// Digest of the uncompressed tar, if known. Unknown diff-ids are
    /// computed during config synthesis and cached.
    pub diff_id: Option<Digest>,
}

/// A blob read handed out by a source.
pub struct BlobRead {
    /// Byte stream starting at `offset`.
    pub stream: ByteStream,
    /// Offset at which the stream begins. Sources that cannot seek return
    /// zero and leave prefix-discarding to the caller.
    pub offset: u64,
    /// Total blob size when known.
    pub total: Option<u64>,
}

/// Capability set of a layer provider.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Layer descriptors this source contributes for the given spec, in
    /// stacking order.
    async fn envelope(&self, spec: &ImageSpec) -> Result<Vec<LayerEntry>>;

    /// Whether this source can serve the blob.
    async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool;

    /// Opens the blob for reading, optionally from `offset`.
    async fn get_blob(
        &self,
        spec: &ImageSpec,
        digest: &Digest,
        offset: Option<u64>,
    ) -> Result<BlobRead>;
}

/// Ordered concatenation of layer sources.
///
/// Enumeration walks children in declared order and drops duplicate
/// digests; the earlier child wins. Blob dispatch goes to the first child
/// claiming the digest.
pub struct CompositeLayerSource {
    children: Vec<Arc<dyn LayerSource>>,
}

impl CompositeLayerSource {
    /// Builds a composite over the given children. The child order is the
    /// final filesystem stacking order and is fixed for the lifetime of
    /// the composite.
    #[must_use]
    pub fn new(children: Vec<Arc<dyn LayerSource>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl LayerSource for CompositeLayerSource {
    async fn envelope(&self, spec: &ImageSpec) -> Result<Vec<LayerEntry>> {
        let mut seen: HashSet<Digest> = HashSet::new();
        let mut entries = Vec::new();
        for child in &self.children {
            for entry in child.envelope(spec).await? {
                if seen.insert(entry.descriptor.digest.clone()) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        for child in &self.children {
            if child.has_blob(spec, digest).await {
                return true;
            }
        }
        false
    }

    async fn get_blob(
        &self,
        spec: &ImageSpec,
        digest: &Digest,
        offset: Option<u64>,
    ) -> Result<BlobRead> {
        for child in &self.children {
            if child.has_blob(spec, digest).await {
                return child.get_blob(spec, digest, offset).await;
            }
        }
        Err(FacadeError::BlobUnknown(digest.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use futures::stream;

    /// In-memory layer source for unit tests.
    pub struct FixedSource {
        pub entries: Vec<(LayerEntry, Bytes)>,
    }

    impl FixedSource {
        pub fn new(layers: Vec<(&str, Bytes)>) -> Self {
            let entries = layers
                .into_iter()
                .map(|(media_type, data)| {
                    let digest = Digest::from_bytes(&data);
                    (
                        LayerEntry {
                            descriptor: Descriptor::new(media_type, digest, data.len() as u64),
                            diff_id: None,
                        },
                        data,
                    )
                })
                .collect();
            Self { entries }
        }
    }

    #[async_trait]
    impl LayerSource for FixedSource {
        async fn envelope(&self, _spec: &ImageSpec) -> Result<Vec<LayerEntry>> {
            Ok(self.entries.iter().map(|(e, _)| e.clone()).collect())
        }

        async fn has_blob(&self, _spec: &ImageSpec, digest: &Digest) -> bool {
            self.entries
                .iter()
                .any(|(e, _)| &e.descriptor.digest == digest)
        }

        async fn get_blob(
            &self,
            _spec: &ImageSpec,
            digest: &Digest,
            offset: Option<u64>,
        ) -> Result<BlobRead> {
            let (_, data) = self
                .entries
                .iter()
                .find(|(e, _)| &e.descriptor.digest == digest)
                .ok_or_else(|| FacadeError::BlobUnknown(digest.to_string()))?;
            let total = data.len() as u64;
            let start = offset.unwrap_or(0).min(total);
            let chunk = data.slice(start as usize..);
            Ok(BlobRead {
                stream: Box::pin(stream::once(async move { Ok(chunk) })),
                offset: start,
                total: Some(total),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::FixedSource;
    use super::*;

    #[tokio::test]
    async fn test_composite_dedups_earlier_child_wins() {
        let shared = Bytes::from_static(b"shared layer");
        let first = FixedSource::new(vec![
            ("application/vnd.oci.image.layer.v1.tar+gzip", shared.clone()),
            (
                "application/vnd.oci.image.layer.v1.tar+gzip",
                Bytes::from_static(b"only in first"),
            ),
        ]);
        let second = FixedSource::new(vec![
            ("application/vnd.oci.image.layer.v1.tar+gzip", shared.clone()),
            (
                "application/vnd.oci.image.layer.v1.tar+gzip",
                Bytes::from_static(b"only in second"),
            ),
        ]);

        let composite = CompositeLayerSource::new(vec![Arc::new(first), Arc::new(second)]);
        let spec = ImageSpec::default();
        let entries = composite.envelope(&spec).await.unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].descriptor.digest, Digest::from_bytes(&shared));
        // No digest appears twice.
        let digests: HashSet<_> = entries.iter().map(|e| &e.descriptor.digest).collect();
        assert_eq!(digests.len(), entries.len());
    }

    #[tokio::test]
    async fn test_composite_dispatches_to_owner() {
        let a = Bytes::from_static(b"aaa");
        let b = Bytes::from_static(b"bbb");
        let composite = CompositeLayerSource::new(vec![
            Arc::new(FixedSource::new(vec![("t", a.clone())])),
            Arc::new(FixedSource::new(vec![("t", b.clone())])),
        ]);
        let spec = ImageSpec::default();

        let digest_b = Digest::from_bytes(&b);
        assert!(composite.has_blob(&spec, &digest_b).await);
        let read = composite.get_blob(&spec, &digest_b, None).await.unwrap();
        assert_eq!(read.total, Some(3));

        let missing = Digest::from_bytes(b"missing");
        assert!(!composite.has_blob(&spec, &missing).await);
        assert!(matches!(
            composite.get_blob(&spec, &missing, None).await,
            Err(FacadeError::BlobUnknown(_))
        ));
    }
}
