//! Layer source pinned to one image reference at construction.

use async_trait::async_trait;

use crate::error::Result;
use crate::oci::Digest;
use crate::spec::ImageSpec;
use crate::upstream::ResolverFactory;

use super::spec_image::entries_with_diff_ids;
use super::{BlobRead, LayerEntry, LayerSource};

/// Serves the layers of a fixed reference.
///
/// The manifest is fetched once at startup; afterwards the source answers
/// from its captured descriptor set. Blob reads go to the upstream on
/// demand with a fresh resolver per request.
pub struct StaticImageSource {
    factory: ResolverFactory,
    reference: String,
    entries: Vec<LayerEntry>,
}

impl StaticImageSource {
    /// Resolves `reference` and captures its layer set.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream manifest or config cannot be
    /// fetched.
    pub async fn new(factory: ResolverFactory, reference: impl Into<String>) -> Result<Self> {
        let reference = reference.into();
        let fetcher = factory.resolver().resolve(&reference)?;
        let fetched = fetcher.fetch_manifest().await?;
        let config_bytes = fetcher.fetch_bytes(&fetched.manifest.config.digest).await?;
        let entries = entries_with_diff_ids(&fetched.manifest, &config_bytes);

        tracing::info!(
            reference = %reference,
            layers = entries.len(),
            "captured static image layers"
        );

        Ok(Self {
            factory,
            reference,
            entries,
        })
    }

    /// The pinned reference.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

#[async_trait]
impl LayerSource for StaticImageSource {
    async fn envelope(&self, _spec: &ImageSpec) -> Result<Vec<LayerEntry>> {
        Ok(self.entries.clone())
    }

    async fn has_blob(&self, _spec: &ImageSpec, digest: &Digest) -> bool {
        self.entries.iter().any(|e| &e.descriptor.digest == digest)
    }

    async fn get_blob(
        &self,
        _spec: &ImageSpec,
        digest: &Digest,
        offset: Option<u64>,
    ) -> Result<BlobRead> {
        let fetcher = self.factory.resolver().resolve(&self.reference)?;
        let fetch = fetcher.fetch_blob(digest, offset).await?;
        Ok(BlobRead {
            stream: fetch.stream,
            offset: fetch.offset,
            total: fetch.total,
        })
    }
}
