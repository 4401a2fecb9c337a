//! Layer source backed by an image named in the spec.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FacadeError, Result};
use crate::oci::{Digest, ImageManifest};
use crate::singleflight::Group;
use crate::spec::ImageSpec;
use crate::upstream::ResolverFactory;

use super::{BlobRead, LayerEntry, LayerSource};

/// How many resolved references to keep around.
const RESOLVE_CACHE_CAPACITY: usize = 32;

/// Which reference of the spec this source maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSelector {
    /// The workspace base image (`spec.baseRef`).
    Base,
    /// The IDE image (`spec.ideRef`).
    Ide,
}

impl RefSelector {
    /// Selects the reference string from a spec.
    #[must_use]
    pub fn select<'a>(&self, spec: &'a ImageSpec) -> &'a str {
        match self {
            Self::Base => &spec.base_ref,
            Self::Ide => &spec.ide_ref,
        }
    }
}

/// A fully resolved upstream image: manifest, config bytes, and the layer
/// entries it contributes.
#[derive(Debug)]
pub struct ResolvedImage {
    /// The upstream manifest.
    pub manifest: ImageManifest,
    /// Digest of the upstream manifest bytes.
    pub manifest_digest: Digest,
    /// Raw config blob.
    pub config_bytes: Bytes,
    /// Layer entries with diff-ids taken from the config's rootfs.
    pub entries: Vec<LayerEntry>,
}

/// Layer source computed from the image spec.
///
/// The selector picks which of the spec's references this instance maps
/// to. Resolution happens once per reference and is cached; concurrent
/// resolutions of the same reference collapse into one upstream fetch.
pub struct SpecImageSource {
    factory: ResolverFactory,
    selector: RefSelector,
    cache: Mutex<LruCache<String, Arc<ResolvedImage>>>,
    flight: Arc<Group<String, Arc<ResolvedImage>>>,
}

impl SpecImageSource {
    /// Creates a source for the given reference selector.
    #[must_use]
    pub fn new(factory: ResolverFactory, selector: RefSelector) -> Self {
        Self {
            factory,
            selector,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESOLVE_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            flight: Arc::new(Group::new()),
        }
    }

    /// Resolves the selected reference of `spec`, fetching manifest and
    /// config on first use.
    ///
    /// # Errors
    ///
    /// Returns an error when the reference is empty or the upstream fetch
    /// fails.
    pub async fn resolve(&self, spec: &ImageSpec) -> Result<Arc<ResolvedImage>> {
        let reference = self.selector.select(spec);
        if reference.is_empty() {
            return Err(FacadeError::SpecMalformed(format!(
                "spec has no {:?} reference",
                self.selector
            )));
        }

        if let Some(resolved) = self.cache.lock().await.get(reference) {
            return Ok(Arc::clone(resolved));
        }

        let factory = self.factory.clone();
        let key = reference.to_string();
        let fetch_ref = key.clone();
        let resolved = self
            .flight
            .run(key.clone(), move || async move {
                let fetcher = factory.resolver().resolve(&fetch_ref)?;
                let fetched = fetcher.fetch_manifest().await?;
                let config_bytes = fetcher.fetch_bytes(&fetched.manifest.config.digest).await?;

                let entries = entries_with_diff_ids(&fetched.manifest, &config_bytes);
                debug!(
                    reference = %fetch_ref,
                    digest = %fetched.digest,
                    layers = entries.len(),
                    "resolved spec image"
                );

                Ok(Arc::new(ResolvedImage {
                    manifest: fetched.manifest,
                    manifest_digest: fetched.digest,
                    config_bytes,
                    entries,
                }))
            })
            .await?;

        self.cache.lock().await.put(key, Arc::clone(&resolved));
        Ok(resolved)
    }

    fn selected<'a>(&self, spec: &'a ImageSpec) -> &'a str {
        self.selector.select(spec)
    }
}

/// Aligns a manifest's layer descriptors with the config's diff-ids.
pub(super) fn entries_with_diff_ids(
    manifest: &ImageManifest,
    config_bytes: &[u8],
) -> Vec<LayerEntry> {
    let diff_ids: Vec<Option<Digest>> = serde_json::from_slice::<serde_json::Value>(config_bytes)
        .ok()
        .and_then(|config| {
            let ids = config.get("rootfs")?.get("diff_ids")?.as_array()?.clone();
            Some(
                ids.iter()
                    .map(|v| v.as_str().and_then(|s| Digest::parse(s).ok()))
                    .collect(),
            )
        })
        .unwrap_or_default();

    manifest
        .layers
        .iter()
        .enumerate()
        .map(|(i, descriptor)| LayerEntry {
            descriptor: descriptor.clone(),
            diff_id: diff_ids.get(i).cloned().flatten(),
        })
        .collect()
}

#[async_trait]
impl LayerSource for SpecImageSource {
    async fn envelope(&self, spec: &ImageSpec) -> Result<Vec<LayerEntry>> {
        if self.selected(spec).is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.resolve(spec).await?.entries.clone())
    }

    async fn has_blob(&self, spec: &ImageSpec, digest: &Digest) -> bool {
        if self.selected(spec).is_empty() {
            return false;
        }
        match self.resolve(spec).await {
            Ok(resolved) => resolved
                .entries
                .iter()
                .any(|e| &e.descriptor.digest == digest),
            Err(_) => false,
        }
    }

    async fn get_blob(
        &self,
        spec: &ImageSpec,
        digest: &Digest,
        offset: Option<u64>,
    ) -> Result<BlobRead> {
        let reference = self.selected(spec);
        let fetcher = self.factory.resolver().resolve(reference)?;
        let fetch = fetcher.fetch_blob(digest, offset).await?;
        Ok(BlobRead {
            stream: fetch.stream,
            offset: fetch.offset,
            total: fetch.total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_picks_reference() {
        let spec = ImageSpec {
            base_ref: "reg.example.com/base:1".to_string(),
            ide_ref: "reg.example.com/ide:2".to_string(),
            ..ImageSpec::default()
        };
        assert_eq!(RefSelector::Base.select(&spec), "reg.example.com/base:1");
        assert_eq!(RefSelector::Ide.select(&spec), "reg.example.com/ide:2");
    }

    #[test]
    fn test_entries_align_diff_ids() {
        use crate::oci::{Descriptor, MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST};

        let layer_a = Digest::from_bytes(b"a");
        let layer_b = Digest::from_bytes(b"b");
        let diff_a = Digest::from_bytes(b"diff-a");

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: Descriptor::new("cfg", Digest::from_bytes(b"cfg"), 2),
            layers: vec![
                Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, layer_a, 1),
                Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, layer_b, 1),
            ],
        };
        let config = serde_json::json!({
            "rootfs": { "type": "layers", "diff_ids": [diff_a.as_str()] }
        });

        let entries = entries_with_diff_ids(&manifest, &serde_json::to_vec(&config).unwrap());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].diff_id, Some(diff_a));
        // Config shorter than the layer list: the tail has no diff-id.
        assert_eq!(entries[1].diff_id, None);
    }
}
