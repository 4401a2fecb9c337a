//! Manifest synthesis.
//!
//! Turns an [`ImageSpec`] plus the composite layer source into an OCI
//! manifest and config pair. Results are cached by fingerprint - the hash
//! of every resolved input - so identical pulls are answered from memory
//! without touching any upstream.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{FacadeError, Result};
use crate::modifier::ConfigModifier;
use crate::oci::{
    canonical_json, Descriptor, Digest, ImageManifest, MEDIA_TYPE_OCI_CONFIG,
    MEDIA_TYPE_OCI_MANIFEST,
};
use crate::source::{CompositeLayerSource, LayerSource, SpecImageSource};
use crate::spec::ImageSpec;
use crate::store::BlobStore;
use crate::singleflight::Group;

/// Upper bound for one synthesis run, upstream fetches included.
const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(60);

/// How many synthesized manifest/config pairs to keep in memory.
const MANIFEST_CACHE_CAPACITY: usize = 256;

/// A synthesized manifest/config pair.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub manifest_bytes: Bytes,
    pub manifest_digest: Digest,
    pub config_bytes: Bytes,
    pub config_digest: Digest,
}

/// The resolved inputs a synthesis depends on; its canonical hash is the
/// cache key.
#[derive(Serialize)]
struct FingerprintInputs<'a> {
    base_digest: &'a str,
    ide_digest: &'a str,
    layer_digests: Vec<&'a str>,
    env_vars: &'a [String],
    entrypoint: &'a [String],
    user: &'a str,
}

/// Assembles OCI manifests from a spec and the composed layer sources.
pub struct ManifestSynthesizer {
    base: Arc<SpecImageSource>,
    ide: Arc<SpecImageSource>,
    composite: Arc<CompositeLayerSource>,
    modifier: Arc<ConfigModifier>,
    store: Arc<BlobStore>,
    cache: Mutex<LruCache<Digest, Arc<Synthesis>>>,
    flight: Arc<Group<Digest, Arc<Synthesis>>>,
}

impl ManifestSynthesizer {
    /// Wires a synthesizer over the given sources.
    #[must_use]
    pub fn new(
        base: Arc<SpecImageSource>,
        ide: Arc<SpecImageSource>,
        composite: Arc<CompositeLayerSource>,
        modifier: Arc<ConfigModifier>,
        store: Arc<BlobStore>,
    ) -> Self {
        Self {
            base,
            ide,
            composite,
            modifier,
            store,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MANIFEST_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            flight: Arc::new(Group::new()),
        }
    }

    /// Synthesizes (or recalls) the manifest/config pair for `spec`.
    ///
    /// At most one synthesis per fingerprint is in flight; concurrent
    /// callers await the winner. Errors vacate the slot and are never
    /// cached.
    ///
    /// # Errors
    ///
    /// Propagates spec resolution, upstream, and config rewrite failures.
    #[instrument(skip_all, fields(base = %spec.base_ref))]
    pub async fn synthesize(&self, spec: &ImageSpec) -> Result<Arc<Synthesis>> {
        // Resolving the base (and ide) reference is itself cached and
        // deduplicated, so computing the fingerprint for a warm spec does
        // not touch the network.
        let base = self.base.resolve(spec).await?;
        let ide_digest = if spec.ide_ref.is_empty() {
            None
        } else {
            Some(self.ide.resolve(spec).await?.manifest_digest.clone())
        };
        let entries = self.composite.envelope(spec).await?;

        let fingerprint = fingerprint(
            &base.manifest_digest,
            ide_digest.as_ref(),
            &entries,
            spec,
        )?;

        if let Some(synthesis) = self.cache.lock().await.get(&fingerprint) {
            return Ok(Arc::clone(synthesis));
        }

        let modifier = Arc::clone(&self.modifier);
        let store = Arc::clone(&self.store);
        let spec = spec.clone();
        let base_config = base.config_bytes.clone();
        let base_digests: HashSet<Digest> = base
            .entries
            .iter()
            .map(|e| e.descriptor.digest.clone())
            .collect();
        let key = fingerprint.clone();

        let synthesis = self
            .flight
            .run(fingerprint.clone(), move || async move {
                tokio::time::timeout(
                    SYNTHESIS_TIMEOUT,
                    build(&spec, &base_config, &base_digests, entries, &modifier, &store),
                )
                .await
                .map_err(|_| FacadeError::Internal("manifest synthesis timed out".to_string()))?
            })
            .await?;

        self.cache.lock().await.put(key, Arc::clone(&synthesis));
        Ok(synthesis)
    }
}

/// Performs the actual assembly: config rewrite, canonical serialization,
/// digesting, and publishing the config blob into the store.
async fn build(
    spec: &ImageSpec,
    base_config: &[u8],
    base_digests: &HashSet<Digest>,
    entries: Vec<crate::source::LayerEntry>,
    modifier: &ConfigModifier,
    store: &BlobStore,
) -> Result<Arc<Synthesis>> {
    // Layers past the base prefix need their diff-ids appended to the
    // config.
    let appended: Vec<_> = entries
        .iter()
        .filter(|e| !base_digests.contains(&e.descriptor.digest))
        .cloned()
        .collect();

    let config_bytes = modifier.modify(spec, base_config, &appended).await?;
    let config_digest = Digest::from_bytes(&config_bytes);

    // The synthesized config is a blob clients will pull by digest; the
    // store is the only owner that can serve it.
    store.put_bytes(&config_bytes, Some(&config_digest)).await?;

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
        config: Descriptor::new(
            MEDIA_TYPE_OCI_CONFIG,
            config_digest.clone(),
            config_bytes.len() as u64,
        ),
        layers: entries.into_iter().map(|e| e.descriptor).collect(),
    };
    let manifest_bytes = canonical_json(&manifest)?;
    let manifest_digest = Digest::from_bytes(&manifest_bytes);

    debug!(
        manifest = %manifest_digest,
        config = %config_digest,
        layers = manifest.layers.len(),
        "synthesized manifest"
    );

    Ok(Arc::new(Synthesis {
        manifest_bytes: Bytes::from(manifest_bytes),
        manifest_digest,
        config_bytes: Bytes::from(config_bytes),
        config_digest,
    }))
}

/// Hashes the resolved inputs of a synthesis into its cache key.
fn fingerprint(
    base_digest: &Digest,
    ide_digest: Option<&Digest>,
    entries: &[crate::source::LayerEntry],
    spec: &ImageSpec,
) -> Result<Digest> {
    let inputs = FingerprintInputs {
        base_digest: base_digest.as_str(),
        ide_digest: ide_digest.map_or("", Digest::as_str),
        layer_digests: entries
            .iter()
            .map(|e| e.descriptor.digest.as_str())
            .collect(),
        env_vars: &spec.env_vars,
        entrypoint: &spec.entrypoint,
        user: &spec.user,
    };
    Ok(Digest::from_bytes(&canonical_json(&inputs)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LayerEntry;

    fn entry(data: &[u8]) -> LayerEntry {
        LayerEntry {
            descriptor: Descriptor::new(
                crate::oci::MEDIA_TYPE_OCI_LAYER_GZIP,
                Digest::from_bytes(data),
                data.len() as u64,
            ),
            diff_id: None,
        }
    }

    #[test]
    fn test_fingerprint_is_input_sensitive() {
        let base = Digest::from_bytes(b"base manifest");
        let spec = ImageSpec {
            base_ref: "reg.example.com/base:1".to_string(),
            ..ImageSpec::default()
        };
        let entries = vec![entry(b"layer-1")];

        let a = fingerprint(&base, None, &entries, &spec).unwrap();
        let b = fingerprint(&base, None, &entries, &spec).unwrap();
        assert_eq!(a, b, "same inputs, same fingerprint");

        let other_layers = vec![entry(b"layer-2")];
        let c = fingerprint(&base, None, &other_layers, &spec).unwrap();
        assert_ne!(a, c, "layer change must change the fingerprint");

        let other_spec = ImageSpec {
            env_vars: vec!["X=1".to_string()],
            ..spec.clone()
        };
        let d = fingerprint(&base, None, &entries, &other_spec).unwrap();
        assert_ne!(a, d, "override change must change the fingerprint");

        let ide = Digest::from_bytes(b"ide manifest");
        let e = fingerprint(&base, Some(&ide), &entries, &spec).unwrap();
        assert_ne!(a, e, "ide change must change the fingerprint");
    }
}
