//! Image spec providers.
//!
//! A provider resolves the remainder of a repository name (everything
//! after the provider prefix) to an [`ImageSpec`]. The remote provider
//! asks the spec service over gRPC; the caching decorator keeps a bounded
//! LRU of resolved specs and collapses concurrent lookups; the fixed
//! provider serves one config-declared spec for local setups.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, instrument};

use regfacade_protocol::{GetImageSpecRequest, ImageSpecServiceClient};

use crate::error::{FacadeError, Result};
use crate::singleflight::Group;
use crate::spec::ImageSpec;

/// Spec fetches are bounded; a stuck provider must not hold a pull open
/// indefinitely.
const SPEC_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the spec cache.
pub const DEFAULT_SPEC_CACHE_CAPACITY: usize = 128;

/// Resolves remainder names to image specs.
#[async_trait]
pub trait ImageSpecProvider: Send + Sync {
    /// Returns the spec for `name`.
    ///
    /// # Errors
    ///
    /// `NameUnknown` when the name does not exist, `SpecUnavailable` when
    /// the provider cannot be reached, `SpecMalformed` when the response
    /// cannot be used.
    async fn get_spec(&self, name: &str) -> Result<ImageSpec>;
}

/// mTLS material for the spec provider connection.
#[derive(Debug, Clone)]
pub struct ProviderTls {
    /// CA certificate path (PEM).
    pub ca: std::path::PathBuf,
    /// Client certificate path (PEM).
    pub crt: std::path::PathBuf,
    /// Client key path (PEM).
    pub key: std::path::PathBuf,
}

/// Spec provider backed by the remote `ImageSpecService`.
pub struct RemoteSpecProvider {
    client: ImageSpecServiceClient<Channel>,
}

impl RemoteSpecProvider {
    /// Creates a provider for the given endpoint address. The connection
    /// is established lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is invalid or the TLS material
    /// cannot be loaded.
    pub fn new(addr: &str, tls: Option<&ProviderTls>) -> Result<Self> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else if tls.is_some() {
            format!("https://{addr}")
        } else {
            format!("http://{addr}")
        };

        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| FacadeError::Internal(format!("bad spec provider addr {uri}: {e}")))?
            .timeout(SPEC_FETCH_TIMEOUT)
            .connect_timeout(Duration::from_secs(10));

        if let Some(tls) = tls {
            let tls_config = ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(read_pem(&tls.ca)?))
                .identity(Identity::from_pem(read_pem(&tls.crt)?, read_pem(&tls.key)?));
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| FacadeError::Internal(format!("spec provider TLS config: {e}")))?;
            debug!(ca = %tls.ca.display(), crt = %tls.crt.display(), "spec provider uses mTLS");
        }

        Ok(Self {
            client: ImageSpecServiceClient::new(endpoint.connect_lazy()),
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    let path = crate::store::apply_root_prefix(path);
    std::fs::read(&path)
        .map_err(|e| FacadeError::Internal(format!("cannot read {}: {e}", path.display())))
}

#[async_trait]
impl ImageSpecProvider for RemoteSpecProvider {
    #[instrument(skip(self))]
    async fn get_spec(&self, name: &str) -> Result<ImageSpec> {
        let mut request = tonic::Request::new(GetImageSpecRequest {
            id: name.to_string(),
        });

        // Propagate a correlation id so provider-side logs line up with
        // ours.
        let correlation = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = correlation.parse() {
            request.metadata_mut().insert("x-correlation-id", value);
        }
        debug!(name, correlation, "fetching image spec");

        let response = self
            .client
            .clone()
            .get_image_spec(request)
            .await
            .map_err(|status| match status.code() {
                tonic::Code::NotFound => FacadeError::NameUnknown(name.to_string()),
                tonic::Code::InvalidArgument => {
                    FacadeError::SpecMalformed(status.message().to_string())
                }
                _ => FacadeError::SpecUnavailable(format!("{name}: {status}")),
            })?;

        let proto = response
            .into_inner()
            .spec
            .ok_or_else(|| FacadeError::SpecMalformed(format!("{name}: response has no spec")))?;
        ImageSpec::try_from(proto)
    }
}

/// Caching decorator: bounded LRU plus singleflight.
///
/// Entries never expire; they are only evicted under capacity pressure.
/// Failed lookups are not cached, so a transient provider outage heals on
/// the next request.
pub struct CachingSpecProvider<P> {
    inner: Arc<P>,
    cache: Mutex<LruCache<String, ImageSpec>>,
    flight: Arc<Group<String, ImageSpec>>,
}

impl<P: ImageSpecProvider + 'static> CachingSpecProvider<P> {
    /// Wraps `inner` with a cache of the given capacity.
    #[must_use]
    pub fn new(capacity: usize, inner: P) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_SPEC_CACHE_CAPACITY).expect("nonzero"));
        Self {
            inner: Arc::new(inner),
            cache: Mutex::new(LruCache::new(capacity)),
            flight: Arc::new(Group::new()),
        }
    }
}

#[async_trait]
impl<P: ImageSpecProvider + 'static> ImageSpecProvider for CachingSpecProvider<P> {
    async fn get_spec(&self, name: &str) -> Result<ImageSpec> {
        if let Some(spec) = self.cache.lock().await.get(name) {
            return Ok(spec.clone());
        }

        let inner = Arc::clone(&self.inner);
        let key = name.to_string();
        let fetch_name = key.clone();
        let spec = self
            .flight
            .run(key.clone(), move || async move {
                tokio::time::timeout(SPEC_FETCH_TIMEOUT, inner.get_spec(&fetch_name))
                    .await
                    .map_err(|_| {
                        FacadeError::SpecUnavailable(format!("{fetch_name}: spec fetch timed out"))
                    })?
            })
            .await?;

        self.cache.lock().await.put(key, spec.clone());
        Ok(spec)
    }
}

/// Provider serving a single spec declared in the facade's own config.
///
/// Used for setups without a remote spec service: every remainder name
/// resolves to the same composition.
pub struct FixedSpecProvider {
    spec: ImageSpec,
}

impl FixedSpecProvider {
    #[must_use]
    pub fn new(spec: ImageSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl ImageSpecProvider for FixedSpecProvider {
    async fn get_spec(&self, _name: &str) -> Result<ImageSpec> {
        Ok(self.spec.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ImageSpecProvider for CountingProvider {
        async fn get_spec(&self, name: &str) -> Result<ImageSpec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FacadeError::SpecUnavailable("down".to_string()));
            }
            if name == "missing" {
                return Err(FacadeError::NameUnknown(name.to_string()));
            }
            Ok(ImageSpec {
                base_ref: format!("reg.example.com/{name}:1"),
                ..ImageSpec::default()
            })
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inner() {
        let provider = CachingSpecProvider::new(
            8,
            CountingProvider {
                calls: AtomicUsize::new(0),
                fail: false,
            },
        );

        let a = provider.get_spec("acme/alice").await.unwrap();
        let b = provider.get_spec("acme/alice").await.unwrap();
        assert_eq!(a.base_ref, b.base_ref);
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_collapse() {
        let provider = Arc::new(CachingSpecProvider::new(
            8,
            CountingProvider {
                calls: AtomicUsize::new(0),
                fail: false,
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(
                async move { provider.get_spec("acme/alice").await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_results_not_cached() {
        let provider = CachingSpecProvider::new(
            8,
            CountingProvider {
                calls: AtomicUsize::new(0),
                fail: false,
            },
        );

        for _ in 0..3 {
            let err = provider.get_spec("missing").await.unwrap_err();
            assert!(matches!(err, FacadeError::NameUnknown(_)));
        }
        // Every miss goes back to the inner provider.
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fixed_provider_ignores_name() {
        let provider = FixedSpecProvider::new(ImageSpec {
            base_ref: "reg.example.com/base:1.0".to_string(),
            ..ImageSpec::default()
        });
        let spec = provider.get_spec("anything").await.unwrap();
        assert_eq!(spec.base_ref, "reg.example.com/base:1.0");
    }
}
