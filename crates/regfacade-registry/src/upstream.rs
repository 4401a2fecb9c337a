//! Upstream registry access.
//!
//! A [`ResolverFactory`] hands out per-request [`Resolver`]s with
//! independent auth state, so concurrent pulls cannot interfere through
//! shared tokens. A resolver turns an image reference into a [`Fetcher`]
//! that reads the manifest and blobs of that reference from the upstream
//! registry, with bearer-token authentication and bounded retries for
//! transient failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

use crate::error::{FacadeError, Result};
use crate::oci::{
    select_platform_manifest, Digest, ImageManifest, ManifestList, MEDIA_TYPE_MANIFEST_LIST,
    MEDIA_TYPE_MANIFEST_V2, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::source::ByteStream;

/// Docker Hub registry URL.
const DOCKER_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Accept header value for manifest requests.
const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

/// Maximum attempts for transient upstream failures.
const MAX_ATTEMPTS: u32 = 3;

/// Timeout applied to manifest and config requests. Blob streaming has no
/// total timeout; idle detection happens in the blob router.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Image reference (e.g. "registry.example.com/workspace/base:1.0").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry host (e.g. "docker.io").
    pub registry: String,
    /// Repository (e.g. "library/nginx").
    pub repository: String,
    /// Tag or digest.
    pub reference: String,
}

impl ImageRef {
    /// Parses an image reference string.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` when the reference is empty.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(FacadeError::UpstreamUnavailable(
                "empty image reference".to_string(),
            ));
        }

        let (registry, rest) = match s.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') => (host, rest),
            _ => ("docker.io", s),
        };

        let (repository, reference) = if let Some(idx) = rest.find('@') {
            (&rest[..idx], &rest[idx + 1..])
        } else if let Some(idx) = rest.rfind(':') {
            (&rest[..idx], &rest[idx + 1..])
        } else {
            (rest, "latest")
        };

        let repository = if registry == "docker.io" && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            reference: reference.to_string(),
        })
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.reference)
    }
}

/// Registry authentication credentials.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

/// Token response from a registry auth service.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// WWW-Authenticate challenge parsed from a 401 response.
#[derive(Debug, Default)]
struct AuthChallenge {
    realm: String,
    service: String,
    scope: String,
}

/// Factory producing resolvers with independent state per request.
///
/// The underlying HTTP connection pool is shared; token and auth state is
/// not.
#[derive(Clone)]
pub struct ResolverFactory {
    client: Client,
    auth: Option<RegistryAuth>,
}

impl ResolverFactory {
    /// Creates a resolver factory.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("regfacade/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| FacadeError::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, auth: None })
    }

    /// Sets credentials used for token acquisition.
    #[must_use]
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Yields a fresh resolver with empty token state.
    #[must_use]
    pub fn resolver(&self) -> Resolver {
        Resolver {
            client: self.client.clone(),
            auth: self.auth.clone(),
        }
    }
}

/// Resolves image references against their upstream registry.
pub struct Resolver {
    client: Client,
    auth: Option<RegistryAuth>,
}

impl Resolver {
    /// Returns a fetcher for the given reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference cannot be parsed.
    pub fn resolve(&self, reference: &str) -> Result<Fetcher> {
        let image = ImageRef::parse(reference)?;
        let registry_url = registry_to_url(&image.registry);
        Ok(Fetcher {
            client: self.client.clone(),
            auth: self.auth.clone(),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            registry_url,
            image,
        })
    }
}

/// A fetched manifest together with its content digest and raw bytes.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub manifest: ImageManifest,
    pub digest: Digest,
    pub raw: Bytes,
}

/// Streaming blob fetch result.
pub struct BlobFetch {
    /// The byte stream, starting at `offset`.
    pub stream: ByteStream,
    /// Offset at which the stream begins. Zero when the upstream ignored
    /// the range request.
    pub offset: u64,
    /// Total blob size when the upstream reported it.
    pub total: Option<u64>,
}

/// Reads manifests and blobs of one image reference from its upstream.
pub struct Fetcher {
    client: Client,
    auth: Option<RegistryAuth>,
    tokens: Arc<RwLock<HashMap<String, String>>>,
    registry_url: String,
    image: ImageRef,
}

impl Fetcher {
    /// Returns the reference this fetcher reads from.
    #[must_use]
    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Fetches the manifest, resolving manifest lists to the manifest for
    /// the current platform.
    ///
    /// # Errors
    ///
    /// `UpstreamUnavailable` for transport or server errors after
    /// retries, `ManifestUnknown` when the upstream reports 404.
    #[instrument(skip(self), fields(image = %self.image))]
    pub async fn fetch_manifest(&self) -> Result<FetchedManifest> {
        let reference = self.image.reference.clone();
        let (body, content_type) = self.fetch_manifest_at(&reference).await?;

        if content_type.contains("manifest.list") || content_type.contains("image.index") {
            let list: ManifestList = serde_json::from_slice(&body)
                .map_err(|e| FacadeError::UpstreamUnavailable(format!("bad manifest list: {e}")))?;
            let entry = select_platform_manifest(&list).ok_or_else(|| {
                FacadeError::UpstreamUnavailable(format!(
                    "no manifest for current platform in {}",
                    self.image
                ))
            })?;
            let digest = entry.digest.clone();
            debug!(digest = %digest, "selected platform manifest");
            let (body, _) = self.fetch_manifest_at(digest.as_str()).await?;
            let manifest: ImageManifest = serde_json::from_slice(&body)
                .map_err(|e| FacadeError::UpstreamUnavailable(format!("bad manifest: {e}")))?;
            Ok(FetchedManifest {
                manifest,
                digest,
                raw: body,
            })
        } else {
            let manifest: ImageManifest = serde_json::from_slice(&body)
                .map_err(|e| FacadeError::UpstreamUnavailable(format!("bad manifest: {e}")))?;
            let digest = Digest::from_bytes(&body);
            Ok(FetchedManifest {
                manifest,
                digest,
                raw: body,
            })
        }
    }

    /// Fetches one manifest document by tag or digest, returning the raw
    /// bytes and the response content type.
    async fn fetch_manifest_at(&self, reference: &str) -> Result<(Bytes, String)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, self.image.repository, reference
        );

        let response = self
            .request_with_retry(reqwest::Method::GET, &url, None, Some(METADATA_TIMEOUT))
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FacadeError::ManifestUnknown(self.image.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FacadeError::UpstreamUnavailable(format!(
                "manifest fetch failed: {status} - {body}"
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| FacadeError::UpstreamUnavailable(format!("manifest body: {e}")))?;

        trace!(content_type = %content_type, body_len = body.len(), "received manifest");
        Ok((body, content_type))
    }

    /// Fetches a small blob (config) fully into memory.
    ///
    /// # Errors
    ///
    /// See [`Fetcher::fetch_blob`].
    pub async fn fetch_bytes(&self, digest: &Digest) -> Result<Bytes> {
        let url = self.blob_url(digest);
        let response = self
            .request_with_retry(reqwest::Method::GET, &url, None, Some(METADATA_TIMEOUT))
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FacadeError::BlobUnknown(digest.to_string()));
        }
        if !status.is_success() {
            return Err(FacadeError::UpstreamUnavailable(format!(
                "blob fetch failed: {status}"
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| FacadeError::UpstreamUnavailable(format!("blob body: {e}")))
    }

    /// Opens a streaming read of a blob, optionally from `offset`.
    ///
    /// The upstream may not honor range requests; callers must check the
    /// returned offset and discard a prefix themselves if it is zero.
    ///
    /// # Errors
    ///
    /// `BlobUnknown` on upstream 404, `UpstreamUnavailable` otherwise.
    #[instrument(skip(self), fields(image = %self.image, digest = %digest))]
    pub async fn fetch_blob(&self, digest: &Digest, offset: Option<u64>) -> Result<BlobFetch> {
        let url = self.blob_url(digest);
        let range = offset.filter(|o| *o > 0).map(|o| format!("bytes={o}-"));

        let response = self
            .request_with_retry(reqwest::Method::GET, &url, range.as_deref(), None)
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FacadeError::BlobUnknown(digest.to_string()));
        }
        if !status.is_success() {
            return Err(FacadeError::UpstreamUnavailable(format!(
                "blob fetch failed: {status}"
            )));
        }

        let served_offset = if status == StatusCode::PARTIAL_CONTENT {
            offset.unwrap_or(0)
        } else {
            0
        };
        let total = if status == StatusCode::PARTIAL_CONTENT {
            parse_content_range_total(&response)
        } else {
            response.content_length()
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(BlobFetch {
            stream,
            offset: served_offset,
            total,
        })
    }

    fn blob_url(&self, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.registry_url, self.image.repository, digest
        )
    }

    /// Issues a request with token auth, retrying transient failures with
    /// exponential backoff. Application-level errors are never retried.
    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        url: &str,
        range: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut backoff = Duration::from_millis(100);
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.request_with_auth(method.clone(), url, range, timeout).await {
                Ok(response) if response.status().is_server_error() => {
                    warn!(url, status = %response.status(), attempt, "upstream server error");
                    last_err = Some(FacadeError::UpstreamUnavailable(format!(
                        "{url}: {}",
                        response.status()
                    )));
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(url, attempt, error = %e, "upstream request failed");
                    last_err = Some(FacadeError::UpstreamUnavailable(format!("{url}: {e}")));
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(last_err
            .unwrap_or_else(|| FacadeError::UpstreamUnavailable(format!("{url}: no attempts"))))
    }

    /// Makes an authenticated request, handling the 401 token challenge.
    async fn request_with_auth(
        &self,
        method: reqwest::Method,
        url: &str,
        range: Option<&str>,
        timeout: Option<Duration>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let build = |token: Option<&str>| {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header(header::ACCEPT, ACCEPT_MANIFEST);
            if let Some(token) = token {
                request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            if let Some(range) = range {
                request = request.header(header::RANGE, range);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            request
        };

        let cached = {
            let tokens = self.tokens.read().await;
            tokens.get(&self.image.repository).cloned()
        };

        if let Some(token) = cached {
            let response = build(Some(&token)).send().await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            self.tokens.write().await.remove(&self.image.repository);
        }

        let response = build(None).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = parse_www_authenticate(&response) else {
            return Ok(response);
        };
        let Some(token) = self.acquire_token(&challenge).await else {
            return Ok(response);
        };

        self.tokens
            .write()
            .await
            .insert(self.image.repository.clone(), token.clone());
        build(Some(&token)).send().await
    }

    /// Gets a bearer token from the auth service named by the challenge.
    async fn acquire_token(&self, challenge: &AuthChallenge) -> Option<String> {
        let url = format!(
            "{}?service={}&scope={}",
            challenge.realm, challenge.service, challenge.scope
        );
        debug!(url = %url, "requesting registry token");

        let mut request = self.client.get(&url).timeout(METADATA_TIMEOUT);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "token request rejected");
            return None;
        }
        let token: TokenResponse = response.json().await.ok()?;
        Some(token.token)
    }
}

/// Converts a registry hostname to a base URL.
///
/// Loopback registries get plain HTTP, matching the Docker daemon's
/// insecure-registry default for localhost.
fn registry_to_url(registry: &str) -> String {
    match registry {
        "docker.io" => DOCKER_REGISTRY_URL.to_string(),
        r if r.starts_with("http://") || r.starts_with("https://") => r.to_string(),
        r if r.starts_with("localhost") || r.starts_with("127.0.0.1") => format!("http://{r}"),
        r => format!("https://{r}"),
    }
}

/// Parses `Bearer realm="...",service="...",scope="..."`.
fn parse_www_authenticate(response: &reqwest::Response) -> Option<AuthChallenge> {
    let header = response
        .headers()
        .get(header::WWW_AUTHENTICATE)?
        .to_str()
        .ok()?;

    let mut challenge = AuthChallenge::default();
    for part in header.trim_start_matches("Bearer ").split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("realm=") {
            challenge.realm = value.trim_matches('"').to_string();
        } else if let Some(value) = part.strip_prefix("service=") {
            challenge.service = value.trim_matches('"').to_string();
        } else if let Some(value) = part.strip_prefix("scope=") {
            challenge.scope = value.trim_matches('"').to_string();
        }
    }

    if challenge.realm.is_empty() {
        return None;
    }
    Some(challenge)
}

/// Extracts the total size from a `Content-Range: bytes a-b/total` header.
fn parse_content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}
