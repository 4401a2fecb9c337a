//! Registry v2 HTTP front-end.
//!
//! Implements the read subset of the OCI Distribution Spec:
//!
//! - `GET  /v2/` - API version check
//! - `GET/HEAD /v2/<name>/manifests/<reference>` - synthesized manifests
//! - `GET/HEAD /v2/<name>/blobs/<digest>` - blob router
//!
//! `<name>` is split on its first `/` into a provider name and the
//! remainder handed to that provider. Everything else answers with a
//! registry v2 error envelope.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::{ErrorEnvelope, FacadeError};
use crate::oci::{Digest, MEDIA_TYPE_MANIFEST_V2, MEDIA_TYPE_OCI_MANIFEST};
use crate::registry::Registry;
use crate::router::ByteRange;

/// Creates the registry router, nested under the configured prefix.
#[must_use]
pub fn create_router(registry: Arc<Registry>) -> Router {
    let v2 = Router::new()
        .route("/v2/", get(api_base))
        .route("/v2", get(api_base))
        .route("/v2/{*rest}", any(dispatch))
        .fallback(unsupported)
        .with_state(Arc::clone(&registry));

    let app = match registry.config().prefix.as_str() {
        "" | "/" => v2,
        prefix => {
            let prefix = if prefix.starts_with('/') {
                prefix.to_string()
            } else {
                format!("/{prefix}")
            };
            Router::new().nest(&prefix, v2).fallback(unsupported)
        }
    };

    app.layer(middleware::from_fn_with_state(registry, require_auth))
        .layer(TraceLayer::new_for_http())
}

/// Rejects unauthenticated requests when `requireAuth` is set.
///
/// Verifying the credential is a stub: any `Authorization` header passes.
async fn require_auth(
    State(registry): State<Arc<Registry>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if registry.config().require_auth && !request.headers().contains_key(header::AUTHORIZATION) {
        return FacadeError::Unauthorized.into_response();
    }
    next.run(request).await
}

/// `GET /v2/` - a simple yes-man so clients can probe API support and
/// run auth roundtrips.
async fn api_base() -> Response {
    let mut response = (StatusCode::OK, "{}").into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "Docker-Distribution-API-Version",
        HeaderValue::from_static("registry/2.0"),
    );
    response
}

/// Any route outside the supported read subset.
async fn unsupported() -> Response {
    let envelope = ErrorEnvelope::single("UNSUPPORTED", "operation not supported".to_string());
    (StatusCode::METHOD_NOT_ALLOWED, axum::Json(envelope)).into_response()
}

/// Splits the wildcard remainder into name and route kind, then
/// dispatches.
async fn dispatch(
    State(registry): State<Arc<Registry>>,
    Path(rest): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let head = if method == Method::GET {
        false
    } else if method == Method::HEAD {
        true
    } else {
        return unsupported().await;
    };

    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() < 3 {
        return unsupported().await;
    }
    let kind = segments[segments.len() - 2];
    let reference = segments[segments.len() - 1];
    let name = segments[..segments.len() - 2].join("/");

    let result = match kind {
        "manifests" => handle_manifest(&registry, &name, reference, &headers, head).await,
        "blobs" => handle_blob(&registry, &name, reference, &headers, head).await,
        _ => return unsupported().await,
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

/// Resolves `<name>` to an image spec via the provider map.
async fn resolve_spec(
    registry: &Registry,
    name: &str,
) -> Result<crate::spec::ImageSpec, FacadeError> {
    let Some((provider_name, remainder)) = name.split_once('/') else {
        return Err(FacadeError::NameUnknown(name.to_string()));
    };
    let provider = registry
        .provider(provider_name)
        .ok_or_else(|| FacadeError::NameUnknown(name.to_string()))?;
    provider.get_spec(remainder).await
}

/// `GET/HEAD /v2/<name>/manifests/<reference>`.
///
/// Tags are ignored - synthesis is per spec, not per tag. A digest
/// reference must match the synthesized manifest digest.
async fn handle_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, FacadeError> {
    let spec = resolve_spec(registry, name).await?;
    let synthesis = registry.synthesizer().synthesize(&spec).await?;

    if reference.contains(':') {
        let requested = Digest::parse(reference)?;
        if requested != synthesis.manifest_digest {
            return Err(FacadeError::ManifestUnknown(reference.to_string()));
        }
    }

    // The bytes are OCI either way; clients that only speak the Docker
    // schema 2 type get it as the content type.
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let content_type = if accept.contains(MEDIA_TYPE_MANIFEST_V2) && !accept.contains("oci") {
        MEDIA_TYPE_MANIFEST_V2
    } else {
        MEDIA_TYPE_OCI_MANIFEST
    };

    debug!(name, reference, digest = %synthesis.manifest_digest, "serving manifest");

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, synthesis.manifest_bytes.len())
        .header("Docker-Content-Digest", synthesis.manifest_digest.as_str());
    let body = if head {
        Body::empty()
    } else {
        Body::from(synthesis.manifest_bytes.clone())
    };
    response
        .body(body)
        .map_err(|e| FacadeError::Internal(format!("response build: {e}")))
}

/// `GET/HEAD /v2/<name>/blobs/<digest>`.
async fn handle_blob(
    registry: &Registry,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, FacadeError> {
    let digest = Digest::parse(reference)?;
    let spec = resolve_spec(registry, name).await?;

    if head {
        let size = registry.blob_router().stat(&spec, &digest).await?;
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .header(header::ACCEPT_RANGES, "bytes")
            .header("Docker-Content-Digest", digest.as_str())
            .body(Body::empty())
            .map_err(|e| FacadeError::Internal(format!("response build: {e}")));
    }

    let range = parse_range(headers);
    let serve = registry
        .blob_router()
        .serve(&spec, &digest, range)
        .await?;

    let mut response = Response::builder()
        .header(header::CONTENT_LENGTH, serve.length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header("Docker-Content-Digest", digest.as_str());

    response = if range.is_some() {
        response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!(
                    "bytes {}-{}/{}",
                    serve.offset,
                    serve.offset + serve.length.saturating_sub(1),
                    serve.total
                ),
            )
    } else {
        response.status(StatusCode::OK)
    };

    response
        .body(Body::from_stream(serve.stream))
        .map_err(|e| FacadeError::Internal(format!("response build: {e}")))
}

/// Parses a single-range `Range: bytes=a-b` header. Unparseable or
/// multi-range headers fall back to serving the whole blob.
fn parse_range(headers: &HeaderMap) -> Option<ByteRange> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let offset: u64 = start.parse().ok()?;
    let length = if end.is_empty() {
        None
    } else {
        let end: u64 = end.parse().ok()?;
        Some(end.checked_sub(offset)? + 1)
    };
    Some(ByteRange { offset, length })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(
            parse_range(&range_headers("bytes=0-99")),
            Some(ByteRange {
                offset: 0,
                length: Some(100)
            })
        );
        assert_eq!(
            parse_range(&range_headers("bytes=50-")),
            Some(ByteRange {
                offset: 50,
                length: None
            })
        );
        // Multi-range and garbage degrade to a full response.
        assert_eq!(parse_range(&range_headers("bytes=0-1,5-9")), None);
        assert_eq!(parse_range(&range_headers("chunks=1-2")), None);
        assert_eq!(parse_range(&range_headers("bytes=9-2")), None);
        assert_eq!(parse_range(&HeaderMap::new()), None);
    }
}
