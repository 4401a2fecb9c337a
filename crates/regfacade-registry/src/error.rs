//! Error types for the registry facade.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for facade operations.
pub type Result<T> = std::result::Result<T, FacadeError>;

/// Errors that can occur while serving the registry facade.
///
/// Every variant maps to a registry v2 error code and an HTTP status so
/// that handlers can surface failures as standard error envelopes. All
/// payloads are plain strings which keeps the type `Clone` - singleflight
/// waiters receive the winner's error verbatim.
#[derive(Debug, Clone, Error)]
pub enum FacadeError {
    /// The repository name does not resolve to a spec provider or spec.
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// The requested manifest is not known to the facade.
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// No layer source or store owns the requested blob.
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    /// Request lacked acceptable authorization.
    #[error("authentication required")]
    Unauthorized,

    /// Content digest did not match the expected value.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A digest or reference failed to parse.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Requested byte range cannot be satisfied.
    #[error("range not satisfiable: {0}")]
    RangeUnsatisfiable(String),

    /// The spec provider RPC endpoint cannot be reached.
    #[error("spec provider unavailable: {0}")]
    SpecUnavailable(String),

    /// The spec provider returned a response the facade cannot use.
    #[error("malformed image spec: {0}")]
    SpecMalformed(String),

    /// An upstream registry could not be reached or replied with an error.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FacadeError {
    /// Returns the registry v2 error code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NameUnknown(_) => "NAME_UNKNOWN",
            Self::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            Self::BlobUnknown(_) => "BLOB_UNKNOWN",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::DigestMismatch { .. } | Self::InvalidDigest(_) => "DIGEST_INVALID",
            Self::RangeUnsatisfiable(_) => "RANGE_INVALID",
            Self::SpecUnavailable(_) => "DENIED",
            Self::SpecMalformed(_) => "MANIFEST_INVALID",
            Self::UpstreamUnavailable(_) => "UNKNOWN",
            Self::Internal(_) => "UNKNOWN",
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NameUnknown(_) | Self::ManifestUnknown(_) | Self::BlobUnknown(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::DigestMismatch { .. } | Self::InvalidDigest(_) => StatusCode::BAD_REQUEST,
            Self::RangeUnsatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::SpecUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SpecMalformed(_) | Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for FacadeError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for FacadeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

/// Single entry in a registry v2 error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorEntry {
    /// Stable registry error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional detail payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Registry v2 error envelope, `{"errors": [...]}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub errors: Vec<ErrorEntry>,
}

impl ErrorEnvelope {
    /// Builds an envelope with a single entry.
    #[must_use]
    pub fn single(code: &str, message: String) -> Self {
        Self {
            errors: vec![ErrorEntry {
                code: code.to_string(),
                message,
                detail: None,
            }],
        }
    }
}

impl IntoResponse for FacadeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let envelope = ErrorEnvelope::single(self.code(), self.to_string());

        let mut response = (status, axum::Json(envelope)).into_response();
        if matches!(self, Self::Unauthorized) {
            response
                .headers_mut()
                .insert("WWW-Authenticate", "Basic".parse().expect("static header"));
        }
        response
    }
}
