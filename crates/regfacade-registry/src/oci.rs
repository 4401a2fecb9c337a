//! OCI image types and content addressing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{FacadeError, Result};

// Well-known media types.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Content digest in canonical `"sha256:<64hex>"` form.
///
/// Equality and hashing are by exact string, which is what manifests and
/// blob URLs use as identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Parses a digest string, validating algorithm and hex payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDigest` for anything that is not
    /// `sha256:` followed by 64 lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        let Some(hex_part) = s.strip_prefix("sha256:") else {
            return Err(FacadeError::InvalidDigest(s.to_string()));
        };
        if hex_part.len() != 64
            || !hex_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(FacadeError::InvalidDigest(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Computes the sha256 digest of a byte slice.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Wraps an already-finalized sha256 hex string.
    #[must_use]
    pub fn from_sha256_hex(hex: &str) -> Self {
        Self(format!("sha256:{hex}"))
    }

    /// Returns the full canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the algorithm part ("sha256").
    #[must_use]
    pub fn algorithm(&self) -> &str {
        self.0.split(':').next().unwrap_or("sha256")
    }

    /// Returns the hex part.
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or("")
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content descriptor: the (mediaType, digest, size) triple that
/// identifies a blob within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type.
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Content size in bytes.
    pub size: u64,
    /// Alternative fetch URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// Arbitrary annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Descriptor {
    /// Creates a descriptor without urls or annotations.
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
        }
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (always 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, base first.
    pub layers: Vec<Descriptor>,
}

/// Multi-architecture manifest list (fat manifest / OCI index).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    /// Schema version (always 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Platform-specific manifests.
    pub manifests: Vec<PlatformManifest>,
}

/// Platform-specific manifest entry in a manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    /// Media type of the referenced manifest.
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Content size.
    pub size: u64,
    /// Platform specification.
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Platform specification for multi-arch images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Selects the manifest for the current platform from a manifest list.
///
/// Container images are always for Linux, so the OS is fixed regardless
/// of the host.
#[must_use]
pub fn select_platform_manifest(list: &ManifestList) -> Option<&PlatformManifest> {
    let arch = current_arch();
    list.manifests.iter().find(|m| {
        m.platform
            .as_ref()
            .is_some_and(|p| p.os == "linux" && p.architecture == arch)
    })
}

/// Returns the current architecture in OCI format.
fn current_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        a => a,
    }
}

/// Serializes a value as canonical JSON: UTF-8, lexicographically sorted
/// keys, no insignificant whitespace.
///
/// Synthesized manifests and configs are addressed by the digest of these
/// bytes, so two runs over the same inputs must serialize identically.
/// Sorting comes from routing through `serde_json::Value`, whose object
/// representation is a `BTreeMap`.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let normalized = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&normalized)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_parse() {
        let hex = "a".repeat(64);
        let d = Digest::parse(&format!("sha256:{hex}")).unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.hex(), hex);

        assert!(Digest::parse("sha256:zz").is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse(&format!("sha256:{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn test_digest_from_bytes() {
        let d = Digest::from_bytes(b"hello world");
        assert_eq!(
            d.as_str(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unordered {
            zeta: u32,
            alpha: u32,
        }

        let bytes = canonical_json(&Unordered { zeta: 1, alpha: 2 }).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, Digest::from_bytes(b"cfg"), 3),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_OCI_LAYER_GZIP,
                Digest::from_bytes(b"layer"),
                5,
            )],
        };

        let a = canonical_json(&manifest).unwrap();
        let b = canonical_json(&manifest).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_select_platform_manifest_prefers_linux() {
        let list = ManifestList {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST_LIST.to_string(),
            manifests: vec![PlatformManifest {
                media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
                digest: Digest::from_bytes(b"m"),
                size: 1,
                platform: Some(Platform {
                    architecture: current_arch().to_string(),
                    os: "linux".to_string(),
                    variant: None,
                }),
            }],
        };
        assert!(select_platform_manifest(&list).is_some());
    }
}
