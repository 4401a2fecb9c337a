//! Image composition specs.
//!
//! An [`ImageSpec`] is the input to manifest synthesis: which base image
//! to start from, which IDE image to stack on top, which dynamic content
//! layers to append, and how to adjust the resulting config.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{FacadeError, Result};
use crate::oci::{Descriptor, Digest};

/// Input to manifest synthesis. Immutable once constructed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSpec {
    /// Reference of the workspace base image.
    pub base_ref: String,
    /// Reference of the image whose layers provide the IDE. Empty means
    /// no IDE layers.
    pub ide_ref: String,
    /// Ordered dynamic content layers.
    pub content_layer: Vec<ContentLayer>,
    /// Environment variables in `KEY=value` form, appended after the base
    /// image's environment (last writer wins per key).
    pub env_vars: Vec<String>,
    /// Entrypoint override; empty keeps the base image's entrypoint.
    pub entrypoint: Vec<String>,
    /// User override; empty keeps the base image's user.
    pub user: String,
}

/// One dynamic content layer: a descriptor plus where its bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentLayer {
    /// Descriptor for the compressed layer blob.
    pub descriptor: Descriptor,
    /// Digest of the uncompressed tar, when the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<Digest>,
    /// Where the layer bytes come from.
    #[serde(skip)]
    pub content: LayerContent,
}

/// Delivery mechanism for a content layer's bytes.
#[derive(Debug, Clone, Default)]
pub enum LayerContent {
    /// Bytes delivered inline with the spec.
    Inline(Bytes),
    /// Bytes fetched from an upstream URL on demand.
    Url(String),
    /// No payload; the blob must already exist elsewhere.
    #[default]
    None,
}

impl TryFrom<regfacade_protocol::ImageSpec> for ImageSpec {
    type Error = FacadeError;

    fn try_from(proto: regfacade_protocol::ImageSpec) -> Result<Self> {
        if proto.base_ref.is_empty() {
            return Err(FacadeError::SpecMalformed("empty baseRef".to_string()));
        }

        let content_layer = proto
            .content_layer
            .into_iter()
            .map(ContentLayer::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            base_ref: proto.base_ref,
            ide_ref: proto.ide_ref,
            content_layer,
            env_vars: proto.env_vars,
            entrypoint: proto.entrypoint,
            user: proto.user,
        })
    }
}

impl TryFrom<regfacade_protocol::ContentLayer> for ContentLayer {
    type Error = FacadeError;

    fn try_from(proto: regfacade_protocol::ContentLayer) -> Result<Self> {
        use regfacade_protocol::content_layer::Content;

        let digest = Digest::parse(&proto.digest)
            .map_err(|_| FacadeError::SpecMalformed(format!("bad layer digest: {}", proto.digest)))?;
        let size = u64::try_from(proto.size)
            .map_err(|_| FacadeError::SpecMalformed(format!("negative layer size: {}", proto.size)))?;
        let media_type = if proto.media_type.is_empty() {
            crate::oci::MEDIA_TYPE_OCI_LAYER_GZIP.to_string()
        } else {
            proto.media_type
        };

        let diff_id = if proto.diff_id.is_empty() {
            None
        } else {
            Some(Digest::parse(&proto.diff_id).map_err(|_| {
                FacadeError::SpecMalformed(format!("bad layer diffId: {}", proto.diff_id))
            })?)
        };

        let content = match proto.content {
            Some(Content::Inline(bytes)) => LayerContent::Inline(Bytes::from(bytes)),
            Some(Content::Url(url)) => LayerContent::Url(url),
            None => LayerContent::None,
        };

        Ok(Self {
            descriptor: Descriptor::new(media_type, digest, size),
            diff_id,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex64(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    #[test]
    fn test_spec_from_proto() {
        let proto = regfacade_protocol::ImageSpec {
            base_ref: "registry.example.com/base:1.0".to_string(),
            ide_ref: "registry.example.com/ide:latest".to_string(),
            content_layer: vec![regfacade_protocol::ContentLayer {
                media_type: String::new(),
                digest: format!("sha256:{}", hex64('a')),
                size: 42,
                diff_id: String::new(),
                content: Some(regfacade_protocol::content_layer::Content::Inline(
                    b"data".to_vec(),
                )),
            }],
            env_vars: vec!["FOO=bar".to_string()],
            entrypoint: vec![],
            user: String::new(),
        };

        let spec = ImageSpec::try_from(proto).unwrap();
        assert_eq!(spec.base_ref, "registry.example.com/base:1.0");
        assert_eq!(spec.content_layer.len(), 1);
        assert_eq!(spec.content_layer[0].descriptor.size, 42);
        assert!(matches!(
            spec.content_layer[0].content,
            LayerContent::Inline(_)
        ));
    }

    #[test]
    fn test_spec_rejects_empty_base_ref() {
        let proto = regfacade_protocol::ImageSpec::default();
        assert!(matches!(
            ImageSpec::try_from(proto),
            Err(FacadeError::SpecMalformed(_))
        ));
    }

    #[test]
    fn test_content_layer_rejects_bad_digest() {
        let proto = regfacade_protocol::ContentLayer {
            media_type: String::new(),
            digest: "not-a-digest".to_string(),
            size: 1,
            diff_id: String::new(),
            content: None,
        };
        assert!(ContentLayer::try_from(proto).is_err());
    }
}
