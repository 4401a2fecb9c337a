//! Layer source wrapping a local gzip'd tar file.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha2::{Digest as _, Sha256};
use tokio_util::io::ReaderStream;

use crate::error::{FacadeError, Result};
use crate::oci::{Descriptor, Digest, MEDIA_TYPE_OCI_LAYER_GZIP};
use crate::spec::ImageSpec;

use super::{BlobRead, LayerEntry, LayerSource};

/// Serves one local file as a single layer.
///
/// Media type, digest, size, and diff-id are computed at construction and
/// cached. The file is treated as immutable from then on; changing it on
/// disk leaves the source serving stale metadata.
pub struct FileLayerSource {
    path: PathBuf,
    entry: LayerEntry,
}

impl FileLayerSource {
    /// Hashes the file (compressed and uncompressed) and captures its
    /// descriptor. The file must be a gzip'd tar.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid gzip.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let hash_path = path.clone();

        let (digest, diff_id, size) = tokio::task::spawn_blocking(move || {
            hash_layer_file(&hash_path)
        })
        .await
        .map_err(|e| FacadeError::Internal(format!("hash task panicked: {e}")))??;

        tracing::info!(
            path = %path.display(),
            digest = %digest,
            size,
            "prepared file layer"
        );

        Ok(Self {
            path,
            entry: LayerEntry {
                descriptor: Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, digest, size),
                diff_id: Some(diff_id),
            },
        })
    }

    /// The descriptor of this layer.
    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.entry.descriptor
    }
}

/// Computes (compressed digest, diff-id, size) for a gzip'd tar file.
fn hash_layer_file(path: &Path) -> Result<(Digest, Digest, u64)> {
    let file = std::fs::File::open(path)
        .map_err(|e| FacadeError::Internal(format!("cannot open layer {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);

    let mut compressed = Sha256::new();
    let mut decompressed = Sha256::new();
    let mut size: u64 = 0;

    // Single pass: hash the raw bytes while feeding them through the gzip
    // decoder for the diff-id.
    struct TeeReader<'a, R> {
        inner: R,
        hasher: &'a mut Sha256,
        count: &'a mut u64,
    }
    impl<R: Read> Read for TeeReader<'_, R> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.hasher.update(&buf[..n]);
            *self.count += n as u64;
            Ok(n)
        }
    }

    let tee = TeeReader {
        inner: &mut reader,
        hasher: &mut compressed,
        count: &mut size,
    };
    let mut decoder = GzDecoder::new(tee);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf).map_err(|e| {
            FacadeError::Internal(format!("layer {} is not valid gzip: {e}", path.display()))
        })?;
        if n == 0 {
            break;
        }
        decompressed.update(&buf[..n]);
    }
    drop(decoder);

    Ok((
        Digest::from_sha256_hex(&hex::encode(compressed.finalize())),
        Digest::from_sha256_hex(&hex::encode(decompressed.finalize())),
        size,
    ))
}

#[async_trait]
impl LayerSource for FileLayerSource {
    async fn envelope(&self, _spec: &ImageSpec) -> Result<Vec<LayerEntry>> {
        Ok(vec![self.entry.clone()])
    }

    async fn has_blob(&self, _spec: &ImageSpec, digest: &Digest) -> bool {
        &self.entry.descriptor.digest == digest
    }

    async fn get_blob(
        &self,
        _spec: &ImageSpec,
        digest: &Digest,
        offset: Option<u64>,
    ) -> Result<BlobRead> {
        if &self.entry.descriptor.digest != digest {
            return Err(FacadeError::BlobUnknown(digest.to_string()));
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        let offset = offset.unwrap_or(0);
        if offset > self.entry.descriptor.size {
            return Err(FacadeError::RangeUnsatisfiable(format!(
                "offset {offset} beyond layer size {}",
                self.entry.descriptor.size
            )));
        }
        if offset > 0 {
            use tokio::io::AsyncSeekExt;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }

        Ok(BlobRead {
            stream: Box::pin(ReaderStream::new(file)),
            offset,
            total: Some(self.entry.descriptor.size),
        })
    }
}
