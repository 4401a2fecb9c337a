//! Blob routing.
//!
//! Given a digest, decides which owner serves it: the local store first,
//! then the first layer source claiming it. Upstream streams are tee'd
//! into the store while being served, so the next pull of the same blob
//! is local.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{FacadeError, Result};
use crate::oci::Digest;
use crate::source::{ByteStream, CompositeLayerSource, LayerSource};
use crate::spec::ImageSpec;
use crate::store::{BlobStore, BlobWriter};

/// A stalled upstream ends the transfer; there is no total streaming
/// timeout.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Requested byte range of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub offset: u64,
    /// Number of bytes, or `None` for "until the end".
    pub length: Option<u64>,
}

/// A routed blob ready for streaming to the client.
pub struct BlobServe {
    /// Total size of the whole blob.
    pub total: u64,
    /// Offset the stream starts at.
    pub offset: u64,
    /// Number of bytes the stream will yield.
    pub length: u64,
    /// The bytes themselves.
    pub stream: ByteStream,
}

/// Routes blob reads to their owner.
pub struct BlobRouter {
    store: Arc<BlobStore>,
    sources: Arc<CompositeLayerSource>,
}

impl BlobRouter {
    #[must_use]
    pub fn new(store: Arc<BlobStore>, sources: Arc<CompositeLayerSource>) -> Self {
        Self { store, sources }
    }

    /// Returns the size of a blob without opening it, for HEAD requests.
    ///
    /// # Errors
    ///
    /// `BlobUnknown` when neither the store nor any source owns the
    /// digest.
    pub async fn stat(&self, spec: &ImageSpec, digest: &Digest) -> Result<u64> {
        if let Some(size) = self.store.size(digest).await {
            return Ok(size);
        }
        let entries = self.sources.envelope(spec).await?;
        entries
            .iter()
            .find(|e| &e.descriptor.digest == digest)
            .map(|e| e.descriptor.size)
            .ok_or_else(|| FacadeError::BlobUnknown(digest.to_string()))
    }

    /// Opens a blob for the client, optionally restricted to `range`.
    ///
    /// # Errors
    ///
    /// `BlobUnknown` when nothing owns the digest, `RangeUnsatisfiable`
    /// when the range starts past the end of the blob.
    pub async fn serve(
        &self,
        spec: &ImageSpec,
        digest: &Digest,
        range: Option<ByteRange>,
    ) -> Result<BlobServe> {
        // Local store wins: cheapest, and ranges come for free.
        if self.store.has(digest).await {
            let (offset, length) = match range {
                Some(r) => (r.offset, r.length),
                None => (0, None),
            };
            let (reader, len, total) = self.store.open_range(digest, offset, length).await?;
            return Ok(BlobServe {
                total,
                offset,
                length: len,
                stream: Box::pin(ReaderStream::new(reader)),
            });
        }

        if !self.sources.has_blob(spec, digest).await {
            return Err(FacadeError::BlobUnknown(digest.to_string()));
        }

        let expected_total = self.stat(spec, digest).await?;
        let requested_offset = range.map_or(0, |r| r.offset);
        if requested_offset > expected_total {
            return Err(FacadeError::RangeUnsatisfiable(format!(
                "offset {requested_offset} beyond blob size {expected_total}"
            )));
        }

        let read = self
            .sources
            .get_blob(spec, digest, range.map(|r| r.offset))
            .await?;
        let total = read.total.unwrap_or(expected_total);

        let available = total.saturating_sub(requested_offset);
        let length = range
            .and_then(|r| r.length)
            .map_or(available, |l| l.min(available));

        // Only a full-body read can be committed to the store; a ranged
        // fetch never sees the whole blob.
        let tee = if range.is_none() {
            Some(self.store.writer(Some(digest.clone())).await?)
        } else {
            None
        };

        // The source may have ignored the range request and started at
        // zero; the gap has to be discarded before the client sees bytes.
        let discard = requested_offset.saturating_sub(read.offset);

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        tokio::spawn(pump(read.stream, discard, length, tee, tx, digest.clone()));

        Ok(BlobServe {
            total,
            offset: requested_offset,
            length,
            stream: Box::pin(ReceiverStream::new(rx)),
        })
    }
}

/// Copies the upstream stream to the client channel, optionally teeing
/// every byte into a staged store write. The stage is committed only on
/// clean completion; client disconnects and upstream errors abort it.
async fn pump(
    mut stream: ByteStream,
    mut discard: u64,
    mut remaining: u64,
    mut tee: Option<BlobWriter>,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    digest: Digest,
) {
    let mut failed = false;

    loop {
        let chunk = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                warn!(digest = %digest, error = %e, "upstream blob stream failed");
                let _ = tx.send(Err(e)).await;
                failed = true;
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(digest = %digest, "upstream blob stream idle timeout");
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "blob stream idle timeout",
                    )))
                    .await;
                failed = true;
                break;
            }
        };

        // The tee sees the raw stream; trimming applies to the client
        // side only.
        if let Some(writer) = tee.as_mut() {
            if let Err(e) = writer.write_chunk(&chunk).await {
                warn!(digest = %digest, error = %e, "blob tee write failed, disabling cache fill");
                if let Some(writer) = tee.take() {
                    writer.abort().await;
                }
            }
        }

        let mut chunk = chunk;
        if discard > 0 {
            let skip = discard.min(chunk.len() as u64);
            chunk = chunk.slice(skip as usize..);
            discard -= skip;
        }
        if remaining < chunk.len() as u64 {
            chunk = chunk.slice(..remaining as usize);
        }
        if !chunk.is_empty() {
            remaining -= chunk.len() as u64;
            if tx.send(Ok(chunk)).await.is_err() {
                // Client went away; a partial read must not be committed.
                failed = true;
                break;
            }
        }
    }

    if let Some(writer) = tee.take() {
        if failed {
            writer.abort().await;
        } else {
            match writer.commit().await {
                Ok(_) => debug!(digest = %digest, "tee-cached blob into store"),
                Err(e) => warn!(digest = %digest, error = %e, "blob tee commit failed"),
            }
        }
    }
}
