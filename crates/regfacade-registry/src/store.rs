//! Content-addressed local blob store.
//!
//! Storage layout:
//! ```text
//! <root>/
//! ├── ingest/
//! │   └── <uuid>            # staged writes, renamed into place on commit
//! └── sha256/
//!     └── <hex>             # committed blobs
//! ```
//!
//! There is no index file; a blob exists iff its digest path exists.
//! Writers stage under `ingest/` and atomically rename on commit, so
//! readers never observe partial content.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest as _, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FacadeError, Result};
use crate::oci::Digest;

type CommitLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Content-addressed blob store rooted at a local directory.
pub struct BlobStore {
    root: PathBuf,
    commit_locks: CommitLocks,
}

impl BlobStore {
    /// Opens (creating if necessary) a blob store at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directories cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("ingest"))?;
        std::fs::create_dir_all(root.join("sha256"))?;
        Ok(Self {
            root,
            commit_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Returns the on-disk path for a digest.
    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.algorithm()).join(digest.hex())
    }

    /// Checks whether the store holds a blob.
    pub async fn has(&self, digest: &Digest) -> bool {
        fs::try_exists(self.blob_path(digest)).await.unwrap_or(false)
    }

    /// Returns the size of a stored blob, or `None` if absent.
    pub async fn size(&self, digest: &Digest) -> Option<u64> {
        fs::metadata(self.blob_path(digest)).await.ok().map(|m| m.len())
    }

    /// Opens a stored blob for reading from `offset`, limited to `length`
    /// bytes when given.
    ///
    /// Returns the reader, the number of bytes it will yield, and the
    /// blob's total size.
    ///
    /// # Errors
    ///
    /// `BlobUnknown` if absent, `RangeUnsatisfiable` if `offset` lies
    /// beyond the end of the blob.
    pub async fn open_range(
        &self,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> Result<(impl AsyncRead + Send + Unpin, u64, u64)> {
        let path = self.blob_path(digest);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|_| FacadeError::BlobUnknown(digest.to_string()))?;
        let total = file.metadata().await?.len();

        if offset > total {
            return Err(FacadeError::RangeUnsatisfiable(format!(
                "offset {offset} beyond blob size {total}"
            )));
        }
        let available = total - offset;
        let len = length.map_or(available, |l| l.min(available));

        file.seek(SeekFrom::Start(offset)).await?;
        Ok((tokio::io::AsyncReadExt::take(file, len), len, total))
    }

    /// Starts a staged write.
    ///
    /// The data is hashed incrementally; [`BlobWriter::commit`] verifies
    /// the digest (against `expected` when supplied) and renames the
    /// staged file into place.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging file cannot be created.
    pub async fn writer(&self, expected: Option<Digest>) -> Result<BlobWriter> {
        let staged = self.root.join("ingest").join(uuid::Uuid::new_v4().to_string());
        let file = fs::File::create(&staged).await?;
        Ok(BlobWriter {
            file: Some(file),
            hasher: Sha256::new(),
            staged,
            root: self.root.clone(),
            expected,
            commit_locks: Arc::clone(&self.commit_locks),
            written: 0,
        })
    }

    /// Writes a complete blob from memory.
    ///
    /// # Errors
    ///
    /// `DigestMismatch` when `expected` does not match the data.
    pub async fn put_bytes(&self, data: &[u8], expected: Option<&Digest>) -> Result<Digest> {
        let mut writer = self.writer(expected.cloned()).await?;
        writer.write_chunk(data).await?;
        writer.commit().await
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").field("root", &self.root).finish()
    }
}

/// In-progress staged blob write.
pub struct BlobWriter {
    file: Option<fs::File>,
    hasher: Sha256,
    staged: PathBuf,
    root: PathBuf,
    expected: Option<Digest>,
    commit_locks: CommitLocks,
    written: u64,
}

impl BlobWriter {
    /// Appends a chunk to the staged blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged file cannot be written.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| FacadeError::Internal("write after commit".to_string()))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Returns the number of bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verifies the digest and atomically publishes the blob.
    ///
    /// Commits for the same digest are serialized; if another writer won
    /// the race the staged copy is discarded and the commit still
    /// succeeds, because the store holds the content either way.
    ///
    /// # Errors
    ///
    /// `DigestMismatch` when the computed digest differs from the
    /// expected one; the staged file is discarded.
    pub async fn commit(mut self) -> Result<Digest> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| FacadeError::Internal("double commit".to_string()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = Digest::from_sha256_hex(&hex::encode(self.hasher.clone().finalize()));
        if let Some(expected) = &self.expected {
            if expected != &actual {
                let _ = fs::remove_file(&self.staged).await;
                return Err(FacadeError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let lock = {
            let mut locks = self.commit_locks.lock().await;
            Arc::clone(
                locks
                    .entry(actual.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        let target = self.root.join(actual.algorithm()).join(actual.hex());
        if fs::try_exists(&target).await.unwrap_or(false) {
            let _ = fs::remove_file(&self.staged).await;
            debug!(digest = %actual, "blob already committed by concurrent writer");
            return Ok(actual);
        }

        fs::rename(&self.staged, &target).await?;
        debug!(digest = %actual, size = self.written, "committed blob");
        Ok(actual)
    }

    /// Discards the staged data.
    pub async fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.staged).await;
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        // Uncommitted stage files are garbage; clean up best-effort.
        if self.file.is_some() {
            let _ = std::fs::remove_file(&self.staged);
        }
    }
}

/// Prepends the debug root override to a path when the environment
/// variable is set.
#[must_use]
pub fn apply_root_prefix(path: &Path) -> PathBuf {
    match std::env::var("REGFACADE_ROOT") {
        Ok(root) if !root.is_empty() => {
            let rel = path.strip_prefix("/").unwrap_or(path);
            Path::new(&root).join(rel)
        }
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_put_and_open() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        let digest = store.put_bytes(b"hello world", None).await.unwrap();
        assert!(store.has(&digest).await);
        assert_eq!(store.size(&digest).await, Some(11));

        let (mut reader, len, total) = store.open_range(&digest, 0, None).await.unwrap();
        assert_eq!((len, total), (11, 11));
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn test_range_read() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let digest = store.put_bytes(b"0123456789", None).await.unwrap();

        let (mut reader, len, total) = store.open_range(&digest, 3, Some(4)).await.unwrap();
        assert_eq!((len, total), (4, 10));
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"3456");

        // Length clamps to the end of the blob.
        let (_, len, _) = store.open_range(&digest, 8, Some(100)).await.unwrap();
        assert_eq!(len, 2);

        // Offset past the end is unsatisfiable.
        assert!(matches!(
            store.open_range(&digest, 11, None).await,
            Err(FacadeError::RangeUnsatisfiable(_))
        ));
    }

    #[tokio::test]
    async fn test_digest_mismatch_discards_stage() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        let wrong = Digest::from_bytes(b"something else");
        let err = store.put_bytes(b"data", Some(&wrong)).await.unwrap_err();
        assert!(matches!(err, FacadeError::DigestMismatch { .. }));

        // Nothing staged or committed.
        let ingest: Vec<_> = std::fs::read_dir(dir.path().join("ingest"))
            .unwrap()
            .collect();
        assert!(ingest.is_empty());
        assert!(!store.has(&wrong).await);
    }

    #[tokio::test]
    async fn test_concurrent_writers_single_commit() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()).unwrap());
        let expected = Digest::from_bytes(b"contended");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let expected = expected.clone();
            handles.push(tokio::spawn(async move {
                store.put_bytes(b"contended", Some(&expected)).await
            }));
        }
        for handle in handles {
            // Losers observe success once the winner commits.
            assert_eq!(handle.await.unwrap().unwrap(), expected);
        }
        assert!(store.has(&expected).await);
    }

    #[tokio::test]
    async fn test_abort_removes_stage() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        let mut writer = store.writer(None).await.unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        writer.abort().await;

        let ingest: Vec<_> = std::fs::read_dir(dir.path().join("ingest"))
            .unwrap()
            .collect();
        assert!(ingest.is_empty());
    }
}
