//! Upload staging: one copy of the upload bytes, readable once per node.
//!
//! An upload must reach every node byte-for-byte, but its source may only be
//! readable once. Staging turns any [`UploadSource`] into a [`StagedUpload`]
//! before the first node is contacted:
//!
//! ```text
//! Buffered(Bytes) ───────────────────────────→ Memory (shared, no copy)
//!
//! Stream ──read──→ ≤ memory_threshold ───────→ Memory
//!                  > memory_threshold ──spill─→ File (temp, deleted on drop)
//! ```
//!
//! The checksum (SHA-256, hex) is computed while staging and travels with the
//! body so receivers can verify what they got. A staged file lives exactly as
//! long as the last clone of its `StagedUpload`; the replication context owns
//! one, so the file disappears when the operation ends however it ends.

use crate::config::UploadConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::operation::UploadSource;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

/// Upload bytes ready to be sent to any number of nodes.
///
/// Cloning is cheap and shares the same bytes or file.
#[derive(Clone)]
pub struct StagedUpload {
    inner: Arc<Staged>,
}

struct Staged {
    body: StagedBody,
    len: u64,
    sha256: String,
}

enum StagedBody {
    Memory(Bytes),
    File(TempPath),
}

impl StagedUpload {
    /// Stage an upload source within the configured limits.
    pub async fn stage(source: UploadSource, config: &UploadConfig) -> Result<Self> {
        match source {
            UploadSource::Buffered(bytes) => Self::from_bytes(bytes, config.max_upload_bytes),
            UploadSource::Stream(reader) => Self::materialize(reader, config).await,
        }
    }

    /// Stage bytes already in memory.
    pub fn from_bytes(bytes: Bytes, limit: u64) -> Result<Self> {
        let len = bytes.len() as u64;
        if len > limit {
            return Err(ReplicationError::UploadTooLarge { limit });
        }
        let sha256 = hex::encode(Sha256::digest(&bytes));
        metrics::record_upload_staged(len, false);
        Ok(Self {
            inner: Arc::new(Staged {
                body: StagedBody::Memory(bytes),
                len,
                sha256,
            }),
        })
    }

    async fn materialize(mut reader: Box<dyn AsyncRead + Send + Unpin>, config: &UploadConfig) -> Result<Self> {
        let limit = config.max_upload_bytes;
        let mut hasher = Sha256::new();
        let mut buffer = BytesMut::new();
        let mut spill: Option<(tokio::fs::File, TempPath)> = None;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;

        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| ReplicationError::staging("reading upload source", e))?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > limit {
                // Dropping `spill` removes the partial file
                return Err(ReplicationError::UploadTooLarge { limit });
            }
            let data = &chunk[..n];
            hasher.update(data);

            match spill.as_mut() {
                Some((file, _)) => file
                    .write_all(data)
                    .await
                    .map_err(|e| ReplicationError::staging("writing staged upload", e))?,
                None => {
                    buffer.extend_from_slice(data);
                    if buffer.len() as u64 > config.memory_threshold_bytes {
                        let (mut file, path) = create_spill_file(config)?;
                        file.write_all(&buffer)
                            .await
                            .map_err(|e| ReplicationError::staging("writing staged upload", e))?;
                        buffer = BytesMut::new();
                        debug!(path = %path.display(), "Upload exceeds memory threshold, spilled to disk");
                        spill = Some((file, path));
                    }
                }
            }
        }

        let sha256 = hex::encode(hasher.finalize());
        let body = match spill {
            Some((mut file, path)) => {
                file.flush()
                    .await
                    .map_err(|e| ReplicationError::staging("flushing staged upload", e))?;
                StagedBody::File(path)
            }
            None => StagedBody::Memory(buffer.freeze()),
        };

        let spilled = matches!(body, StagedBody::File(_));
        metrics::record_upload_staged(total, spilled);
        debug!(bytes = total, spilled, sha256 = %sha256, "Upload staged");

        Ok(Self {
            inner: Arc::new(Staged { body, len: total, sha256 }),
        })
    }

    /// Size in bytes.
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Hex SHA-256 of the staged bytes.
    pub fn sha256(&self) -> &str {
        &self.inner.sha256
    }

    /// Whether the bytes live in a temporary file.
    pub fn is_spilled(&self) -> bool {
        matches!(self.inner.body, StagedBody::File(_))
    }

    /// Temporary file path, when spilled.
    pub fn path(&self) -> Option<&Path> {
        match &self.inner.body {
            StagedBody::File(path) => Some(&**path),
            StagedBody::Memory(_) => None,
        }
    }

    /// The bytes, when held in memory.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.inner.body {
            StagedBody::Memory(bytes) => Some(bytes),
            StagedBody::File(_) => None,
        }
    }

    /// Open an independent reader over the staged bytes.
    ///
    /// Each node call opens its own, so a slow node never holds back another.
    pub async fn open(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.inner.body {
            StagedBody::Memory(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            StagedBody::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
        }
    }

    /// Read the whole body into memory.
    pub async fn read_all(&self) -> io::Result<Bytes> {
        if let Some(bytes) = self.as_bytes() {
            return Ok(bytes.clone());
        }
        let mut reader = self.open().await?;
        let mut out = Vec::with_capacity(self.inner.len as usize);
        reader.read_to_end(&mut out).await?;
        Ok(Bytes::from(out))
    }
}

fn create_spill_file(config: &UploadConfig) -> Result<(tokio::fs::File, TempPath)> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("replicated-upload-");
    let named = match config.staging_path() {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| ReplicationError::staging("creating staging file", e))?;

    let (file, path) = named.into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}

impl fmt::Debug for StagedUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedUpload")
            .field("len", &self.inner.len)
            .field("sha256", &self.inner.sha256)
            .field("path", &self.path())
            .finish()
    }
}
