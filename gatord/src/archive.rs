use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use md5::Context;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("archive integrity check failed: expected {expected_md5}, got {actual_md5}")]
    HashMismatch {
        expected_md5: String,
        actual_md5: String,
    },
    #[error("object of {size} bytes exceeds the {limit} byte archive limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("invalid archive key: {0}")]
    InvalidKey(String),
}

impl ArchiveError {
    /// Hash mismatches and oversize objects cannot be fixed by retrying
    /// the same transfer.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ArchiveError::HashMismatch { .. }
                | ArchiveError::TooLarge { .. }
                | ArchiveError::InvalidKey(_)
        )
    }
}

/// Local archival blob store. Objects are addressed by a relative key and
/// verified against their md5 digest on both read and write.
pub struct ArchiveStore {
    root: PathBuf,
    max_object_bytes: Option<u64>,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>, max_object_bytes: Option<u64>) -> Self {
        Self {
            root: root.into(),
            max_object_bytes,
        }
    }

    /// True when the object is already stored with the expected digest.
    /// A missing object, or one whose content drifted, reports false so
    /// the caller re-transfers it.
    pub async fn exists(&self, key: &str, expected_md5: Option<&str>) -> Result<bool, ArchiveError> {
        let target = self.object_path(key)?;
        let mut file = match tokio::fs::File::open(&target).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let Some(expected_md5) = expected_md5 else {
            return Ok(true);
        };

        let mut md5 = Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            md5.consume(&buf[..read]);
        }
        let actual = format!("{:x}", md5.compute());
        Ok(actual == expected_md5.to_ascii_lowercase())
    }

    /// Streams an object into the archive, asserting the expected digest
    /// during the write. The object lands under its final key only after
    /// the digest and size checks pass.
    pub async fn put<S>(
        &self,
        key: &str,
        mut stream: S,
        expected_md5: Option<&str>,
    ) -> Result<u64, ArchiveError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut md5 = expected_md5.map(|_| Context::new());
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err.into());
                }
            };
            written = written.saturating_add(chunk.len() as u64);
            if let Some(limit) = self.max_object_bytes
                && written > limit
            {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(ArchiveError::TooLarge {
                    size: written,
                    limit,
                });
            }
            if let Err(err) = file.write_all(&chunk).await {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err.into());
            }
            if let Some(ctx) = md5.as_mut() {
                ctx.consume(&chunk);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let (Some(expected_md5), Some(ctx)) = (expected_md5, md5) {
            let actual_md5 = format!("{:x}", ctx.compute());
            if actual_md5 != expected_md5.to_ascii_lowercase() {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(ArchiveError::HashMismatch {
                    expected_md5: expected_md5.to_ascii_lowercase(),
                    actual_md5,
                });
            }
        }

        tokio::fs::rename(partial, target).await?;
        Ok(written)
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(ArchiveError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
