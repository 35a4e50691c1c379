//! Materialises arbitrary input streams into re-readable local files.
//!
//! Multipart uploads and retries need to re-read arbitrary byte ranges,
//! which a one-shot stream cannot offer. The engine owns every file
//! created here and deletes it once the transfer settles.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransferError;

/// Prefix of every staged file name.
const STAGED_PREFIX: &str = "stowage-upload-";

/// A stream drained to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Drains streams into uniquely named files under one directory.
#[derive(Debug, Clone)]
pub struct StagingAdapter {
    dir: PathBuf,
}

impl StagingAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Stages into the OS temp directory.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads `reader` to EOF into a new file.
    ///
    /// When `size_hint` is given, a stream that ends at a different length
    /// is treated as not fully drained. On failure no file is left behind.
    pub async fn stage<R>(
        &self,
        reader: &mut R,
        size_hint: Option<u64>,
    ) -> Result<StagedFile, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(TransferError::Staging)?;

        let path = self
            .dir
            .join(format!("{STAGED_PREFIX}{}.tmp", Uuid::new_v4()));

        match drain_into(&path, reader, size_hint).await {
            Ok(size) => {
                debug!(path = %path.display(), size, "stream staged");
                Ok(StagedFile { path, size })
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&path).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %cleanup, "failed to remove partial staged file");
                }
                Err(TransferError::Staging(e))
            }
        }
    }
}

async fn drain_into<R>(path: &Path, reader: &mut R, size_hint: Option<u64>) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let mut writer = BufWriter::new(file);
    let size = tokio::io::copy(reader, &mut writer).await?;
    writer.flush().await?;
    writer.get_ref().sync_all().await?;

    if let Some(expected) = size_hint
        && expected != size
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("stream ended after {size} of {expected} bytes"),
        ));
    }
    Ok(size)
}

/// Deletes an engine-owned staged file. Failures are logged, never returned.
pub(crate) fn delete_staged_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "staged file deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete staged file"),
    }
}
