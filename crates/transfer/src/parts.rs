//! Part planning, ranged file I/O and integrity tokens.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::types::{PartDescriptor, PartState};

/// Splits `total` bytes into parts.
///
/// Payloads at or below `threshold` are transferred in a single shot and
/// get no parts. Larger payloads are cut into `part_size` pieces; the
/// last one may be smaller.
pub fn plan_parts(total: u64, threshold: u64, part_size: u64) -> Vec<PartDescriptor> {
    if total <= threshold || part_size == 0 {
        return Vec::new();
    }
    let mut parts = Vec::with_capacity(total.div_ceil(part_size) as usize);
    let mut start = 0;
    let mut part_number = 1;
    while start < total {
        let end = (start + part_size).min(total);
        parts.push(PartDescriptor {
            part_number,
            range_start: start,
            range_end: end,
            state: PartState::Pending,
            etag: None,
        });
        start = end;
        part_number += 1;
    }
    parts
}

/// Computes the MD5 of `data` as lowercase hex, the form S3-compatible
/// services use for single-part ETags.
pub fn content_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Strips the quotes services wrap around ETags.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Reads exactly `range` from the file at `path`.
pub(crate) async fn read_range(path: &Path, range: Range<u64>) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Creates (or keeps) the download target and sizes it to `size` bytes,
/// leaving bytes already written in place.
pub(crate) async fn prepare_target(path: &Path, size: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(size).await?;
    Ok(())
}

/// Writes `data` at byte `offset` of an existing file.
pub(crate) async fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Flushes the finished download to disk.
pub(crate) async fn sync_file(path: &Path) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.sync_all().await
}
