//! Object store backed by a local directory.
//!
//! Buckets are sub-directories of the root and keys are relative paths
//! inside them. ETags are the MD5 hex digest of the object contents.
//! Object attributes (metadata and canned ACL) are kept as JSON sidecars
//! under [`METADATA_DIR`]; open multipart uploads live under
//! [`MULTIPART_DIR`] until they are completed or aborted.

mod multipart;

use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use stowage_transfer::{
    CannedAcl, CompletedPart, ObjectBody, ObjectInfo, ObjectLocation, ObjectMetadata,
    StorageClient, StorageError, StorageFuture, UploadTarget, content_md5, validate_relative_path,
};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Directory under the root holding open multipart uploads.
pub const MULTIPART_DIR: &str = ".multipart";

/// Directory under the root holding object attribute sidecars.
pub const METADATA_DIR: &str = ".metadata";

/// Buffer used when streaming files through a hasher.
const COPY_BUFFER: usize = 64 * 1024;

/// Attributes recorded next to an object when it is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttributes {
    #[serde(default)]
    pub metadata: ObjectMetadata,
    #[serde(default)]
    pub acl: Option<CannedAcl>,
    /// ETag of the contents written with these attributes.
    #[serde(default)]
    pub etag: Option<String>,
}

/// [`StorageClient`] over a directory tree.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file holding the object at `location`.
    ///
    /// Keys that would escape the bucket directory are rejected.
    pub fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        validate_relative_path(location.key()).map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(self.root.join(location.bucket()).join(location.key()))
    }

    fn attributes_path(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        validate_relative_path(location.key()).map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(self
            .root
            .join(METADATA_DIR)
            .join(location.bucket())
            .join(format!("{}.json", location.key())))
    }

    /// Reads the attributes stored with an object.
    pub async fn attributes(
        &self,
        location: &ObjectLocation,
    ) -> Result<StoredAttributes, StorageError> {
        let path = self.attributes_path(location)?;
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(e, location.key()))?;
        serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Other(format!("corrupt attributes for {}: {e}", location.key())))
    }

    /// Writes an object with its attributes and returns its ETag.
    async fn write_object(&self, target: &UploadTarget, data: &[u8]) -> Result<String, StorageError> {
        let path = self.object_path(&target.location)?;
        write_atomic(&path, data).await?;

        let etag = content_md5(data);
        self.write_attributes(target, &etag).await?;
        debug!(
            bucket = target.location.bucket(),
            key = target.location.key(),
            size = data.len(),
            %etag,
            "object written"
        );
        Ok(etag)
    }

    /// Records the attributes and ETag of an object that was just written.
    pub(crate) async fn write_attributes(
        &self,
        target: &UploadTarget,
        etag: &str,
    ) -> Result<(), StorageError> {
        let attributes = StoredAttributes {
            metadata: target.metadata.clone(),
            acl: target.acl,
            etag: Some(etag.to_string()),
        };
        let json = serde_json::to_vec_pretty(&attributes)
            .map_err(|e| StorageError::Other(format!("cannot encode attributes: {e}")))?;
        write_atomic(&self.attributes_path(&target.location)?, &json).await
    }

    /// Returns the ETag recorded for an object, hashing the file when
    /// the sidecar is missing or predates recorded ETags.
    async fn object_etag(
        &self,
        location: &ObjectLocation,
        path: &Path,
    ) -> Result<String, StorageError> {
        match self.attributes(location).await {
            Ok(StoredAttributes {
                etag: Some(etag), ..
            }) => Ok(etag),
            Ok(_) | Err(StorageError::NotFound(_)) => {
                let mut file = File::open(path)
                    .await
                    .map_err(|e| io_error(e, location.key()))?;
                hash_reader(&mut file, location.key()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn read_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(e, location.key()))
    }
}

impl StorageClient for FsObjectStore {
    fn put_object<'a>(
        &'a self,
        target: &'a UploadTarget,
        body: Vec<u8>,
    ) -> StorageFuture<'a, String> {
        Box::pin(async move { self.write_object(target, &body).await })
    }

    fn create_multipart<'a>(&'a self, target: &'a UploadTarget) -> StorageFuture<'a, String> {
        Box::pin(self.create_upload(target))
    }

    fn put_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
    ) -> StorageFuture<'a, String> {
        Box::pin(self.store_part(location, upload_id, part_number, body))
    }

    fn complete_multipart<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
    ) -> StorageFuture<'a, String> {
        Box::pin(self.complete_upload(location, upload_id, parts))
    }

    fn abort_multipart<'a>(
        &'a self,
        _location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(self.abort_upload(upload_id))
    }

    fn head_object<'a>(&'a self, location: &'a ObjectLocation) -> StorageFuture<'a, ObjectInfo> {
        Box::pin(async move {
            let path = self.object_path(location)?;
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| io_error(e, location.key()))?;
            if !meta.is_file() {
                return Err(StorageError::NotFound(location.key().to_string()));
            }
            Ok(ObjectInfo {
                size: meta.len(),
                etag: self.object_etag(location, &path).await?,
            })
        })
    }

    fn get_object<'a>(&'a self, location: &'a ObjectLocation) -> StorageFuture<'a, ObjectBody> {
        Box::pin(async move {
            let data = self.read_object(location).await?;
            let etag = content_md5(&data);
            Ok(ObjectBody { data, etag })
        })
    }

    fn get_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        range: Range<u64>,
    ) -> StorageFuture<'a, ObjectBody> {
        Box::pin(async move {
            let path = self.object_path(location)?;
            let mut file = File::open(&path)
                .await
                .map_err(|e| io_error(e, location.key()))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| io_error(e, location.key()))?
                .len();
            if range.start > range.end || range.end > len {
                return Err(StorageError::PreconditionFailed(format!(
                    "range {}..{} outside object of {len} bytes",
                    range.start, range.end
                )));
            }

            let size = usize::try_from(range.end - range.start)
                .map_err(|_| StorageError::Other(format!("range of {} too large", location.key())))?;
            let mut data = vec![0u8; size];
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|e| io_error(e, location.key()))?;
            file.read_exact(&mut data)
                .await
                .map_err(|e| io_error(e, location.key()))?;
            Ok(ObjectBody {
                data,
                etag: self.object_etag(location, &path).await?,
            })
        })
    }
}

/// Returns a unique sibling of `path` to write into before renaming,
/// creating the parent directory.
pub(crate) async fn temp_sibling(path: &Path) -> Result<PathBuf, StorageError> {
    let what = path.display().to_string();
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Other(format!("{what} has no parent directory")))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(e, &what))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4())))
}

/// Writes `data` next to `path` and renames it into place, so readers
/// never see a partial file.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let what = path.display().to_string();
    let tmp = temp_sibling(path).await?;
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(e, &what));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(e, &what));
    }
    Ok(())
}

/// MD5 of everything `reader` yields, as lowercase hex.
pub(crate) async fn hash_reader<R>(reader: &mut R, what: &str) -> Result<String, StorageError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut hasher = Md5::new();
    copy_hashed(reader, &mut tokio::io::sink(), &mut [&mut hasher], what).await?;
    Ok(hex::encode(hasher.finalize()))
}

/// Copies `reader` into `writer`, feeding every chunk to `hashers`.
/// Returns the number of bytes copied.
pub(crate) async fn copy_hashed<R, W>(
    reader: &mut R,
    writer: &mut W,
    hashers: &mut [&mut Md5],
    what: &str,
) -> Result<u64, StorageError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| io_error(e, what))?;
        if n == 0 {
            return Ok(copied);
        }
        for hasher in hashers.iter_mut() {
            hasher.update(&buf[..n]);
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| io_error(e, what))?;
        copied += n as u64;
    }
}

pub(crate) fn io_error(e: std::io::Error, what: &str) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(what.to_string()),
        ErrorKind::PermissionDenied => StorageError::Auth(format!("{what}: {e}")),
        _ => StorageError::Other(format!("{what}: {e}")),
    }
}
