//! Multipart uploads staged under `<root>/.multipart/<upload-id>/`.
//!
//! Each upload directory holds `target.json` (where the object goes and
//! with which attributes) and one file per part, named by part number.

use std::io::ErrorKind;
use std::path::PathBuf;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use stowage_transfer::{
    CompletedPart, ObjectLocation, StorageError, UploadTarget, content_md5, normalize_etag,
};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    FsObjectStore, MULTIPART_DIR, StoredAttributes, copy_hashed, io_error, temp_sibling,
    write_atomic,
};

const TARGET_FILE: &str = "target.json";

/// Contents of `target.json`.
#[derive(Debug, Serialize, Deserialize)]
struct PendingUpload {
    bucket: String,
    key: String,
    #[serde(default)]
    attributes: StoredAttributes,
}

impl FsObjectStore {
    /// Upload ids are UUIDs; anything else cannot name an upload directory.
    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        Uuid::parse_str(upload_id)
            .map_err(|_| StorageError::NotFound(format!("upload {upload_id}")))?;
        Ok(self.root().join(MULTIPART_DIR).join(upload_id))
    }

    pub(crate) async fn create_upload(&self, target: &UploadTarget) -> Result<String, StorageError> {
        self.object_path(&target.location)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;

        let pending = PendingUpload {
            bucket: target.location.bucket().to_string(),
            key: target.location.key().to_string(),
            attributes: StoredAttributes {
                metadata: target.metadata.clone(),
                acl: target.acl,
                etag: None,
            },
        };
        let json = serde_json::to_vec_pretty(&pending)
            .map_err(|e| StorageError::Other(format!("cannot encode upload target: {e}")))?;
        write_atomic(&dir.join(TARGET_FILE), &json).await?;

        info!(
            bucket = target.location.bucket(),
            key = target.location.key(),
            %upload_id,
            "multipart upload created"
        );
        Ok(upload_id)
    }

    /// Loads an open upload and checks it belongs to `location`.
    async fn open_upload(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
    ) -> Result<(PathBuf, PendingUpload), StorageError> {
        let dir = self.upload_dir(upload_id)?;
        let raw = tokio::fs::read(dir.join(TARGET_FILE))
            .await
            .map_err(|e| io_error(e, &format!("upload {upload_id}")))?;
        let pending: PendingUpload = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Other(format!("corrupt upload {upload_id}: {e}")))?;
        if pending.bucket != location.bucket() || pending.key != location.key() {
            return Err(StorageError::PreconditionFailed(format!(
                "upload {upload_id} belongs to {}/{}",
                pending.bucket, pending.key
            )));
        }
        Ok((dir, pending))
    }

    pub(crate) async fn store_part(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String, StorageError> {
        if part_number == 0 {
            return Err(StorageError::PreconditionFailed(
                "part numbers start at 1".into(),
            ));
        }
        let (dir, _) = self.open_upload(location, upload_id).await?;
        write_atomic(&dir.join(part_number.to_string()), &body).await?;
        debug!(%upload_id, part = part_number, size = body.len(), "part stored");
        Ok(content_md5(&body))
    }

    /// Streams the listed parts into the object and closes the upload.
    pub(crate) async fn complete_upload(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StorageError> {
        let (dir, pending) = self.open_upload(location, upload_id).await?;
        if parts.is_empty() {
            return Err(StorageError::PreconditionFailed(format!(
                "upload {upload_id} lists no parts"
            )));
        }
        if parts.windows(2).any(|w| w[1].part_number <= w[0].part_number) {
            return Err(StorageError::PreconditionFailed(
                "parts must be listed in ascending order".into(),
            ));
        }

        let path = self.object_path(location)?;
        let tmp = temp_sibling(&path).await?;
        let etag = match assemble(&dir, parts, &tmp).await {
            Ok(etag) => etag,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(e, location.key()));
        }

        let target = UploadTarget {
            location: location.clone(),
            metadata: pending.attributes.metadata,
            acl: pending.attributes.acl,
        };
        self.write_attributes(&target, &etag).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!(%upload_id, error = %e, "cannot remove completed upload directory");
        }
        info!(key = location.key(), %upload_id, parts = parts.len(), "multipart upload completed");
        Ok(etag)
    }

    /// Removes an upload and its parts. Unknown uploads are ignored.
    pub(crate) async fn abort_upload(&self, upload_id: &str) -> Result<(), StorageError> {
        let dir = self.upload_dir(upload_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(%upload_id, "multipart upload aborted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e, &format!("upload {upload_id}"))),
        }
    }
}

/// Copies each part of upload `dir` into `out`, checking it against its
/// listed ETag, and returns the MD5 of the whole object.
async fn assemble(
    dir: &std::path::Path,
    parts: &[CompletedPart],
    out: &std::path::Path,
) -> Result<String, StorageError> {
    let what = out.display().to_string();
    let mut writer = File::create(out).await.map_err(|e| io_error(e, &what))?;
    let mut whole = Md5::new();

    for part in parts {
        let name = format!("part {}", part.part_number);
        let mut reader = match File::open(dir.join(part.part_number.to_string())).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::PreconditionFailed(format!(
                    "part {} was never uploaded",
                    part.part_number
                )));
            }
            Err(e) => return Err(io_error(e, &name)),
        };
        let mut single = Md5::new();
        copy_hashed(&mut reader, &mut writer, &mut [&mut single, &mut whole], &name).await?;
        let etag = hex::encode(single.finalize());
        if etag != normalize_etag(&part.etag) {
            return Err(StorageError::PreconditionFailed(format!(
                "part {} has ETag {etag}, not {}",
                part.part_number, part.etag
            )));
        }
    }

    writer.flush().await.map_err(|e| io_error(e, &what))?;
    writer.sync_all().await.map_err(|e| io_error(e, &what))?;
    Ok(hex::encode(whole.finalize()))
}
