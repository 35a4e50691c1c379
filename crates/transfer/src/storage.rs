//! Storage client capability.
//!
//! The engine reaches object storage only through [`StorageClient`].
//! Implementations own the wire protocol, credentials and endpoints;
//! the engine owns retries, timeouts and cancellation.

use std::future::Future;
use std::ops::Range;
use std::pin::Pin;

use crate::error::StorageError;
use crate::types::{CannedAcl, ObjectMetadata};
use crate::validation::ObjectLocation;

/// Boxed future returned by every [`StorageClient`] operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Destination of an upload with the attributes applied on creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub location: ObjectLocation,
    pub metadata: ObjectMetadata,
    pub acl: Option<CannedAcl>,
}

/// Part reference handed to [`StorageClient::complete_multipart`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Size and integrity token of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: String,
}

/// Bytes of an object (or a range of it) with the object's ETag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectBody {
    pub data: Vec<u8>,
    pub etag: String,
}

/// Abstract access to an S3-compatible object store.
///
/// Errors must be classified: [`StorageError::Network`] and
/// [`StorageError::Timeout`] are retried, everything else fails the
/// transfer immediately. Dropping a returned future must abandon the
/// request.
pub trait StorageClient: Send + Sync {
    /// Stores `body` as a whole object and returns its ETag.
    fn put_object<'a>(&'a self, target: &'a UploadTarget, body: Vec<u8>)
    -> StorageFuture<'a, String>;

    /// Opens a multipart upload and returns its upload id.
    fn create_multipart<'a>(&'a self, target: &'a UploadTarget) -> StorageFuture<'a, String>;

    /// Uploads one part and returns its ETag.
    fn put_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
    ) -> StorageFuture<'a, String>;

    /// Stitches the listed parts into the final object and returns its ETag.
    fn complete_multipart<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
    ) -> StorageFuture<'a, String>;

    /// Discards a multipart upload and any parts stored for it.
    fn abort_multipart<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StorageFuture<'a, ()>;

    fn head_object<'a>(&'a self, location: &'a ObjectLocation) -> StorageFuture<'a, ObjectInfo>;

    fn get_object<'a>(&'a self, location: &'a ObjectLocation) -> StorageFuture<'a, ObjectBody>;

    /// Reads the half-open byte `range` of an object.
    fn get_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        range: Range<u64>,
    ) -> StorageFuture<'a, ObjectBody>;
}
