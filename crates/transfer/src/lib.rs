//! Resumable, observable transfer engine for object storage.
//!
//! A [`TransferManager`] accepts uploads (from a file or an arbitrary
//! stream) and downloads, persists each one as a [`Transfer`] record,
//! and runs it on a bounded worker pool. Large payloads are split into
//! parts that move concurrently, are retried with exponential backoff,
//! and survive pause, network loss and process restart. Interested
//! parties attach [`TransferListener`]s to follow state and progress.
//!
//! The network is reached only through the [`StorageClient`] capability;
//! the engine never encodes a wire protocol itself.

mod config;
mod engine;
mod error;
mod manager;
mod observer;
mod parts;
mod retry;
mod staging;
mod state;
mod storage;
mod store;
mod types;
mod validation;

pub use config::{ConfigError, TransferConfig};
pub use error::{StorageError, TransferError};
pub use manager::{
    TransferManager, TransferManagerBuilder, TransferObserver, TransferOptions, UploadSource,
};
pub use observer::{ObserverRegistry, SubscriptionHandle, TransferListener};
pub use parts::{content_md5, normalize_etag, plan_parts};
pub use retry::RetryPolicy;
pub use staging::{StagedFile, StagingAdapter};
pub use storage::{CompletedPart, ObjectBody, ObjectInfo, StorageClient, StorageFuture, UploadTarget};
pub use store::{JsonFileStore, MemoryStore, TransferFilter, TransferStore};
pub use types::{
    CannedAcl, ObjectMetadata, PartDescriptor, PartState, Transfer, TransferDirection, TransferId,
    TransferState,
};
pub use validation::{ObjectLocation, ValidationError, validate_relative_path};

/// Default multipart threshold and part size: 5 MiB, the smallest part
/// S3-compatible services accept for anything but the final part.
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;
