use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-unique transfer identifier. Never reused, even after removal.
pub type TransferId = u64;

/// Which way the bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Lifecycle state of a transfer.
///
/// Legal moves between states live in [`TransferState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Waiting,
    InProgress,
    Paused,
    PausedWaitingForNetwork,
    ResumedWaiting,
    Canceled,
    Failed,
    Completed,
    /// Every part is acknowledged; finalisation is pending.
    PartCompleted,
}

impl TransferState {
    pub const ALL: [TransferState; 9] = [
        Self::Waiting,
        Self::InProgress,
        Self::Paused,
        Self::PausedWaitingForNetwork,
        Self::ResumedWaiting,
        Self::Canceled,
        Self::Failed,
        Self::Completed,
        Self::PartCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::InProgress => "IN_PROGRESS",
            Self::Paused => "PAUSED",
            Self::PausedWaitingForNetwork => "PAUSED_WAITING_FOR_NETWORK",
            Self::ResumedWaiting => "RESUMED_WAITING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::PartCompleted => "PART_COMPLETED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown transfer state: {s}"))
    }
}

/// Progress of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Pending,
    Completed,
}

/// A contiguous byte range of a multipart transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    /// 1-based part number.
    pub part_number: u32,
    /// First byte of the range.
    pub range_start: u64,
    /// One past the last byte of the range.
    pub range_end: u64,
    pub state: PartState,
    /// Integrity token returned by the storage service once acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl PartDescriptor {
    pub fn len(&self) -> u64 {
        self.range_end - self.range_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self) -> bool {
        self.state == PartState::Completed
    }
}

/// Canned access-control list passed through to the storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CannedAcl {
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
    LogDeliveryWrite,
}

impl CannedAcl {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicRead => "public-read",
            Self::PublicReadWrite => "public-read-write",
            Self::AuthenticatedRead => "authenticated-read",
            Self::BucketOwnerRead => "bucket-owner-read",
            Self::BucketOwnerFullControl => "bucket-owner-full-control",
            Self::LogDeliveryWrite => "log-delivery-write",
        }
    }
}

impl fmt::Display for CannedAcl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CannedAcl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Private,
            Self::PublicRead,
            Self::PublicReadWrite,
            Self::AuthenticatedRead,
            Self::BucketOwnerRead,
            Self::BucketOwnerFullControl,
            Self::LogDeliveryWrite,
        ]
        .into_iter()
        .find(|acl| acl.as_str() == s)
        .ok_or_else(|| format!("unknown canned ACL: {s}"))
    }
}

/// Object metadata passed through to the storage service unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// User-defined `x-amz-meta-*` style entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_user(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user.insert(key.into(), value.into());
        self
    }
}

/// Durable record of one upload or download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub bucket: String,
    pub key: String,
    /// Absolute path of the file backing the transfer.
    pub local_path: PathBuf,
    /// Set only when the staging adapter created `local_path`.
    #[serde(default)]
    pub is_temporary_file: bool,
    /// Unknown for downloads until the object has been inspected.
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub bytes_transferred: u64,
    pub state: TransferState,
    /// Empty for single-shot transfers.
    #[serde(default)]
    pub parts: Vec<PartDescriptor>,
    #[serde(default)]
    pub metadata: ObjectMetadata,
    #[serde(default)]
    pub acl: Option<CannedAcl>,
    #[serde(default)]
    pub multipart_upload_id: Option<String>,
    /// ETag of the whole object once known.
    #[serde(default)]
    pub object_etag: Option<String>,
    /// Message of the most recent failure.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// Creates an unsaved record in `WAITING`. The store assigns the id.
    pub fn new(
        direction: TransferDirection,
        bucket: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            direction,
            bucket: bucket.into(),
            key: key.into(),
            local_path: local_path.into(),
            is_temporary_file: false,
            total_bytes: None,
            bytes_transferred: 0,
            state: TransferState::Waiting,
            parts: Vec::new(),
            metadata: ObjectMetadata::default(),
            acl: None,
            multipart_upload_id: None,
            object_etag: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_multipart(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn completed_parts(&self) -> impl Iterator<Item = &PartDescriptor> {
        self.parts.iter().filter(|p| p.is_completed())
    }

    pub fn pending_parts(&self) -> impl Iterator<Item = &PartDescriptor> {
        self.parts.iter().filter(|p| !p.is_completed())
    }

    /// Returns `true` once every part (or the single shot) is acknowledged.
    pub fn all_parts_completed(&self) -> bool {
        if self.parts.is_empty() {
            self.object_etag.is_some()
                && self.total_bytes.is_some_and(|t| self.bytes_transferred >= t)
        } else {
            self.parts.iter().all(PartDescriptor::is_completed)
        }
    }
}
