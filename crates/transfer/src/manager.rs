//! Public façade: the [`TransferManager`] and its per-transfer
//! [`TransferObserver`] handles.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::debug;

use crate::config::TransferConfig;
use crate::engine::{Engine, source_size};
use crate::error::TransferError;
use crate::observer::{SubscriptionHandle, TransferListener};
use crate::parts::plan_parts;
use crate::staging::delete_staged_file;
use crate::storage::StorageClient;
use crate::store::{JsonFileStore, MemoryStore, TransferFilter, TransferStore};
use crate::types::{
    CannedAcl, ObjectMetadata, Transfer, TransferDirection, TransferId, TransferState,
};
use crate::validation::{ObjectLocation, ValidationError};

/// Per-request options.
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Overrides the configured default bucket.
    pub bucket: Option<String>,
    pub object_metadata: ObjectMetadata,
    pub canned_acl: Option<CannedAcl>,
    /// Attached before the transfer is queued, so it sees `WAITING`.
    pub transfer_listener: Option<Arc<dyn TransferListener>>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn object_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.object_metadata = metadata;
        self
    }

    pub fn canned_acl(mut self, acl: CannedAcl) -> Self {
        self.canned_acl = Some(acl);
        self
    }

    pub fn transfer_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.transfer_listener = Some(listener);
        self
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("bucket", &self.bucket)
            .field("object_metadata", &self.object_metadata)
            .field("canned_acl", &self.canned_acl)
            .field("transfer_listener", &self.transfer_listener.is_some())
            .finish()
    }
}

/// Payload of an upload.
pub enum UploadSource {
    File(PathBuf),
    /// Drained into a staged file first; `size_hint` is checked against
    /// the number of bytes actually read.
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size_hint: Option<u64>,
    },
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream { size_hint, .. } => f
                .debug_struct("Stream")
                .field("size_hint", size_hint)
                .finish_non_exhaustive(),
        }
    }
}

/// Builds a [`TransferManager`].
#[derive(Default)]
pub struct TransferManagerBuilder {
    config: TransferConfig,
    storage: Option<Arc<dyn StorageClient>>,
    store: Option<Arc<dyn TransferStore>>,
}

impl TransferManagerBuilder {
    pub fn config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageClient>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Overrides the record store chosen from the configuration.
    pub fn store(mut self, store: Arc<dyn TransferStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Starts the engine. Must be called within a tokio runtime.
    ///
    /// Without an explicit store, records go to the JSON file named by
    /// `store_path`, or stay in memory when it is unset.
    pub fn build(self) -> Result<TransferManager, TransferError> {
        self.config.validate()?;
        if let Err(e) = tokio::runtime::Handle::try_current() {
            return Err(ValidationError::InvalidConfig(format!(
                "transfer manager needs a tokio runtime: {e}"
            ))
            .into());
        }
        let storage = self
            .storage
            .ok_or(ValidationError::MissingField("storage"))?;
        let store: Arc<dyn TransferStore> = match (self.store, &self.config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonFileStore::open(path.clone())?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let engine = Engine::start(self.config, store, storage);
        Ok(TransferManager { engine })
    }
}

/// Accepts uploads and downloads and runs them in the background.
///
/// Every call returns immediately; progress is followed through the
/// returned [`TransferObserver`] or attached [`TransferListener`]s.
#[derive(Clone)]
pub struct TransferManager {
    engine: Arc<Engine>,
}

impl TransferManager {
    pub fn builder() -> TransferManagerBuilder {
        TransferManagerBuilder::default()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.engine.config
    }

    /// Uploads `source` to `key`. Streams are staged to a local file
    /// first and then follow the file path unchanged.
    pub async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        options: TransferOptions,
    ) -> Result<TransferObserver, TransferError> {
        match source {
            UploadSource::File(path) => self.upload_file(key, &path, options),
            UploadSource::Stream { mut reader, size_hint } => {
                self.upload_stream(key, &mut reader, size_hint, options)
                    .await
            }
        }
    }

    pub fn upload_file(
        &self,
        key: &str,
        path: &Path,
        options: TransferOptions,
    ) -> Result<TransferObserver, TransferError> {
        let path = std::path::absolute(path)?;
        self.start_upload(key, path, false, options)
    }

    /// Stages `reader` into the configured temp directory, then uploads
    /// the staged file. The engine deletes that file once the transfer
    /// settles.
    pub async fn upload_stream<R>(
        &self,
        key: &str,
        reader: &mut R,
        size_hint: Option<u64>,
        options: TransferOptions,
    ) -> Result<TransferObserver, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.engine.is_shut_down() {
            return Err(TransferError::ShutDown);
        }
        // Reject bad locations before draining the stream.
        self.location(key, &options)?;
        let staged = self.engine.staging.stage(reader, size_hint).await?;
        match self.start_upload(key, staged.path.clone(), true, options) {
            Ok(observer) => Ok(observer),
            Err(e) => {
                delete_staged_file(&staged.path);
                Err(e)
            }
        }
    }

    fn start_upload(
        &self,
        key: &str,
        path: PathBuf,
        is_temporary_file: bool,
        options: TransferOptions,
    ) -> Result<TransferObserver, TransferError> {
        let location = self.location(key, &options)?;
        let size = source_size(&path)?;
        let config = &self.engine.config;

        let mut transfer = Transfer::new(
            TransferDirection::Upload,
            location.bucket(),
            location.key(),
            path,
        );
        transfer.is_temporary_file = is_temporary_file;
        transfer.total_bytes = Some(size);
        transfer.parts = plan_parts(size, config.multipart_threshold, config.part_size);
        transfer.metadata = options.object_metadata;
        transfer.acl = options.canned_acl;

        let record = self.engine.create(transfer, options.transfer_listener)?;
        TransferObserver::attach(&self.engine, record.id)
    }

    /// Downloads `key` into `file`, creating parent directories as needed.
    pub fn download(
        &self,
        key: &str,
        file: &Path,
        options: TransferOptions,
    ) -> Result<TransferObserver, TransferError> {
        let location = self.location(key, &options)?;
        let path = std::path::absolute(file)?;
        let mut transfer = Transfer::new(
            TransferDirection::Download,
            location.bucket(),
            location.key(),
            path,
        );
        transfer.metadata = options.object_metadata;
        let record = self.engine.create(transfer, options.transfer_listener)?;
        TransferObserver::attach(&self.engine, record.id)
    }

    /// Stops starting new parts; parts in flight finish and are kept.
    pub fn pause(&self, id: TransferId) -> Result<(), TransferError> {
        self.engine.pause(id).map(|_| ())
    }

    /// Re-queues a paused or failed transfer behind everything queued.
    pub fn resume(&self, id: TransferId) -> Result<(), TransferError> {
        self.engine.resume(id).map(|_| ())
    }

    /// Marks the transfer `CANCELED` immediately and aborts its parts.
    pub fn cancel(&self, id: TransferId) -> Result<(), TransferError> {
        self.engine.cancel(id).map(|_| ())
    }

    /// Cancels the transfer if needed and deletes its record.
    pub fn remove(&self, id: TransferId) -> Result<Transfer, TransferError> {
        self.engine.remove(id)
    }

    pub fn get_transfer(&self, id: TransferId) -> Result<TransferObserver, TransferError> {
        TransferObserver::attach(&self.engine, id)
    }

    pub fn get_transfers_with_state(
        &self,
        state: TransferState,
    ) -> Result<Vec<TransferObserver>, TransferError> {
        self.get_transfers(&TransferFilter::with_state(state))
    }

    pub fn get_transfers(
        &self,
        filter: &TransferFilter,
    ) -> Result<Vec<TransferObserver>, TransferError> {
        self.engine
            .store
            .list(filter)?
            .into_iter()
            .map(|t| TransferObserver::attach(&self.engine, t.id))
            .collect()
    }

    /// Binds a listener to an existing transfer. Its current status is
    /// replayed unless it is still `WAITING`.
    pub fn subscribe(
        &self,
        id: TransferId,
        listener: Arc<dyn TransferListener>,
    ) -> Result<SubscriptionHandle, TransferError> {
        self.engine.subscribe(id, listener).map(|(handle, _)| handle)
    }

    pub fn unsubscribe(&self, id: TransferId, handle: SubscriptionHandle) -> bool {
        self.engine.observers.unsubscribe(id, handle)
    }

    /// Feeds the connectivity signal.
    pub fn set_network_available(&self, available: bool) -> Result<(), TransferError> {
        self.engine.set_network_available(available)
    }

    /// Re-queues transfers persisted by an earlier process and returns how
    /// many were queued.
    pub fn recover(&self) -> Result<usize, TransferError> {
        self.engine.recover()
    }

    /// Waits until every notification emitted so far was delivered.
    pub async fn flush_notifications(&self) {
        self.engine.observers.flush().await;
    }

    /// Stops accepting work and waits for running transfers to stop.
    /// Records are left as they are and can be recovered later.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    fn location(&self, key: &str, options: &TransferOptions) -> Result<ObjectLocation, TransferError> {
        let bucket = options
            .bucket
            .clone()
            .or_else(|| self.engine.config.default_bucket.clone())
            .ok_or(ValidationError::MissingField("bucket"))?;
        Ok(ObjectLocation::new(bucket, key)?)
    }
}

/// Last status seen by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    state: TransferState,
    bytes_transferred: u64,
    bytes_total: Option<u64>,
    /// Notifications applied so far.
    deliveries: u64,
}

impl Snapshot {
    fn of(transfer: &Transfer) -> Self {
        Self {
            state: transfer.state,
            bytes_transferred: transfer.bytes_transferred,
            bytes_total: transfer.total_bytes,
            deliveries: 0,
        }
    }
}

/// Overwrites `snapshot` with a record read from the store, unless a
/// notification was delivered since `seen` deliveries. A delivered
/// notification is at least as new as the record, so it wins.
fn seed(snapshot: &watch::Sender<Snapshot>, seen: u64, record: &Transfer) {
    snapshot.send_if_modified(|s| {
        if s.deliveries != seen {
            return false;
        }
        let next = Snapshot {
            deliveries: seen,
            ..Snapshot::of(record)
        };
        let changed = *s != next;
        *s = next;
        changed
    });
}

/// Keeps an observer's snapshot current.
struct Tracker {
    snapshot: Arc<watch::Sender<Snapshot>>,
}

impl TransferListener for Tracker {
    fn on_state_changed(&self, _id: TransferId, state: TransferState) {
        self.snapshot.send_modify(|s| {
            s.state = state;
            s.deliveries += 1;
        });
    }

    fn on_progress_changed(&self, _id: TransferId, bytes_current: u64, bytes_total: u64) {
        self.snapshot.send_modify(|s| {
            s.bytes_transferred = s.bytes_transferred.max(bytes_current);
            s.bytes_total = Some(bytes_total);
            s.deliveries += 1;
        });
    }
}

/// Handle on one transfer.
///
/// Cheap to clone. The cached state follows notifications; call
/// [`refresh`](Self::refresh) to re-read the record.
#[derive(Clone)]
pub struct TransferObserver {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    engine: Arc<Engine>,
    id: TransferId,
    bucket: String,
    key: String,
    path: PathBuf,
    snapshot: Arc<watch::Sender<Snapshot>>,
    tracker: SubscriptionHandle,
    listener: Mutex<Option<SubscriptionHandle>>,
}

impl Drop for ObserverInner {
    fn drop(&mut self) {
        self.engine.observers.unsubscribe(self.id, self.tracker);
    }
}

impl TransferObserver {
    fn attach(engine: &Arc<Engine>, id: TransferId) -> Result<Self, TransferError> {
        let current = engine.get(id)?;
        let snapshot = Arc::new(watch::Sender::new(Snapshot::of(&current)));
        let tracker = Arc::new(Tracker {
            snapshot: Arc::clone(&snapshot),
        });
        let (handle, current) = engine.subscribe(id, tracker)?;
        seed(&snapshot, 0, &current);
        Ok(Self {
            inner: Arc::new(ObserverInner {
                engine: Arc::clone(engine),
                id,
                bucket: current.bucket,
                key: current.key,
                path: current.local_path,
                snapshot,
                tracker: handle,
                listener: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> TransferId {
        self.inner.id
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn state(&self) -> TransferState {
        self.inner.snapshot.borrow().state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.snapshot.borrow().bytes_transferred
    }

    /// Unknown for downloads until the object has been inspected.
    pub fn bytes_total(&self) -> Option<u64> {
        self.inner.snapshot.borrow().bytes_total
    }

    pub fn absolute_file_path(&self) -> &Path {
        &self.inner.path
    }

    /// Re-reads the record from the store.
    pub fn refresh(&self) -> Result<Transfer, TransferError> {
        let seen = self.inner.snapshot.borrow().deliveries;
        let current = self.inner.engine.get(self.inner.id)?;
        seed(&self.inner.snapshot, seen, &current);
        Ok(current)
    }

    /// Attaches `listener`, replacing any listener previously set through
    /// this handle.
    pub fn set_transfer_listener(
        &self,
        listener: Arc<dyn TransferListener>,
    ) -> Result<(), TransferError> {
        self.clean_transfer_listener();
        let (handle, _) = self.inner.engine.subscribe(self.inner.id, listener)?;
        if let Ok(mut slot) = self.inner.listener.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Detaches the listener set through [`set_transfer_listener`](Self::set_transfer_listener).
    pub fn clean_transfer_listener(&self) {
        let previous = self
            .inner
            .listener
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = previous {
            self.inner.engine.observers.unsubscribe(self.inner.id, handle);
        }
    }

    /// Attaches an additional listener.
    pub fn subscribe(
        &self,
        listener: Arc<dyn TransferListener>,
    ) -> Result<SubscriptionHandle, TransferError> {
        self.inner
            .engine
            .subscribe(self.inner.id, listener)
            .map(|(handle, _)| handle)
    }

    /// Waits until the transfer is `COMPLETED`, `CANCELED` or `FAILED`
    /// and returns that state. Never returns for a transfer left paused.
    pub async fn wait_until_settled(&self) -> TransferState {
        let mut rx = self.inner.snapshot.subscribe();
        let settled = match rx.wait_for(|s| s.state.is_settled()).await {
            Ok(snapshot) => snapshot.state,
            Err(_) => self.state(),
        };
        debug!(transfer_id = self.inner.id, state = %settled, "transfer settled");
        settled
    }
}

impl fmt::Debug for TransferObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = *self.inner.snapshot.borrow();
        f.debug_struct("TransferObserver")
            .field("id", &self.inner.id)
            .field("bucket", &self.inner.bucket)
            .field("key", &self.inner.key)
            .field("state", &snapshot.state)
            .field("bytes_transferred", &snapshot.bytes_transferred)
            .field("bytes_total", &snapshot.bytes_total)
            .finish()
    }
}
