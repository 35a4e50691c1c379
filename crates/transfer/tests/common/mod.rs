//! Scripted storage client and listener shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stowage_transfer::{
    CompletedPart, ObjectBody, ObjectInfo, ObjectLocation, StorageClient, StorageError,
    StorageFuture, TransferConfig, TransferError, TransferId, TransferListener, TransferState,
    UploadTarget, content_md5,
};
use tokio::sync::Semaphore;

pub const BUCKET: &str = "test-bucket";

/// Small parts and no backoff so scenarios run fast.
pub fn test_config(temp_dir: &std::path::Path) -> TransferConfig {
    TransferConfig {
        default_bucket: Some(BUCKET.into()),
        multipart_threshold: 4096,
        part_size: 4096,
        part_concurrency: 1,
        initial_backoff_ms: 0,
        part_timeout_ms: 5_000,
        temp_dir: Some(temp_dir.to_path_buf()),
        ..TransferConfig::default()
    }
}

/// In-memory object store that records every call.
#[derive(Default)]
pub struct MockStorage {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, String)>>,
    uploads: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
    calls: Mutex<Vec<String>>,
    next_upload: AtomicU64,
    fail_with: Mutex<Option<StorageError>>,
    corrupt_etags: Mutex<bool>,
    /// When set, every body transfer waits for a permit.
    gate: Mutex<Option<Arc<Semaphore>>>,
    /// When set, each `put_part` waits for its own part number to be
    /// released.
    part_gates: Mutex<Option<HashMap<u32, Arc<Semaphore>>>>,
    parts_in_flight: AtomicUsize,
    peak_parts_in_flight: AtomicUsize,
}

impl MockStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later call fail with `err`.
    pub fn fail_with(&self, err: StorageError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub fn corrupt_etags(&self) {
        *self.corrupt_etags.lock().unwrap() = true;
    }

    /// Holds body transfers until [`release`](Self::release) is called.
    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(n);
        }
    }

    pub fn release_all(&self) {
        self.release(1_000_000);
    }

    /// Holds every `put_part` until [`release_part`](Self::release_part)
    /// is called with its part number.
    pub fn hold_parts(&self) {
        *self.part_gates.lock().unwrap() = Some(HashMap::new());
    }

    pub fn release_part(&self, part_number: u32) {
        self.part_gate(part_number).add_permits(1);
    }

    /// Most `put_part` calls ever outstanding at once.
    pub fn peak_parts_in_flight(&self) -> usize {
        self.peak_parts_in_flight.load(Ordering::SeqCst)
    }

    fn part_gate(&self, part_number: u32) -> Arc<Semaphore> {
        let mut gates = self.part_gates.lock().unwrap();
        let gates = gates.get_or_insert_with(HashMap::new);
        Arc::clone(
            gates
                .entry(part_number)
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    async fn pass_part_gate(&self, part_number: u32) {
        if self.part_gates.lock().unwrap().is_none() {
            return;
        }
        if let Ok(permit) = self.part_gate(part_number).acquire().await {
            permit.forget();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(BUCKET.to_string(), key.to_string()))
            .map(|(data, _)| data.clone())
    }

    pub fn insert_object(&self, key: &str, data: Vec<u8>) {
        let etag = content_md5(&data);
        self.objects
            .lock()
            .unwrap()
            .insert((BUCKET.to_string(), key.to_string()), (data, etag));
    }

    fn record(&self, call: String) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(call);
        match self.fail_with.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
    }

    fn etag_for(&self, data: &[u8]) -> String {
        if *self.corrupt_etags.lock().unwrap() {
            "0000".into()
        } else {
            format!("\"{}\"", content_md5(data))
        }
    }

    fn lookup(&self, location: &ObjectLocation) -> Result<(Vec<u8>, String), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(location.bucket().to_string(), location.key().to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(location.key().to_string()))
    }
}

impl StorageClient for MockStorage {
    fn put_object<'a>(
        &'a self,
        target: &'a UploadTarget,
        body: Vec<u8>,
    ) -> StorageFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("put_object:{}", target.location.key()))?;
            self.pass_gate().await;
            let etag = self.etag_for(&body);
            self.objects.lock().unwrap().insert(
                (
                    target.location.bucket().to_string(),
                    target.location.key().to_string(),
                ),
                (body, etag.clone()),
            );
            Ok(etag)
        })
    }

    fn create_multipart<'a>(&'a self, target: &'a UploadTarget) -> StorageFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("create_multipart:{}", target.location.key()))?;
            let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
            self.uploads.lock().unwrap().insert(id.clone(), BTreeMap::new());
            Ok(id)
        })
    }

    fn put_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
    ) -> StorageFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("put_part:{}:{part_number}", location.key()))?;
            let now = self.parts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_parts_in_flight.fetch_max(now, Ordering::SeqCst);
            self.pass_gate().await;
            self.pass_part_gate(part_number).await;
            self.parts_in_flight.fetch_sub(1, Ordering::SeqCst);
            let etag = self.etag_for(&body);
            self.uploads
                .lock()
                .unwrap()
                .get_mut(upload_id)
                .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?
                .insert(part_number, body);
            Ok(etag)
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
    ) -> StorageFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("complete_multipart:{}", location.key()))?;
            let stored = self
                .uploads
                .lock()
                .unwrap()
                .remove(upload_id)
                .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?;
            let mut data = Vec::new();
            for part in parts {
                let body = stored.get(&part.part_number).ok_or_else(|| {
                    StorageError::PreconditionFailed(format!("part {} missing", part.part_number))
                })?;
                data.extend_from_slice(body);
            }
            let etag = format!("{}-{}", content_md5(&data), parts.len());
            self.objects.lock().unwrap().insert(
                (location.bucket().to_string(), location.key().to_string()),
                (data, etag.clone()),
            );
            Ok(etag)
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push(format!("abort_multipart:{}", location.key()));
            self.uploads.lock().unwrap().remove(upload_id);
            Ok(())
        })
    }

    fn head_object<'a>(&'a self, location: &'a ObjectLocation) -> StorageFuture<'a, ObjectInfo> {
        Box::pin(async move {
            self.record(format!("head_object:{}", location.key()))?;
            let (data, etag) = self.lookup(location)?;
            Ok(ObjectInfo {
                size: data.len() as u64,
                etag,
            })
        })
    }

    fn get_object<'a>(&'a self, location: &'a ObjectLocation) -> StorageFuture<'a, ObjectBody> {
        Box::pin(async move {
            self.record(format!("get_object:{}", location.key()))?;
            self.pass_gate().await;
            let (data, etag) = self.lookup(location)?;
            Ok(ObjectBody { data, etag })
        })
    }

    fn get_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        range: Range<u64>,
    ) -> StorageFuture<'a, ObjectBody> {
        Box::pin(async move {
            self.record(format!("get_part:{}:{}", location.key(), range.start))?;
            self.pass_gate().await;
            let (data, etag) = self.lookup(location)?;
            let end = (range.end as usize).min(data.len());
            let start = (range.start as usize).min(end);
            Ok(ObjectBody {
                data: data[start..end].to_vec(),
                etag,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    State(TransferState),
    Progress(u64, u64),
    Error(String),
}

/// Listener that remembers everything it was told.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(TransferId, Event)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn states(&self) -> Vec<TransferState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress(current, _) => Some(current),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }
}

impl TransferListener for Recorder {
    fn on_state_changed(&self, id: TransferId, state: TransferState) {
        self.events.lock().unwrap().push((id, Event::State(state)));
    }

    fn on_progress_changed(&self, id: TransferId, current: u64, total: u64) {
        self.events
            .lock()
            .unwrap()
            .push((id, Event::Progress(current, total)));
    }

    fn on_error(&self, id: TransferId, error: &TransferError) {
        self.events
            .lock()
            .unwrap()
            .push((id, Event::Error(error.to_string())));
    }
}

/// Tracks how many transfers are running at the same time.
#[derive(Default)]
pub struct RunningCounter {
    running: Mutex<HashSet<TransferId>>,
    peak: AtomicUsize,
}

impl RunningCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl TransferListener for RunningCounter {
    fn on_state_changed(&self, id: TransferId, state: TransferState) {
        let mut running = self.running.lock().unwrap();
        if state.is_running() {
            running.insert(id);
            self.peak.fetch_max(running.len(), Ordering::SeqCst);
        } else {
            running.remove(&id);
        }
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
