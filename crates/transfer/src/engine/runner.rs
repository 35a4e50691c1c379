//! Runs one transfer on a worker: part fan-out, retries, finalisation.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Engine, RunControl};
use crate::error::{StorageError, TransferError};
use crate::parts::{
    content_md5, normalize_etag, plan_parts, prepare_target, read_range, sync_file, write_at,
};
use crate::retry::RetryPolicy;
use crate::storage::{CompletedPart, ObjectBody, StorageClient, StorageFuture, UploadTarget};
use crate::types::{PartDescriptor, Transfer, TransferDirection, TransferId, TransferState};
use crate::validation::ObjectLocation;

/// Why a run ended early.
enum RunError {
    /// Paused, canceled, parked or shut down; whoever stopped the run
    /// already recorded the new state.
    Interrupted,
    Failed(TransferError),
}

impl From<TransferError> for RunError {
    fn from(e: TransferError) -> Self {
        RunError::Failed(e)
    }
}

/// Outcome of a single storage request or part.
enum PartError {
    Aborted,
    Failed(TransferError),
}

impl From<PartError> for RunError {
    fn from(e: PartError) -> Self {
        match e {
            PartError::Aborted => RunError::Interrupted,
            PartError::Failed(e) => RunError::Failed(e),
        }
    }
}

/// Runs transfer `id` under its lease.
pub(super) async fn run(engine: Arc<Engine>, id: TransferId) {
    let lease = engine.lease(id);
    {
        let _held = lease.lock().await;
        run_leased(&engine, id).await;
    }
    engine.release_lease(id, lease);
}

async fn run_leased(engine: &Arc<Engine>, id: TransferId) {
    let transfer = match engine.get(id) {
        Ok(t) => t,
        Err(e) => {
            debug!(transfer_id = id, error = %e, "dequeued transfer vanished");
            return;
        }
    };
    if !transfer.state.is_queued() || engine.is_shut_down() {
        return;
    }
    if !engine.is_online() {
        if let Err(e) = engine.park_for_network(id) {
            warn!(transfer_id = id, error = %e, "cannot park transfer while offline");
        }
        return;
    }

    let control = engine.activate(id);
    let outcome = match engine.transition(id, TransferState::InProgress) {
        Ok(transfer) => {
            let run = Run {
                engine,
                id,
                requests: Requests {
                    id,
                    retry: engine.retry.clone(),
                    timeout: engine.config.part_timeout(),
                    abort: control.abort.clone(),
                },
                control,
            };
            match transfer.direction {
                TransferDirection::Upload => run.upload(transfer).await,
                TransferDirection::Download => run.download(transfer).await,
            }
        }
        Err(e) if e.is_usage_error() => Err(RunError::Interrupted),
        Err(e) => Err(RunError::Failed(e)),
    };
    engine.deactivate(id);

    match outcome {
        Ok(()) => {}
        Err(RunError::Interrupted) => debug!(transfer_id = id, "run interrupted"),
        Err(RunError::Failed(e)) => engine.fail(id, e),
    }
}

struct Run<'e> {
    engine: &'e Arc<Engine>,
    id: TransferId,
    control: RunControl,
    requests: Requests,
}

impl Run<'_> {
    async fn upload(&self, transfer: Transfer) -> Result<(), RunError> {
        let location = ObjectLocation::new(&transfer.bucket, &transfer.key)
            .map_err(TransferError::from)?;
        let target = UploadTarget {
            location,
            metadata: transfer.metadata.clone(),
            acl: transfer.acl,
        };
        let storage = &*self.engine.storage;
        let target_ref = &target;

        if !transfer.is_multipart() {
            if !transfer.all_parts_completed() {
                self.check_stop()?;
                let total = transfer.total_bytes.unwrap_or(0);
                let body = read_range(&transfer.local_path, 0..total)
                    .await
                    .map_err(TransferError::Io)?;
                let expected = content_md5(&body);
                let etag = self
                    .requests
                    .send("put object", move || {
                        storage.put_object(target_ref, body.clone())
                    })
                    .await?;
                self.verify_upload(&expected, &etag)?;
                self.engine.record_single_shot(self.id, total, &etag)?;
            }
            self.check_stop()?;
            return self.advance(TransferState::Completed);
        }

        let upload_id = match transfer.multipart_upload_id.clone() {
            Some(upload_id) => upload_id,
            None => {
                self.check_stop()?;
                let upload_id = self
                    .requests
                    .send("create multipart upload", move || {
                        storage.create_multipart(target_ref)
                    })
                    .await?;
                let recorded = self.engine.amend(self.id, &mut |t| {
                    t.multipart_upload_id = Some(upload_id.clone());
                });
                match recorded {
                    Ok(_) => {}
                    Err(e) if e.is_usage_error() => {
                        // Canceled while the upload was being opened.
                        self.engine
                            .abort_multipart_in_background(&transfer, upload_id);
                        return Err(RunError::Interrupted);
                    }
                    Err(e) => return Err(e.into()),
                }
                debug!(transfer_id = self.id, %upload_id, "multipart upload created");
                upload_id
            }
        };

        if transfer.object_etag.is_some() {
            // Finalised before the previous run was interrupted.
            self.advance(TransferState::PartCompleted)?;
            return self.advance(TransferState::Completed);
        }

        let source = PartSource::Upload {
            location: target.location.clone(),
            upload_id: upload_id.clone(),
            path: transfer.local_path.clone(),
            verify: self.engine.config.verify_integrity,
        };
        self.drive_parts(&transfer, Arc::new(source)).await?;
        self.check_stop()?;
        self.advance(TransferState::PartCompleted)?;

        let record = self.engine.get(self.id)?;
        let parts: Vec<CompletedPart> = record
            .parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone().unwrap_or_default(),
            })
            .collect();
        let location = &target.location;
        let upload_id = upload_id.as_str();
        let parts = parts.as_slice();
        let etag = self
            .requests
            .send("complete multipart upload", move || {
                storage.complete_multipart(location, upload_id, parts)
            })
            .await?;
        self.amend(&mut |t| t.object_etag = Some(etag.clone()))?;
        self.advance(TransferState::Completed)
    }

    async fn download(&self, transfer: Transfer) -> Result<(), RunError> {
        let location = ObjectLocation::new(&transfer.bucket, &transfer.key)
            .map_err(TransferError::from)?;
        let storage = &*self.engine.storage;
        let location_ref = &location;

        self.check_stop()?;
        let info = self
            .requests
            .send("head object", move || storage.head_object(location_ref))
            .await?;

        let transfer = match transfer.object_etag.clone() {
            Some(known) => {
                if normalize_etag(&known) != normalize_etag(&info.etag) {
                    return Err(TransferError::IntegrityMismatch {
                        expected: known,
                        actual: info.etag,
                    }
                    .into());
                }
                transfer
            }
            None => {
                let parts = plan_parts(
                    info.size,
                    self.engine.config.multipart_threshold,
                    self.engine.config.part_size,
                );
                debug!(transfer_id = self.id, size = info.size, parts = parts.len(), "download planned");
                self.amend(&mut |t| {
                    t.total_bytes = Some(info.size);
                    t.object_etag = Some(info.etag.clone());
                    t.parts = parts.clone();
                    t.bytes_transferred = 0;
                })?
            }
        };

        let total = transfer.total_bytes.unwrap_or(info.size);
        let object_etag = transfer.object_etag.clone().unwrap_or(info.etag);
        let path = transfer.local_path.clone();
        prepare_target(&path, total)
            .await
            .map_err(TransferError::Io)?;

        if !transfer.is_multipart() {
            if !transfer.all_parts_completed() {
                self.check_stop()?;
                let body = self
                    .requests
                    .send("get object", move || storage.get_object(location_ref))
                    .await?;
                check_download_body(&body, total, &object_etag)?;
                write_at(&path, 0, &body.data)
                    .await
                    .map_err(TransferError::Io)?;
                self.engine.record_single_shot(self.id, total, &body.etag)?;
            }
        } else {
            let source = PartSource::Download {
                location: location.clone(),
                path: path.clone(),
                object_etag,
            };
            self.drive_parts(&transfer, Arc::new(source)).await?;
            self.check_stop()?;
            self.advance(TransferState::PartCompleted)?;
        }

        sync_file(&path).await.map_err(TransferError::Io)?;
        self.check_stop()?;
        self.advance(TransferState::Completed)
    }

    /// Moves every pending part through storage with at most
    /// `part_concurrency` in flight.
    ///
    /// Stops launching parts once the run is stopped; the first fatal
    /// part error aborts the parts still in flight.
    async fn drive_parts(
        &self,
        transfer: &Transfer,
        source: Arc<PartSource>,
    ) -> Result<(), RunError> {
        let mut pending: VecDeque<PartDescriptor> = transfer.pending_parts().cloned().collect();
        let limit = self.engine.config.part_concurrency.max(1);
        let mut in_flight = JoinSet::new();
        let mut failure: Option<TransferError> = None;

        loop {
            while failure.is_none()
                && in_flight.len() < limit
                && !self.control.stop.is_cancelled()
            {
                let Some(part) = pending.pop_front() else {
                    break;
                };
                let storage = Arc::clone(&self.engine.storage);
                let source = Arc::clone(&source);
                let requests = self.requests.clone();
                in_flight.spawn(async move {
                    transfer_part(storage.as_ref(), &source, &requests, part).await
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok((part_number, etag))) => {
                    if self.control.abort.is_cancelled() {
                        debug!(transfer_id = self.id, part = part_number, "aborted part result discarded");
                    } else {
                        self.engine.record_part(self.id, part_number, &etag)?;
                    }
                }
                Ok(Err(PartError::Aborted)) => {}
                Ok(Err(PartError::Failed(e))) => {
                    if failure.is_none() {
                        warn!(transfer_id = self.id, error = %e, "part failed; aborting the rest");
                        self.control.abort.cancel();
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        self.control.abort.cancel();
                        failure = Some(TransferError::Storage(format!(
                            "part task ended abnormally: {e}"
                        )));
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(RunError::Failed(e));
        }
        if !pending.is_empty() || self.control.abort.is_cancelled() {
            return Err(RunError::Interrupted);
        }
        Ok(())
    }

    fn check_stop(&self) -> Result<(), RunError> {
        if self.control.stop.is_cancelled() {
            Err(RunError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Moves to `to`; a concurrent pause or cancel wins.
    fn advance(&self, to: TransferState) -> Result<(), RunError> {
        match self.engine.transition(self.id, to) {
            Ok(_) => Ok(()),
            Err(e) if e.is_usage_error() => Err(RunError::Interrupted),
            Err(e) => Err(RunError::Failed(e)),
        }
    }

    fn amend(&self, change: &mut dyn FnMut(&mut Transfer)) -> Result<Transfer, RunError> {
        match self.engine.amend(self.id, change) {
            Ok(t) => Ok(t),
            Err(e) if e.is_usage_error() => Err(RunError::Interrupted),
            Err(e) => Err(RunError::Failed(e)),
        }
    }

    fn verify_upload(&self, expected: &str, etag: &str) -> Result<(), TransferError> {
        if self.engine.config.verify_integrity && normalize_etag(etag) != expected {
            return Err(TransferError::IntegrityMismatch {
                expected: expected.to_string(),
                actual: etag.to_string(),
            });
        }
        Ok(())
    }
}

/// What the parts of one run move, and where.
enum PartSource {
    Upload {
        location: ObjectLocation,
        upload_id: String,
        path: PathBuf,
        verify: bool,
    },
    Download {
        location: ObjectLocation,
        path: PathBuf,
        object_etag: String,
    },
}

/// Moves one part and returns its number and ETag.
async fn transfer_part(
    storage: &dyn StorageClient,
    source: &PartSource,
    requests: &Requests,
    part: PartDescriptor,
) -> Result<(u32, String), PartError> {
    let number = part.part_number;
    match source {
        PartSource::Upload {
            location,
            upload_id,
            path,
            verify,
        } => {
            let body = read_range(path, part.range_start..part.range_end)
                .await
                .map_err(|e| PartError::Failed(TransferError::Io(e)))?;
            let expected = verify.then(|| content_md5(&body));
            let upload_id = upload_id.as_str();
            let etag = requests
                .send("upload part", move || {
                    storage.put_part(location, upload_id, number, body.clone())
                })
                .await?;
            if let Some(expected) = expected
                && normalize_etag(&etag) != expected
            {
                return Err(PartError::Failed(TransferError::IntegrityMismatch {
                    expected,
                    actual: etag,
                }));
            }
            Ok((number, etag))
        }
        PartSource::Download {
            location,
            path,
            object_etag,
        } => {
            let range = part.range_start..part.range_end;
            let body = requests
                .send("download part", move || {
                    storage.get_part(location, range.clone())
                })
                .await?;
            check_download_body(&body, part.len(), object_etag).map_err(PartError::Failed)?;
            write_at(path, part.range_start, &body.data)
                .await
                .map_err(|e| PartError::Failed(TransferError::Io(e)))?;
            Ok((number, body.etag))
        }
    }
}

/// A downloaded body must have the requested length and belong to the
/// object version the download started with.
fn check_download_body(
    body: &ObjectBody,
    expected_len: u64,
    object_etag: &str,
) -> Result<(), TransferError> {
    let len = body.data.len() as u64;
    if len != expected_len {
        return Err(TransferError::IntegrityMismatch {
            expected: format!("{expected_len} bytes"),
            actual: format!("{len} bytes"),
        });
    }
    if normalize_etag(&body.etag) != normalize_etag(object_etag) {
        return Err(TransferError::IntegrityMismatch {
            expected: object_etag.to_string(),
            actual: body.etag.clone(),
        });
    }
    Ok(())
}

/// Retry and timeout policy applied to every storage request of a run.
#[derive(Clone)]
struct Requests {
    id: TransferId,
    retry: RetryPolicy,
    timeout: Duration,
    abort: CancellationToken,
}

impl Requests {
    /// Issues `request` until it succeeds, fails fatally, or runs out of
    /// attempts. A timed-out attempt counts as a transient failure.
    async fn send<'a, T, F>(&self, what: &'static str, mut request: F) -> Result<T, PartError>
    where
        F: FnMut() -> StorageFuture<'a, T>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(PartError::Aborted),
                outcome = tokio::time::timeout(self.timeout, request()) => {
                    outcome.unwrap_or(Err(StorageError::Timeout))
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        transfer_id = self.id,
                        request = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient storage error, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.abort.cancelled() => return Err(PartError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    debug!(transfer_id = self.id, request = what, attempt, error = %e, "storage request failed");
                    return Err(PartError::Failed(TransferError::from_storage(e, attempt)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(data: &[u8], etag: &str) -> ObjectBody {
        ObjectBody {
            data: data.to_vec(),
            etag: etag.to_string(),
        }
    }

    #[test]
    fn download_body_checks() {
        assert!(check_download_body(&body(b"abcd", "\"e1\""), 4, "e1").is_ok());
        assert!(matches!(
            check_download_body(&body(b"abc", "e1"), 4, "e1"),
            Err(TransferError::IntegrityMismatch { .. })
        ));
        assert!(matches!(
            check_download_body(&body(b"abcd", "e2"), 4, "e1"),
            Err(TransferError::IntegrityMismatch { .. })
        ));
    }

    fn requests(max_attempts: u32) -> Requests {
        Requests {
            id: 1,
            retry: RetryPolicy {
                max_attempts,
                initial_delay: Duration::ZERO,
                ..RetryPolicy::default()
            },
            timeout: Duration::from_secs(5),
            abort: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn transient_errors_use_the_whole_budget() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), PartError> = requests(3)
            .send("test", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async { Err::<(), _>(StorageError::Network("reset".into())) })
            })
            .await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(matches!(
            result,
            Err(PartError::Failed(TransferError::TransientNetwork { attempts: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), PartError> = requests(3)
            .send("test", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async { Err::<(), _>(StorageError::Auth("denied".into())) })
            })
            .await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(PartError::Failed(TransferError::AuthOrPermission(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_transient() {
        let mut requests = requests(2);
        requests.timeout = Duration::from_millis(100);
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u8, PartError> = requests
            .send("test", || {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async move {
                    if n == 0 {
                        std::future::pending::<()>().await;
                    }
                    Ok::<u8, StorageError>(7)
                })
            })
            .await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abort_wins_over_a_hanging_request() {
        let requests = requests(3);
        requests.abort.cancel();
        let result: Result<(), PartError> = requests
            .send("test", || {
                Box::pin(std::future::pending::<Result<(), StorageError>>())
            })
            .await;
        assert!(matches!(result, Err(PartError::Aborted)));
    }
}
