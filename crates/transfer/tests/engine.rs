mod common;

use std::sync::Arc;

use common::{
    BUCKET, MockStorage, Recorder, RunningCounter, eventually, payload, test_config,
};
use stowage_transfer::{
    CannedAcl, JsonFileStore, ObjectLocation, ObjectMetadata, StorageClient, StorageError,
    Transfer, TransferConfig, TransferDirection, TransferError, TransferManager, TransferOptions,
    TransferState, TransferStore, UploadSource, UploadTarget, ValidationError, content_md5,
    plan_parts,
};
use tempfile::TempDir;

fn manager(config: TransferConfig, storage: &Arc<MockStorage>) -> TransferManager {
    TransferManager::builder()
        .config(config)
        .storage(storage.clone())
        .build()
        .unwrap()
}

fn entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn nine_kib_stream_in_four_kib_parts() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let manager = manager(test_config(staging.path()), &storage);
    let recorder = Recorder::new();
    let data = payload(9 * 1024);

    let observer = manager
        .upload_stream(
            "logs/nine.bin",
            &mut data.as_slice(),
            Some(data.len() as u64),
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .await
        .unwrap();
    let staged = observer.absolute_file_path().to_path_buf();
    assert!(staged.starts_with(staging.path()));

    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    manager.flush_notifications().await;

    assert_eq!(recorder.progress(), vec![4096, 8192, 9216]);
    assert_eq!(
        recorder.states(),
        vec![
            TransferState::Waiting,
            TransferState::InProgress,
            TransferState::PartCompleted,
            TransferState::Completed,
        ]
    );
    assert_eq!(observer.bytes_transferred(), 9216);
    assert_eq!(observer.bytes_total(), Some(9216));
    assert_eq!(storage.count("put_part:logs/nine.bin:"), 3);
    assert_eq!(storage.object("logs/nine.bin").unwrap(), data);
    assert!(!staged.exists());
    assert_eq!(entries(staging.path()), 0);
}

#[tokio::test]
async fn transient_failures_exhaust_three_attempts() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.fail_with(StorageError::Network("connection reset".into()));
    let manager = manager(test_config(staging.path()), &storage);
    let recorder = Recorder::new();

    let observer = manager
        .upload_stream(
            "flaky.txt",
            &mut &b"small body"[..],
            None,
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .await
        .unwrap();

    assert_eq!(observer.wait_until_settled().await, TransferState::Failed);
    manager.flush_notifications().await;

    assert_eq!(storage.count("put_object:flaky.txt"), 3);
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("3 attempt"), "{}", errors[0]);
    // The error is reported before the state change.
    let events = recorder.events();
    let error_at = events
        .iter()
        .position(|e| matches!(e, common::Event::Error(_)))
        .unwrap();
    assert_eq!(
        events[error_at + 1],
        common::Event::State(TransferState::Failed)
    );

    let record = observer.refresh().unwrap();
    assert!(record.error.unwrap().contains("connection reset"));
    assert!(!observer.absolute_file_path().exists());
}

#[tokio::test]
async fn fatal_errors_fail_without_retry() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.fail_with(StorageError::Auth("bad signature".into()));
    let manager = manager(test_config(staging.path()), &storage);

    let source = staging.path().join("src.bin");
    std::fs::write(&source, b"abc").unwrap();
    let observer = manager
        .upload_file("denied.bin", &source, TransferOptions::new())
        .unwrap();

    assert_eq!(observer.wait_until_settled().await, TransferState::Failed);
    assert_eq!(storage.count("put_object:"), 1);
    // Caller-owned files are never deleted.
    assert!(source.exists());
}

#[tokio::test]
async fn canceling_a_waiting_transfer_never_touches_storage() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let config = TransferConfig {
        max_concurrent_transfers: 1,
        ..test_config(staging.path())
    };
    let manager = manager(config, &storage);

    let first = manager
        .upload_stream("first", &mut &b"one"[..], None, TransferOptions::new())
        .await
        .unwrap();
    eventually("first transfer to start", || storage.count("put_object:first") == 1).await;

    let recorder = Recorder::new();
    let second = manager
        .upload_stream(
            "second",
            &mut &b"two"[..],
            None,
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .await
        .unwrap();
    assert_eq!(second.state(), TransferState::Waiting);

    manager.cancel(second.id()).unwrap();
    assert_eq!(
        second.refresh().unwrap().state,
        TransferState::Canceled
    );
    assert!(!second.absolute_file_path().exists());

    storage.release_all();
    assert_eq!(first.wait_until_settled().await, TransferState::Completed);
    manager.flush_notifications().await;

    assert!(storage.calls().iter().all(|c| !c.ends_with("second")));
    assert_eq!(
        recorder.states(),
        vec![TransferState::Waiting, TransferState::Canceled]
    );
    assert!(matches!(
        manager.cancel(second.id()),
        Err(TransferError::AlreadyTerminal { .. })
    ));
}

#[tokio::test]
async fn late_subscriber_gets_the_terminal_state_replayed() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let manager = manager(test_config(staging.path()), &storage);

    let observer = manager
        .upload_stream("done.txt", &mut &b"hello"[..], None, TransferOptions::new())
        .await
        .unwrap();
    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    let calls_before = storage.calls().len();

    let late = Recorder::new();
    manager.subscribe(observer.id(), late.clone()).unwrap();
    manager.flush_notifications().await;

    assert_eq!(
        late.events(),
        vec![
            common::Event::Progress(5, 5),
            common::Event::State(TransferState::Completed)
        ]
    );
    assert_eq!(storage.calls().len(), calls_before);
    assert!(matches!(
        manager.resume(observer.id()),
        Err(TransferError::AlreadyTerminal { .. })
    ));
}

#[tokio::test]
async fn pause_and_resume_keep_completed_parts() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let manager = manager(test_config(staging.path()), &storage);
    let recorder = Recorder::new();
    let data = payload(9 * 1024);
    let source = staging.path().join("big.bin");
    std::fs::write(&source, &data).unwrap();

    let observer = manager
        .upload_file(
            "big.bin",
            &source,
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .unwrap();

    storage.release(1);
    eventually("first part", || observer.bytes_transferred() == 4096).await;
    eventually("second part in flight", || {
        storage.count("put_part:big.bin:2") == 1
    })
    .await;

    manager.pause(observer.id()).unwrap();
    assert_eq!(observer.refresh().unwrap().state, TransferState::Paused);

    // The part in flight finishes and is kept.
    storage.release(1);
    eventually("second part kept", || observer.bytes_transferred() == 8192).await;
    assert_eq!(storage.count("put_part:big.bin:3"), 0);

    manager.resume(observer.id()).unwrap();
    storage.release_all();
    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    manager.flush_notifications().await;

    for part in 1..=3 {
        assert_eq!(
            storage.count(&format!("put_part:big.bin:{part}")),
            1,
            "part {part} uploaded more than once"
        );
    }
    assert_eq!(storage.count("create_multipart:big.bin"), 1);
    assert_eq!(storage.object("big.bin").unwrap(), data);

    let progress = recorder.progress();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&9216));
    assert!(recorder.states().contains(&TransferState::Paused));
}

#[tokio::test]
async fn stream_upload_matches_file_upload() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let manager = manager(test_config(staging.path()), &storage);
    let data = payload(6000);
    let source = staging.path().join("file.bin");
    std::fs::write(&source, &data).unwrap();

    let from_file = manager
        .upload(
            "a.bin",
            UploadSource::File(source.clone()),
            TransferOptions::new(),
        )
        .await
        .unwrap();
    let from_stream = manager
        .upload(
            "b.bin",
            UploadSource::Stream {
                reader: Box::new(std::io::Cursor::new(data.clone())),
                size_hint: Some(6000),
            },
            TransferOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(from_file.wait_until_settled().await, TransferState::Completed);
    assert_eq!(from_stream.wait_until_settled().await, TransferState::Completed);

    let file_record = from_file.refresh().unwrap();
    let stream_record = from_stream.refresh().unwrap();
    assert!(!file_record.is_temporary_file);
    assert!(stream_record.is_temporary_file);
    assert_eq!(file_record.total_bytes, stream_record.total_bytes);
    assert_eq!(file_record.parts.len(), stream_record.parts.len());
    assert_eq!(storage.object("a.bin"), storage.object("b.bin"));
    assert!(source.exists());
    assert!(!from_stream.absolute_file_path().exists());
}

#[tokio::test]
async fn canceling_a_running_upload_aborts_and_cleans_up() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let manager = manager(test_config(staging.path()), &storage);
    let data = payload(9 * 1024);

    let observer = manager
        .upload_stream("gone.bin", &mut data.as_slice(), None, TransferOptions::new())
        .await
        .unwrap();
    eventually("first part in flight", || {
        storage.count("put_part:gone.bin:1") == 1
    })
    .await;

    manager.cancel(observer.id()).unwrap();
    assert_eq!(observer.refresh().unwrap().state, TransferState::Canceled);
    assert!(!observer.absolute_file_path().exists());

    eventually("multipart abort", || {
        storage.count("abort_multipart:gone.bin") == 1
    })
    .await;
    storage.release_all();
    manager.flush_notifications().await;
    assert_eq!(observer.refresh().unwrap().bytes_transferred, 0);
    assert!(storage.object("gone.bin").is_none());
}

#[tokio::test]
async fn integrity_mismatch_fails_the_transfer() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.corrupt_etags();
    let manager = manager(test_config(staging.path()), &storage);
    let recorder = Recorder::new();

    let observer = manager
        .upload_stream(
            "corrupt.txt",
            &mut &b"payload"[..],
            None,
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .await
        .unwrap();

    assert_eq!(observer.wait_until_settled().await, TransferState::Failed);
    manager.flush_notifications().await;
    assert_eq!(storage.count("put_object:corrupt.txt"), 1);
    assert!(recorder.errors()[0].starts_with("integrity mismatch"));
}

#[tokio::test]
async fn multipart_download_reassembles_the_object() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let data = payload(10_000);
    storage.insert_object("remote.bin", data.clone());
    let manager = manager(test_config(staging.path()), &storage);
    let recorder = Recorder::new();
    let target = staging.path().join("downloads/remote.bin");

    let observer = manager
        .download(
            "remote.bin",
            &target,
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .unwrap();

    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    manager.flush_notifications().await;

    assert_eq!(std::fs::read(&target).unwrap(), data);
    assert_eq!(storage.count("get_part:remote.bin:"), 3);
    assert_eq!(recorder.progress(), vec![4096, 8192, 10_000]);
    assert_eq!(observer.bytes_total(), Some(10_000));
    assert!(!observer.refresh().unwrap().is_temporary_file);
}

#[tokio::test]
async fn downloading_a_missing_object_fails() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let manager = manager(test_config(staging.path()), &storage);

    let observer = manager
        .download(
            "nope",
            &staging.path().join("nope"),
            TransferOptions::new(),
        )
        .unwrap();

    assert_eq!(observer.wait_until_settled().await, TransferState::Failed);
    let record = observer.refresh().unwrap();
    assert!(record.error.unwrap().starts_with("not found"));
    assert_eq!(storage.count("head_object:nope"), 1);
}

#[tokio::test]
async fn network_loss_parks_and_resumes_transfers() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let manager = manager(test_config(staging.path()), &storage);
    let recorder = Recorder::new();
    let data = payload(9 * 1024);

    let observer = manager
        .upload_stream(
            "mobile.bin",
            &mut data.as_slice(),
            None,
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .await
        .unwrap();
    storage.release(1);
    eventually("first part", || observer.bytes_transferred() == 4096).await;

    manager.set_network_available(false).unwrap();
    assert_eq!(
        observer.refresh().unwrap().state,
        TransferState::PausedWaitingForNetwork
    );
    assert!(observer.absolute_file_path().exists());

    manager.set_network_available(true).unwrap();
    storage.release_all();
    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    manager.flush_notifications().await;

    let states = recorder.states();
    let parked = states
        .iter()
        .position(|s| *s == TransferState::PausedWaitingForNetwork)
        .unwrap();
    assert_eq!(states[parked + 1], TransferState::ResumedWaiting);
    assert_eq!(storage.count("put_part:mobile.bin:1"), 1);
    assert_eq!(storage.object("mobile.bin").unwrap(), data);
}

#[tokio::test]
async fn offline_transfers_wait_for_the_network() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let manager = manager(test_config(staging.path()), &storage);
    manager.set_network_available(false).unwrap();

    let observer = manager
        .upload_stream("later.txt", &mut &b"queued"[..], None, TransferOptions::new())
        .await
        .unwrap();
    eventually("transfer parked", || {
        observer.state() == TransferState::PausedWaitingForNetwork
    })
    .await;
    assert!(storage.calls().is_empty());

    manager.set_network_available(true).unwrap();
    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
}

#[tokio::test]
async fn recover_resumes_an_interrupted_upload() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let data = payload(9 * 1024);
    let source = staging.path().join("resume.bin");
    std::fs::write(&source, &data).unwrap();

    // State left behind by a process that died after part 1.
    let location = ObjectLocation::new(BUCKET, "resume.bin").unwrap();
    let target = UploadTarget {
        location: location.clone(),
        metadata: ObjectMetadata::default(),
        acl: None,
    };
    let upload_id = storage.create_multipart(&target).await.unwrap();
    let etag = storage
        .put_part(&location, &upload_id, 1, data[..4096].to_vec())
        .await
        .unwrap();

    let store_path = staging.path().join("transfers.json");
    let store = JsonFileStore::open(&store_path).unwrap();
    let mut record = Transfer::new(TransferDirection::Upload, BUCKET, "resume.bin", &source);
    record.total_bytes = Some(data.len() as u64);
    record.parts = plan_parts(data.len() as u64, 4096, 4096);
    record.parts[0].state = stowage_transfer::PartState::Completed;
    record.parts[0].etag = Some(etag);
    record.bytes_transferred = 4096;
    record.multipart_upload_id = Some(upload_id);
    record.state = TransferState::InProgress;
    let id = store.create(record).unwrap();
    drop(store);

    let config = TransferConfig {
        store_path: Some(store_path),
        ..test_config(staging.path())
    };
    let manager = manager(config, &storage);
    let observer = manager.get_transfer(id).unwrap();
    assert_eq!(observer.state(), TransferState::InProgress);

    assert_eq!(manager.recover().unwrap(), 1);
    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);

    assert_eq!(storage.count("put_part:resume.bin:1"), 1);
    assert_eq!(storage.count("put_part:resume.bin:2"), 1);
    assert_eq!(storage.count("create_multipart:resume.bin"), 1);
    assert_eq!(storage.object("resume.bin").unwrap(), data);
    assert_eq!(
        manager
            .get_transfers_with_state(TransferState::Completed)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn queue_runs_in_creation_order() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let config = TransferConfig {
        max_concurrent_transfers: 1,
        ..test_config(staging.path())
    };
    let manager = manager(config, &storage);

    let mut observers = Vec::new();
    for key in ["q1", "q2", "q3"] {
        observers.push(
            manager
                .upload_stream(key, &mut &b"x"[..], None, TransferOptions::new())
                .await
                .unwrap(),
        );
    }
    storage.release_all();
    for observer in &observers {
        assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    }

    let order: Vec<String> = storage
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("put_object:"))
        .collect();
    assert_eq!(order, vec!["put_object:q1", "put_object:q2", "put_object:q3"]);
}

#[tokio::test]
async fn resumed_transfers_rejoin_at_the_back_of_the_queue() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let config = TransferConfig {
        max_concurrent_transfers: 1,
        ..test_config(staging.path())
    };
    let manager = manager(config, &storage);

    let mut observers = Vec::new();
    for key in ["q1", "q2", "q3", "q4"] {
        observers.push(
            manager
                .upload_stream(key, &mut &b"x"[..], None, TransferOptions::new())
                .await
                .unwrap(),
        );
    }
    // q1 holds the only slot; q2 is next in line and q3 still queued.
    eventually("q1 running", || storage.count("put_object:q1") == 1).await;
    for observer in &observers[1..3] {
        manager.pause(observer.id()).unwrap();
        manager.resume(observer.id()).unwrap();
    }

    storage.release_all();
    for observer in &observers {
        assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    }

    let order: Vec<String> = storage
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("put_object:"))
        .collect();
    assert_eq!(
        order,
        vec![
            "put_object:q1",
            "put_object:q4",
            "put_object:q2",
            "put_object:q3"
        ]
    );
}

#[tokio::test]
async fn parts_finishing_out_of_order_keep_progress_increasing() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold_parts();
    let config = TransferConfig {
        part_concurrency: 2,
        ..test_config(staging.path())
    };
    let manager = manager(config, &storage);
    let recorder = Recorder::new();
    let data = payload(9 * 1024);
    let source = staging.path().join("wide.bin");
    std::fs::write(&source, &data).unwrap();

    let observer = manager
        .upload_file(
            "wide.bin",
            &source,
            TransferOptions::new().transfer_listener(recorder.clone()),
        )
        .unwrap();

    eventually("two parts in flight", || {
        storage.count("put_part:wide.bin:1") == 1 && storage.count("put_part:wide.bin:2") == 1
    })
    .await;
    assert_eq!(storage.count("put_part:wide.bin:3"), 0);

    storage.release_part(2);
    eventually("second part recorded", || observer.bytes_transferred() == 4096).await;
    eventually("third part started", || storage.count("put_part:wide.bin:3") == 1).await;
    storage.release_part(3);
    eventually("third part recorded", || observer.bytes_transferred() == 5120).await;
    storage.release_part(1);

    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    manager.flush_notifications().await;

    assert_eq!(storage.peak_parts_in_flight(), 2);
    let progress = recorder.progress();
    assert_eq!(progress, vec![4096, 5120, 9216]);
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "{progress:?}");
    assert_eq!(storage.object("wide.bin").unwrap(), data);
}

#[tokio::test]
async fn at_most_max_concurrent_transfers_run_at_once() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let config = TransferConfig {
        max_concurrent_transfers: 2,
        ..test_config(staging.path())
    };
    let manager = manager(config, &storage);
    let counter = RunningCounter::new();

    let mut observers = Vec::new();
    for key in ["c1", "c2", "c3", "c4", "c5"] {
        observers.push(
            manager
                .upload_stream(
                    key,
                    &mut &b"x"[..],
                    None,
                    TransferOptions::new().transfer_listener(counter.clone()),
                )
                .await
                .unwrap(),
        );
    }

    eventually("two uploads started", || storage.count("put_object:") == 2).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(storage.count("put_object:"), 2);

    storage.release_all();
    for observer in &observers {
        assert_eq!(observer.wait_until_settled().await, TransferState::Completed);
    }
    manager.flush_notifications().await;
    assert_eq!(counter.peak(), 2);
}

#[tokio::test]
async fn usage_errors_are_returned_to_the_caller() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let manager = manager(test_config(staging.path()), &storage);

    assert!(matches!(
        manager.pause(42),
        Err(TransferError::UnknownTransfer(42))
    ));
    let err = manager
        .upload_stream(
            "key",
            &mut &b"x"[..],
            None,
            TransferOptions::new().bucket("Not_A_Bucket"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::Validation(ValidationError::InvalidBucket(_))
    ));
    // Nothing was staged for the rejected request.
    assert_eq!(entries(staging.path()), 0);

    let missing = manager.upload_file("key", &staging.path().join("absent"), TransferOptions::new());
    assert!(matches!(missing, Err(TransferError::Io(_))));
}

#[tokio::test]
async fn options_reach_the_storage_client() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    let manager = manager(test_config(staging.path()), &storage);
    let metadata = ObjectMetadata::default()
        .with_content_type("text/plain")
        .with_user("origin", "test");

    let observer = manager
        .upload_stream(
            "meta.txt",
            &mut &b"meta"[..],
            None,
            TransferOptions::new()
                .bucket("other-bucket")
                .object_metadata(metadata.clone())
                .canned_acl(CannedAcl::PublicRead),
        )
        .await
        .unwrap();
    assert_eq!(observer.bucket(), "other-bucket");
    assert_eq!(observer.wait_until_settled().await, TransferState::Completed);

    let record = observer.refresh().unwrap();
    assert_eq!(record.metadata, metadata);
    assert_eq!(record.acl, Some(CannedAcl::PublicRead));
    assert_eq!(record.object_etag.as_deref().map(|e| e.trim_matches('"')), Some(content_md5(b"meta").as_str()));
}

#[tokio::test]
async fn remove_forgets_the_transfer() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let manager = manager(test_config(staging.path()), &storage);

    let observer = manager
        .upload_stream("tmp.txt", &mut &b"tmp"[..], None, TransferOptions::new())
        .await
        .unwrap();
    let removed = manager.remove(observer.id()).unwrap();

    assert_eq!(removed.state, TransferState::Canceled);
    assert!(!removed.local_path.exists());
    assert!(matches!(
        manager.get_transfer(observer.id()),
        Err(TransferError::UnknownTransfer(_))
    ));
    storage.release_all();
}

#[tokio::test]
async fn shutdown_leaves_records_recoverable() {
    let staging = TempDir::new().unwrap();
    let storage = MockStorage::new();
    storage.hold();
    let manager = manager(test_config(staging.path()), &storage);
    let data = payload(9 * 1024);

    let observer = manager
        .upload_stream("halt.bin", &mut data.as_slice(), None, TransferOptions::new())
        .await
        .unwrap();
    eventually("upload started", || storage.count("put_part:halt.bin:1") == 1).await;

    manager.shutdown().await;

    let record = observer.refresh().unwrap();
    assert_eq!(record.state, TransferState::InProgress);
    assert!(record.local_path.exists());
    assert!(matches!(
        manager
            .upload_stream("late", &mut &b"x"[..], None, TransferOptions::new())
            .await,
        Err(TransferError::ShutDown)
    ));
}
