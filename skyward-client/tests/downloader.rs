//! Download engine against a local HTTP server.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{payload_bytes, serve, Fixture, PAYLOAD_LEN};
use skyward_client::update::{DownloadEngine, DownloadError, DownloadStatus, RetryPolicy};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 50,
    }
}

fn engine() -> DownloadEngine {
    DownloadEngine::new(reqwest::Client::new(), fast_retry())
}

#[tokio::test]
async fn test_resume_from_offset_yields_identical_file() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    let base = serve(fixture.clone()).await;
    let url = format!("{}/payload.zip", base);
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();

    for (i, offset) in [0, 1, 4095, PAYLOAD_LEN / 2, PAYLOAD_LEN - 1]
        .into_iter()
        .enumerate()
    {
        let dest = dir.path().join(format!("ota-{}.zip", i));
        std::fs::write(&dest, &fixture.payload[..offset]).unwrap();

        let state = engine
            .start(&url, &dest, PAYLOAD_LEN as u64)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(state.status, DownloadStatus::Completed);
        assert_eq!(state.bytes_received, PAYLOAD_LEN as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), fixture.payload);

        let expected = if offset == 0 { None } else { Some(offset as u64) };
        assert_eq!(fixture.ranges().last().copied(), Some(expected));
    }
}

#[tokio::test]
async fn test_server_ignoring_range_restarts_from_zero() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    fixture.honour_range.store(false, Ordering::SeqCst);
    let base = serve(fixture.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");
    std::fs::write(&dest, &fixture.payload[..1000]).unwrap();

    let state = engine()
        .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(state.status, DownloadStatus::Completed);
    assert_eq!(fixture.ranges(), vec![Some(1000)]);
    assert_eq!(std::fs::read(&dest).unwrap(), fixture.payload);
}

#[tokio::test]
async fn test_complete_file_needs_no_request() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    let base = serve(fixture.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");
    std::fs::write(&dest, &fixture.payload).unwrap();

    let state = engine()
        .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(state.status, DownloadStatus::Completed);
    assert!(fixture.ranges().is_empty());
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    fixture.fail_next.store(2, Ordering::SeqCst);
    let base = serve(fixture.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");

    let state = engine()
        .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(state.status, DownloadStatus::Completed);
    assert_eq!(fixture.ranges().len(), 3);
    assert_eq!(std::fs::read(&dest).unwrap(), fixture.payload);
}

#[tokio::test]
async fn test_persistent_errors_exhaust_retries() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    fixture.fail_next.store(usize::MAX, Ordering::SeqCst);
    let base = serve(fixture.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");

    let err = engine()
        .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(fixture.ranges().len(), 3);
}

#[tokio::test]
async fn test_size_mismatch_is_fatal() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    let base = serve(fixture.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");

    let err = engine()
        .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64 + 10)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::SizeMismatch { .. }));
    assert_eq!(fixture.ranges().len(), 1);
}

#[tokio::test]
async fn test_cancel_keeps_partial_file() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    fixture.throttle(4096, Duration::from_millis(10));
    let base = serve(fixture.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");
    let engine = engine();

    let task = engine
        .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while task.state().bytes_received == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no progress");

    assert!(matches!(
        engine
            .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64)
            .await,
        Err(DownloadError::AlreadyRunning(_))
    ));

    assert!(engine.cancel(&dest));
    let state = task.wait().await.unwrap();
    assert_eq!(state.status, DownloadStatus::Cancelled);
    assert!(state.bytes_received < PAYLOAD_LEN as u64);
    let on_disk = std::fs::read(&dest).unwrap();
    assert_eq!(on_disk.len() as u64, state.bytes_received);
    assert_eq!(on_disk[..], fixture.payload[..on_disk.len()]);

    // Nothing left to cancel.
    assert!(!engine.cancel(&dest));
}

#[tokio::test]
async fn test_partial_file_seeds_progress() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    let base = serve(fixture.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");
    std::fs::write(&dest, &fixture.payload[..PAYLOAD_LEN / 2]).unwrap();

    let task = engine()
        .start(&format!("{}/payload.zip", base), &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap();
    assert_eq!(task.state().bytes_received, PAYLOAD_LEN as u64 / 2);
    assert_eq!(task.state().status, DownloadStatus::Pending);

    let state = task.wait().await.unwrap();
    assert_eq!(state.bytes_received, PAYLOAD_LEN as u64);
}

#[tokio::test]
async fn test_finished_download_can_start_again() {
    let fixture = Fixture::new(payload_bytes(PAYLOAD_LEN));
    let base = serve(fixture.clone()).await;
    let url = format!("{}/payload.zip", base);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("ota.zip");
    let engine = engine();

    engine
        .start(&url, &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(engine.state(&dest).unwrap().status, DownloadStatus::Completed);

    let state = engine
        .start(&url, &dest, PAYLOAD_LEN as u64)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state.status, DownloadStatus::Completed);
    // The file on disk is already complete.
    assert_eq!(fixture.ranges().len(), 1);
}
