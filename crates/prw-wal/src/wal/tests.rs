use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::codec::canonicalize;
use crate::proto::WriteRequest;
use crate::testing::{FailingSink, RecordingSink, SlowSink, batch, series};

fn config(dir: &TempDir) -> WalConfig {
    WalConfig::new(dir.path())
}

fn open<S: ExportSink>(config: WalConfig, sink: &Arc<S>) -> Wal<S> {
    Wal::new(Some(config), Arc::clone(sink)).unwrap().unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[test]
fn new_without_config_is_none() {
    let wal = Wal::new(None, Arc::new(RecordingSink::default())).unwrap();
    assert!(wal.is_none());
}

#[tokio::test]
async fn new_with_config_opens_empty_log() {
    let dir = TempDir::new().unwrap();
    let wal = open(config(&dir), &Arc::new(RecordingSink::default()));

    assert_eq!(wal.log().first_index().unwrap(), 1);
    assert_eq!(wal.log().last_index().unwrap(), 0);
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn new_normalizes_config() {
    let dir = TempDir::new().unwrap();
    let wal = open(
        WalConfig {
            buffer_size: 0,
            truncate_frequency: Duration::ZERO,
            ..config(&dir)
        },
        &Arc::new(RecordingSink::default()),
    );

    assert_eq!(wal.config(), &config(&dir));
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn second_wal_on_same_directory_fails() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let first = open(config(&dir), &sink);

    let second = Wal::new(Some(config(&dir)), Arc::clone(&sink));
    assert!(matches!(second, Err(WalError::Log(_))));

    first.stop().await.unwrap();
    let reopened = open(config(&dir), &sink);
    reopened.stop().await.unwrap();
}

#[tokio::test]
async fn persisted_requests_read_back_equal() {
    let dir = TempDir::new().unwrap();
    let wal = open(config(&dir), &Arc::new(RecordingSink::default()));
    let mut requests = vec![
        WriteRequest {
            timeseries: vec![series(&[("ts1l1", "ts1k1")], &[(1.0, 100)])],
        },
        WriteRequest {
            timeseries: vec![
                series(&[("ts2l1", "ts2k1")], &[(2.0, 200)]),
                series(&[("ts1l1", "ts1k1")], &[(1.0, 100)]),
            ],
        },
    ];

    wal.persist_to_wal(&requests).unwrap();

    let first = wal.log().first_index().unwrap();
    let last = wal.log().last_index().unwrap();
    assert_eq!((first, last), (1, 2), "one entry per request");

    let mut read_back: Vec<_> = (first..=last)
        .map(|index| wal.read_request(index).unwrap())
        .collect();
    requests.iter_mut().for_each(canonicalize);
    read_back.iter_mut().for_each(canonicalize);
    assert_eq!(read_back, requests);

    wal.stop().await.unwrap();
}

#[tokio::test]
async fn persist_empty_slice_is_noop() {
    let dir = TempDir::new().unwrap();
    let wal = open(config(&dir), &Arc::new(RecordingSink::default()));

    wal.persist_to_wal(&[]).unwrap();
    assert_eq!(wal.log().last_index().unwrap(), 0);
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn stop_many_times() {
    let dir = TempDir::new().unwrap();
    let wal = open(
        WalConfig {
            truncate_frequency: Duration::from_micros(60),
            buffer_size: 1,
            ..config(&dir)
        },
        &Arc::new(RecordingSink::default()),
    );

    wal.stop().await.unwrap();
    for _ in 0..4 {
        assert!(matches!(wal.stop().await, Err(WalError::AlreadyClosed)));
    }
}

#[tokio::test]
async fn stop_after_run_many_times() {
    let dir = TempDir::new().unwrap();
    let wal = open(config(&dir), &Arc::new(RecordingSink::default()));

    wal.run(&CancellationToken::new()).unwrap();
    wal.stop().await.unwrap();
    for _ in 0..4 {
        assert!(matches!(wal.stop().await, Err(WalError::AlreadyClosed)));
    }
}

#[tokio::test]
async fn run_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let wal = open(config(&dir), &Arc::new(RecordingSink::default()));
    let cancel = CancellationToken::new();

    wal.run(&cancel).unwrap();
    assert!(matches!(wal.run(&cancel), Err(WalError::AlreadyRunning)));
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn operations_after_stop_are_rejected() {
    let dir = TempDir::new().unwrap();
    let wal = open(config(&dir), &Arc::new(RecordingSink::default()));
    wal.stop().await.unwrap();

    assert!(matches!(
        wal.run(&CancellationToken::new()),
        Err(WalError::AlreadyClosed)
    ));
    assert!(matches!(
        wal.persist_to_wal(&[batch(0, 1)]),
        Err(WalError::AlreadyClosed)
    ));
    assert!(matches!(wal.read_request(1), Err(WalError::AlreadyClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_delivered_exactly_once() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let wal = Arc::new(open(
        WalConfig {
            buffer_size: 1,
            truncate_frequency: Duration::from_secs(1),
            ..config(&dir)
        },
        &sink,
    ));
    let cancel = CancellationToken::new();
    wal.run(&cancel).unwrap();

    let producers: Vec<_> = (0..10)
        .map(|i| {
            let wal = Arc::clone(&wal);
            tokio::task::spawn_blocking(move || wal.persist_to_wal(&[batch(i, 100)]))
        })
        .collect();
    for producer in producers {
        producer.await.unwrap().unwrap();
    }

    assert!(
        eventually(|| sink.series_count() >= 1000).await,
        "expected 1000 series, received {}",
        sink.series_count()
    );

    let mut seen = HashSet::new();
    for request in sink.requests() {
        for ts in request.timeseries {
            let key: Vec<_> = ts.labels.into_iter().map(|l| l.value).collect();
            assert!(seen.insert(key.clone()), "series {key:?} delivered twice");
        }
    }
    assert_eq!(seen.len(), 1000);

    cancel.cancel();
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn small_buffer_drains_within_seconds() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let wal = open(
        WalConfig {
            buffer_size: 1,
            truncate_frequency: Duration::from_secs(60),
            ..config(&dir)
        },
        &sink,
    );
    wal.run(&CancellationToken::new()).unwrap();

    for i in 0..10 {
        wal.persist_to_wal(&[batch(i, 1)]).unwrap();
    }

    assert!(eventually(|| sink.requests().len() == 10).await);
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn truncation_never_passes_unexported_entries() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(FailingSink::default());
    let wal = open(
        WalConfig {
            buffer_size: 1,
            truncate_frequency: Duration::from_millis(20),
            ..config(&dir)
        },
        &sink,
    );
    wal.run(&CancellationToken::new()).unwrap();
    wal.persist_to_wal(&[batch(0, 1), batch(1, 1)]).unwrap();

    assert!(eventually(|| sink.calls.load(Ordering::SeqCst) >= 3).await);
    assert_eq!(wal.log().first_index().unwrap(), 1);
    assert_eq!(wal.log().last_index().unwrap(), 2);
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn entries_left_by_failed_exports_survive_restart() {
    let dir = TempDir::new().unwrap();

    let failing = open(config(&dir), &Arc::new(FailingSink::default()));
    failing
        .persist_to_wal(&[batch(0, 2), batch(1, 2)])
        .unwrap();
    failing.stop().await.unwrap();

    let sink = Arc::new(RecordingSink::default());
    let wal = open(config(&dir), &sink);
    wal.run(&CancellationToken::new()).unwrap();

    // The timer's first tick drains whatever the log already holds.
    assert!(eventually(|| sink.requests().len() == 2).await);
    assert_eq!(sink.requests(), vec![batch(0, 2), batch(1, 2)]);
    assert!(eventually(|| wal.log().first_index().unwrap() == 3).await);
    wal.stop().await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_in_flight_cycle() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(SlowSink::default());
    let wal = open(
        WalConfig {
            buffer_size: 1,
            ..config(&dir)
        },
        &sink,
    );
    wal.run(&CancellationToken::new()).unwrap();
    wal.persist_to_wal(&[batch(0, 1)]).unwrap();

    // Give the loop time to pick the entry up and enter the slow sink.
    tokio::time::sleep(Duration::from_millis(50)).await;
    wal.stop().await.unwrap();

    assert_eq!(sink.inner.requests(), vec![batch(0, 1)]);
}

#[tokio::test]
async fn cancelling_parent_token_stops_draining() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let wal = open(
        WalConfig {
            buffer_size: 1,
            ..config(&dir)
        },
        &sink,
    );
    let cancel = CancellationToken::new();
    wal.run(&cancel).unwrap();
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    wal.persist_to_wal(&[batch(0, 1)]).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(sink.requests().is_empty());
    assert_eq!(wal.log().last_index().unwrap(), 1);
    wal.stop().await.unwrap();
}
