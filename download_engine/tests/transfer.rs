mod support;

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use download_engine::errors::TransferError;
use download_engine::task::{TaskId, TransferEvent};
use download_engine::transfer::{EventSink, StopSignal, TransferContext, TransferOptions, transfer};
use support::{
    Always416, FlakyFile, IgnoresRange, RangeFile, RejectsRanges, ShiftedRange, ShortTotal,
    body_of, range_offset,
};

fn test_options() -> TransferOptions {
    TransferOptions {
        progress_interval: Duration::from_millis(25),
        ..TransferOptions::default()
    }
}

fn context(url: &str, file_path: PathBuf) -> TransferContext {
    TransferContext {
        url: url.to_string(),
        file_path,
        user_agent: None,
        referrer: None,
        expected_total: None,
    }
}

/// Run one attempt to the end and return every event it emitted, in order.
async fn collect(
    ctx: TransferContext,
    options: TransferOptions,
    stop: StopSignal,
) -> Vec<TransferEvent> {
    let (sender, mut receiver) = mpsc::channel(64);
    let sink = EventSink::new(TaskId::from_url(&ctx.url), 1, sender);
    let task = tokio::spawn(transfer(Client::new(), ctx, options, stop, sink));
    let mut events = Vec::new();
    while let Some(delivery) = receiver.recv().await {
        events.push(delivery.event);
    }
    task.await.unwrap();
    events
}

fn terminal_count(events: &[TransferEvent]) -> usize {
    events.iter().filter(|event| event.ends_attempt()).count()
}

#[tokio::test]
async fn downloads_whole_file_in_order() {
    let server = MockServer::start().await;
    let body = body_of(64 * 1024);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert!(matches!(events.first(), Some(TransferEvent::Preparing)));
    assert!(matches!(
        events.get(1),
        Some(TransferEvent::Metadata(meta)) if meta.total_bytes == Some(body.len() as u64)
    ));
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Completed { downloaded_bytes, .. })
            if *downloaded_bytes == body.len() as u64
    ));

    let mut previous = 0;
    for event in &events {
        if let TransferEvent::Downloading {
            downloaded_bytes, ..
        } = event
        {
            assert!(*downloaded_bytes >= previous, "progress went backwards");
            previous = *downloaded_bytes;
        }
    }

    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), body);
}

#[tokio::test]
async fn resumes_from_existing_bytes() {
    let server = MockServer::start().await;
    let body = body_of(100_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    tokio::fs::write(&file_path, &body[..40_000]).await.unwrap();

    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert!(matches!(
        events.last(),
        Some(TransferEvent::Completed { downloaded_bytes, .. }) if *downloaded_bytes == 100_000
    ));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(range_offset(&requests[0]), Some(40_000));
    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), body);
}

#[tokio::test]
async fn restarts_when_server_ignores_resume() {
    let server = MockServer::start().await;
    let body = body_of(50_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(IgnoresRange::new(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    // Stale bytes from some earlier life; the server replays from zero so
    // these must be thrown away, not appended to.
    tokio::fs::write(&file_path, vec![0xAB; 20_000]).await.unwrap();

    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert!(matches!(events.last(), Some(TransferEvent::Completed { .. })));
    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), body);
}

#[tokio::test]
async fn short_circuits_when_already_complete() {
    let server = MockServer::start().await;
    let body = body_of(30_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(IgnoresRange::new(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    tokio::fs::write(&file_path, &body).await.unwrap();

    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    // Preparing, Metadata, Completed and nothing else: the body is not
    // downloaded a second time.
    assert_eq!(events.len(), 3);
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Completed { downloaded_bytes, .. }) if *downloaded_bytes == 30_000
    ));
    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), body);
}

#[tokio::test]
async fn completes_via_416_when_server_has_no_more() {
    let server = MockServer::start().await;
    let body = body_of(30_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    tokio::fs::write(&file_path, &body).await.unwrap();

    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Completed { downloaded_bytes, .. }) if *downloaded_bytes == 30_000
    ));
    assert!(!events
        .iter()
        .any(|event| matches!(event, TransferEvent::Downloading { .. })));
}

#[tokio::test]
async fn falls_back_to_full_download_after_416() {
    let server = MockServer::start().await;
    let body = body_of(50_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RejectsRanges::new(body.clone()))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    tokio::fs::write(&file_path, vec![0xCD; 1_000]).await.unwrap();

    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(TransferEvent::Completed { .. })));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(range_offset(&requests[0]), Some(1_000));
    assert_eq!(range_offset(&requests[1]), None);
    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), body);
}

#[tokio::test]
async fn gives_up_when_ranges_never_work() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(Always416 { total: 50_000 })
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    tokio::fs::write(&file_path, vec![0xCD; 1_000]).await.unwrap();

    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed(TransferError::InvalidRangeResponse(_)))
    ));
}

#[tokio::test]
async fn rejects_replies_from_the_wrong_offset() {
    let server = MockServer::start().await;
    let body = body_of(50_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(ShiftedRange::new(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    tokio::fs::write(&file_path, &body[..1_000]).await.unwrap();

    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed(TransferError::InvalidRangeResponse(_)))
    ));
    // The suspect body was never written over the good prefix.
    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), &body[..1_000]);
}

#[tokio::test]
async fn fails_when_total_is_misreported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(ShortTotal::new(body_of(30_000), 100_000))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    let events = collect(
        context(&format!("{}/data.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed(TransferError::SizeMismatch {
            expected: 100_000,
            actual: 30_000,
        }))
    ));
    // Received bytes survive for the next attempt.
    let written = tokio::fs::metadata(&file_path).await.unwrap().len();
    assert_eq!(written, 30_000);
}

#[tokio::test]
async fn http_failures_surface_the_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let events = collect(
        context(
            &format!("{}/gone.bin", server.uri()),
            dir.path().join("gone.bin"),
        ),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed(TransferError::HttpStatus(404)))
    ));
}

#[tokio::test]
async fn connection_refused_is_a_network_error() {
    // Grab a port nothing is listening on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let dir = tempfile::tempdir().unwrap();
    let events = collect(
        context(
            &format!("http://127.0.0.1:{}/data.bin", port),
            dir.path().join("data.bin"),
        ),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed(TransferError::NetworkUnreachable(_)))
    ));
}

#[tokio::test]
async fn pauses_at_a_chunk_boundary_and_resumes() {
    let server = MockServer::start().await;
    let body = body_of(6 * 1024 * 1024);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeFile::with_delay(
            body.clone(),
            Duration::from_millis(300),
        ))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    let url = format!("{}/data.bin", server.uri());

    let (sender, mut receiver) = mpsc::channel(64);
    let sink = EventSink::new(TaskId::from_url(&url), 1, sender);
    let stop = StopSignal::new();
    let task = tokio::spawn(transfer(
        Client::new(),
        context(&url, file_path.clone()),
        test_options(),
        stop.clone(),
        sink,
    ));
    // The pause lands while the response is still held back, so the
    // transfer stops at the first chunk it writes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.request_pause();

    let mut events = Vec::new();
    while let Some(delivery) = receiver.recv().await {
        events.push(delivery.event);
    }
    task.await.unwrap();

    let Some(TransferEvent::Paused {
        downloaded_bytes,
        total_bytes,
    }) = events.last()
    else {
        panic!("expected a paused attempt, got {:?}", events.last());
    };
    assert!(*downloaded_bytes > 0);
    assert!(*downloaded_bytes < body.len() as u64);
    assert_eq!(*total_bytes, Some(body.len() as u64));
    // Everything reported was flushed.
    let on_disk = tokio::fs::metadata(&file_path).await.unwrap().len();
    assert_eq!(on_disk, *downloaded_bytes);

    // A fresh attempt picks up where the pause left off.
    let events = collect(
        context(&url, file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Completed { downloaded_bytes, .. })
            if *downloaded_bytes == body.len() as u64
    ));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(range_offset(&requests[1]), Some(on_disk));
    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), body);
}

#[tokio::test]
async fn cancel_interrupts_a_pending_request() {
    let server = MockServer::start().await;
    let body = body_of(1024 * 1024);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeFile::with_delay(
            body.clone(),
            Duration::from_millis(5_000),
        ))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    let url = format!("{}/data.bin", server.uri());

    let (sender, mut receiver) = mpsc::channel(64);
    let sink = EventSink::new(TaskId::from_url(&url), 1, sender);
    let stop = StopSignal::new();
    let task = tokio::spawn(transfer(
        Client::new(),
        context(&url, file_path.clone()),
        test_options(),
        stop.clone(),
        sink,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled_at = std::time::Instant::now();
    stop.request_cancel(false);

    let mut events = Vec::new();
    while let Some(delivery) = receiver.recv().await {
        events.push(delivery.event);
    }
    task.await.unwrap();

    // The cancel cuts through the response wait instead of sitting out the
    // full five second delay.
    assert!(cancelled_at.elapsed() < Duration::from_millis(1_000));
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(TransferEvent::Cancelled)));
}

#[tokio::test]
async fn cancel_can_delete_the_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeFile::with_delay(
            body_of(1024 * 1024),
            Duration::from_millis(5_000),
        ))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    // Leftovers from an earlier attempt.
    tokio::fs::write(&file_path, vec![0u8; 8_192]).await.unwrap();
    let url = format!("{}/data.bin", server.uri());

    let (sender, mut receiver) = mpsc::channel(64);
    let sink = EventSink::new(TaskId::from_url(&url), 1, sender);
    let stop = StopSignal::new();
    let task = tokio::spawn(transfer(
        Client::new(),
        context(&url, file_path.clone()),
        test_options(),
        stop.clone(),
        sink,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.request_cancel(true);

    let mut events = Vec::new();
    while let Some(delivery) = receiver.recv().await {
        events.push(delivery.event);
    }
    task.await.unwrap();

    assert!(matches!(events.last(), Some(TransferEvent::Cancelled)));
    assert!(tokio::fs::metadata(&file_path).await.is_err());
}

#[tokio::test]
async fn attempt_deadline_fails_the_transfer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeFile::with_delay(
            body_of(1024),
            Duration::from_secs(30),
        ))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let options = TransferOptions {
        attempt_timeout: Some(Duration::from_millis(300)),
        ..test_options()
    };
    let started = std::time::Instant::now();
    let events = collect(
        context(
            &format!("{}/data.bin", server.uri()),
            dir.path().join("data.bin"),
        ),
        options,
        StopSignal::new(),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed(TransferError::Timeout(_)))
    ));
}

#[tokio::test]
async fn zero_byte_files_complete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty.bin"))
        .respond_with(RangeFile::new(Vec::new()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("empty.bin");
    let events = collect(
        context(&format!("{}/empty.bin", server.uri()), file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;

    assert!(matches!(
        events.last(),
        Some(TransferEvent::Completed {
            downloaded_bytes: 0,
            ..
        })
    ));
    assert_eq!(tokio::fs::metadata(&file_path).await.unwrap().len(), 0);
}

#[tokio::test]
async fn failed_prefix_is_kept_and_resumable() {
    let server = MockServer::start().await;
    let body = body_of(120_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(FlakyFile::new(body.clone(), 45_000))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    let url = format!("{}/data.bin", server.uri());

    let events = collect(
        context(&url, file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed(TransferError::SizeMismatch {
            expected: 120_000,
            actual: 45_000,
        }))
    ));
    assert_eq!(
        tokio::fs::metadata(&file_path).await.unwrap().len(),
        45_000
    );

    let events = collect(
        context(&url, file_path.clone()),
        test_options(),
        StopSignal::new(),
    )
    .await;
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Completed { downloaded_bytes, .. }) if *downloaded_bytes == 120_000
    ));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(range_offset(&requests[1]), Some(45_000));
    assert_eq!(tokio::fs::read(&file_path).await.unwrap(), body);
}
