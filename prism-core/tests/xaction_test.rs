mod common;

use common::{drain, feed, service, wait_for, Call, RecordingHost};
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::CONTENT_LENGTH;
use prism_core::{
    AdapterConfig, AdapterError, ContentSource, HookConfig, HookDispatch, OperationState,
};
use std::io::{Read, Write};
use std::time::Duration;

#[tokio::test]
async fn test_buffered_round_trip() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());

    xaction.begin().unwrap();
    assert_eq!(xaction.receiving_vb(), OperationState::On);
    let calls = host.calls();
    assert_eq!(calls[0], Call::RequestVirginBody);
    match &calls[1] {
        Call::SupplyAdapted(message) => {
            assert!(message.has_body);
            assert!(message.headers.get(CONTENT_LENGTH).is_none());
        }
        other => panic!("expected adapted message, got {:?}", other),
    }

    xaction.request_adapted_body().unwrap();
    assert_eq!(xaction.sending_ab(), OperationState::On);

    feed(&host, &xaction, &[b'x'; 100]);
    feed(&host, &xaction, b"");
    assert_eq!(host.count(&Call::AdaptedAvailable), 2);

    let chunks = drain(&xaction);
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].len(), 100);
    assert!(chunks[1].is_empty());

    xaction.consume_adapted_content(100).unwrap();
    assert_eq!(xaction.consumed_bytes(), 100);

    xaction.note_virgin_done(true).unwrap();
    assert_eq!(xaction.receiving_vb(), OperationState::Complete);
    assert_eq!(xaction.sending_ab(), OperationState::Complete);
    assert_eq!(host.count(&Call::StopVirginBody), 1);
    assert_eq!(host.count(&Call::AdaptedDone(true)), 1);
    assert!(drain(&xaction).is_empty());

    xaction.stop();
    drop(xaction);
    assert_eq!(host.count(&Call::Aborted), 0);
    assert_eq!(service.metrics().snapshot().virgin_bytes, 100);
}

#[tokio::test]
async fn test_message_without_body_makes_one_host_call() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::without_body();
    let xaction = service.make_xaction(host.handle());

    xaction.begin().unwrap();

    let calls = host.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(calls[0], Call::SupplyAdapted(ref message) if !message.has_body));
    assert_eq!(xaction.receiving_vb(), OperationState::Never);
    assert_eq!(xaction.sending_ab(), OperationState::Never);
    assert!(!xaction.is_host_attached());

    xaction.stop();
    drop(xaction);
    assert_eq!(host.call_count(), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_silences_host() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    let before = host.call_count();

    xaction.stop();
    xaction.stop();
    assert!(!xaction.is_host_attached());

    // Late host-side calls fail without reaching the host
    host.push(b"late");
    assert!(xaction.note_virgin_available().is_err());
    assert!(xaction.note_virgin_done(true).is_err());

    drop(xaction);
    assert_eq!(host.call_count(), before);
    assert_eq!(service.metrics().snapshot().xactions_aborted, 0);
}

#[tokio::test]
async fn test_teardown_without_stop_aborts_once() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();

    drop(xaction);
    assert_eq!(host.count(&Call::Aborted), 1);
    assert_eq!(service.metrics().snapshot().xactions_aborted, 1);
}

#[tokio::test]
async fn test_precondition_violation_aborts_transaction() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());

    let err = xaction.note_virgin_done(true).unwrap_err();
    assert!(matches!(err, AdapterError::Precondition(_)));
    assert_eq!(host.calls(), vec![Call::Aborted]);
    assert!(!xaction.is_host_attached());

    // The handle is gone, so nothing else reaches the host
    assert!(xaction.begin().is_err());
    drop(xaction);
    assert_eq!(host.call_count(), 1);
}

#[tokio::test]
async fn test_adapted_content_requires_sending() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();

    xaction.decline_adapted_body().unwrap();
    assert_eq!(xaction.sending_ab(), OperationState::Never);
    assert_eq!(xaction.receiving_vb(), OperationState::Complete);
    assert_eq!(host.count(&Call::StopVirginBody), 1);

    assert!(xaction.adapted_content(0, 10).is_err());
    assert_eq!(host.count(&Call::Aborted), 1);
}

#[tokio::test]
async fn test_late_adapted_body_request_completes() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();

    feed(&host, &xaction, b"early");
    xaction.note_virgin_done(false).unwrap();
    assert_eq!(host.count(&Call::AdaptedAvailable), 0);
    assert_eq!(host.count(&Call::AdaptedDone(false)), 0);

    xaction.request_adapted_body().unwrap();
    assert_eq!(host.count(&Call::AdaptedAvailable), 1);
    assert_eq!(host.count(&Call::AdaptedDone(false)), 1);
    assert_eq!(xaction.sending_ab(), OperationState::Complete);
    assert_eq!(&drain(&xaction)[0][..], b"early");
}

#[tokio::test]
async fn test_request_more_and_stop_making() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();

    xaction.request_more().unwrap();
    assert_eq!(host.count(&Call::RequestMoreVirginBody), 1);

    xaction.stop_adapted_body().unwrap();
    assert_eq!(xaction.sending_ab(), OperationState::Complete);
    assert_eq!(host.count(&Call::StopVirginBody), 1);

    // Virgin reception is over, so there is nothing more to ask for
    xaction.request_more().unwrap();
    assert_eq!(host.count(&Call::RequestMoreVirginBody), 1);
    assert_eq!(host.count(&Call::AdaptedDone(true)), 0);
}

#[tokio::test]
async fn test_budget_exhaustion_queues_empty_chunk() {
    let config = AdapterConfig {
        buffer_memory_limit: 8,
        ..Default::default()
    };
    let service = service(config);
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();

    feed(&host, &xaction, b"0123456789");
    feed(&host, &xaction, b"abc");

    let chunks = drain(&xaction);
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].is_empty());
    assert_eq!(&chunks[1][..], b"abc");
    assert_eq!(service.metrics().snapshot().budget_rejections, 1);
    assert_eq!(service.admin_state().budget.current_usage(), 3);

    drop(xaction);
    assert_eq!(service.admin_state().budget.current_usage(), 0);
}

#[tokio::test]
async fn test_hook_source_falls_back_to_buffers() {
    let config = AdapterConfig {
        content_source: ContentSource::Hook,
        ..Default::default()
    };
    let service = service(config);
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();

    feed(&host, &xaction, b"kept");
    feed(&host, &xaction, b"also kept");

    let chunks = drain(&xaction);
    assert_eq!(chunks.len(), 2);
    assert_eq!(&chunks[0][..], b"kept");
    // The failed hook is asked only once
    assert_eq!(service.metrics().snapshot().hook_failures, 1);
}

#[tokio::test]
async fn test_inline_analyzer_batches_content() {
    let config = AdapterConfig {
        hook: HookConfig::Analyzer { min_chunk: 4 },
        content_source: ContentSource::Hook,
        ..Default::default()
    };
    let service = service(config);
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();

    feed(&host, &xaction, b"ab");
    assert!(xaction.adapted_content(0, 64).unwrap().is_none());
    feed(&host, &xaction, b"cdef");
    assert_eq!(&xaction.adapted_content(0, 64).unwrap().unwrap()[..], b"abcdef");

    feed(&host, &xaction, b"g");
    xaction.note_virgin_done(true).unwrap();
    assert_eq!(host.count(&Call::AdaptedDone(true)), 1);
    assert_eq!(&drain(&xaction)[0][..], b"g");
}

#[tokio::test]
async fn test_undecodable_body_falls_back_to_virgin_content() {
    let config = AdapterConfig {
        hook: HookConfig::Analyzer { min_chunk: 4 },
        content_source: ContentSource::Hook,
        ..Default::default()
    };
    let service = service(config);
    // Labelled gzip, but plain text on the wire
    let host = RecordingHost::gzip_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();

    feed(&host, &xaction, b"this body was never compressed, ");
    feed(&host, &xaction, b"whatever the header says");
    xaction.note_virgin_done(true).unwrap();

    let body: Vec<u8> = drain(&xaction).concat();
    assert_eq!(
        body,
        b"this body was never compressed, whatever the header says".to_vec()
    );
    assert_eq!(host.count(&Call::AdaptedDone(true)), 1);
    assert_eq!(host.count(&Call::Aborted), 0);
    assert!(service.metrics().snapshot().hook_failures >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_dump_and_drain() {
    let dir = tempfile::tempdir().unwrap();
    let config = AdapterConfig {
        hook: HookConfig::Dump {
            dir: dir.path().to_path_buf(),
        },
        dispatch: HookDispatch::Background,
        ..Default::default()
    };
    let service = service(config);
    assert!(service.makes_async_xactions());

    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();

    // A unit is working, so idling is capped at the poll delay
    assert_eq!(service.scheduler().working_count(), 1);
    assert_eq!(
        service.suspend(Duration::from_secs(5)),
        Duration::from_millis(300)
    );

    feed(&host, &xaction, b"hello ");
    feed(&host, &xaction, b"world");
    xaction.note_virgin_done(true).unwrap();
    assert_eq!(host.count(&Call::AdaptedDone(true)), 1);

    wait_for(|| service.scheduler().waiting_count() == 1).await;
    assert_eq!(service.scheduler().working_count(), 0);
    assert_eq!(service.suspend(Duration::from_secs(5)), Duration::ZERO);

    assert_eq!(service.resume(), 1);
    assert_eq!(host.count(&Call::Resume), 1);
    assert_eq!(service.scheduler().waiting_count(), 0);

    let dump = std::fs::read(dir.path().join(format!("response-{}.dump", xaction.id()))).unwrap();
    assert_eq!(dump, b"hello world");
    assert_eq!(drain(&xaction).len(), 2);

    xaction.stop();
    assert_eq!(service.metrics().snapshot().workers_launched, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_background_transaction_settles_work() {
    let config = AdapterConfig {
        dispatch: HookDispatch::Background,
        ..Default::default()
    };
    let service = service(config);
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    feed(&host, &xaction, b"partial");
    let before = host.call_count();

    xaction.stop();
    drop(xaction);

    wait_for(|| service.scheduler().working_count() == 0).await;
    assert_eq!(service.scheduler().waiting_count(), 0);
    assert_eq!(service.resume(), 0);
    assert_eq!(host.call_count(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_analyzer_reencodes_gzip() {
    let body = b"adaptation keeps the content intact. ".repeat(40);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body).unwrap();
    let compressed = encoder.finish().unwrap();

    let config = AdapterConfig {
        hook: HookConfig::Analyzer { min_chunk: 128 },
        dispatch: HookDispatch::Background,
        content_source: ContentSource::Hook,
        ..Default::default()
    };
    let service = service(config);
    let host = RecordingHost::gzip_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();

    for chunk in compressed.chunks(50) {
        feed(&host, &xaction, chunk);
    }
    xaction.note_virgin_done(true).unwrap();

    // Completion is reported once the unit has handed back
    wait_for(|| {
        service.resume();
        host.count(&Call::AdaptedDone(true)) == 1
    })
    .await;
    assert!(!xaction.has_pending_work());

    let adapted: Vec<u8> = drain(&xaction).concat();
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(&adapted[..])
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, body);

    xaction.stop();
    assert_eq!(host.count(&Call::AdaptedDone(true)), 1);
}
