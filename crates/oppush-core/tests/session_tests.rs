//! Integration tests for the send-side session against a scripted peer.

mod common;

use std::time::Duration;

use common::{create_temp_dir, create_test_file, random_bytes, FakePeer, PeerScript};
use oppush_core::obex::ResponseCode;
use oppush_core::session::{
    AccessFailurePolicy, ClientSession, SessionHandle, SessionOptions, SessionState,
};
use oppush_core::share::{ClientErrorKind, ServerErrorKind, ShareInfo, ShareQueue, ShareStatus};
use oppush_core::transfer::{EventReceiver, EventSender, TransferEvent};
use oppush_core::transport::ObexTransport;

fn start(
    transport: ObexTransport,
    queue: &ShareQueue,
    options: SessionOptions,
) -> (SessionHandle, EventReceiver) {
    let (events, rx) = EventSender::channel();
    let handle = ClientSession::spawn(transport, queue.clone(), events, options);
    (handle, rx)
}

fn fast_options() -> SessionOptions {
    SessionOptions {
        poll_interval: Duration::from_millis(20),
        ..SessionOptions::default()
    }
}

/// Receive events until one matches `stop_at`, returning all of them.
async fn collect_until(
    rx: &mut EventReceiver,
    stop_at: impl Fn(&TransferEvent) -> bool,
) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed");
        let done = stop_at(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

fn is_complete(event: &TransferEvent) -> bool {
    matches!(event, TransferEvent::SessionComplete)
}

#[tokio::test]
async fn test_single_file_delivered() {
    let dir = create_temp_dir();
    let content = random_bytes(500);
    let path = create_test_file(dir.path(), "scenario.bin", &content);

    let queue = ShareQueue::new();
    let share = ShareInfo::new(&path).into_handle();
    queue.push(share.clone());

    let (transport, peer) = FakePeer::new(PeerScript::AcceptAll)
        .with_max_packet_size(255)
        .spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    let mut events = collect_until(&mut rx, |e| matches!(e, TransferEvent::ShareComplete(_))).await;
    handle.stop();
    events.extend(collect_until(&mut rx, is_complete).await);

    assert!(matches!(events[0], TransferEvent::ConnectSuccess));
    assert!(matches!(events[1], TransferEvent::TransferStart(_, 500)));

    let progress: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::TransferProgress(_, sent) => Some(*sent),
            _ => None,
        })
        .collect();
    assert!(progress.len() > 1, "expected several chunks: {progress:?}");
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&500));

    assert_eq!(share.status(), ShareStatus::Success);
    assert!(queue.is_empty());

    handle.join().await;
    let log = peer.await.unwrap();
    assert_eq!(log.count_hint, Some(1));
    assert!(log.disconnected);
    assert_eq!(log.objects.len(), 1);
    let object = &log.objects[0];
    assert!(object.complete);
    assert_eq!(object.name.as_deref(), Some("scenario.bin"));
    assert_eq!(object.length, Some(500));
    assert_eq!(object.body, content);
}

#[tokio::test]
async fn test_refused_on_first_chunk() {
    let dir = create_temp_dir();
    let path = create_test_file(dir.path(), "refused.txt", b"not welcome");

    let queue = ShareQueue::new();
    let share = ShareInfo::new(&path).into_handle();
    queue.push(share.clone());

    let (transport, _peer) = FakePeer::new(PeerScript::RefuseFirstPut(ResponseCode::Forbidden)).spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    let events = collect_until(&mut rx, |e| matches!(e, TransferEvent::SessionError(_))).await;
    assert!(matches!(
        events.last(),
        Some(TransferEvent::SessionError(Some(s))) if std::sync::Arc::ptr_eq(s, &share)
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TransferEvent::ShareComplete(_))));
    assert_eq!(
        share.status(),
        ShareStatus::ServerError(ServerErrorKind::Forbidden)
    );
    assert!(!queue.contains(&share));

    handle.stop();
    collect_until(&mut rx, is_complete).await;
}

fn progress_of(events: &[TransferEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::TransferProgress(_, sent) => Some(*sent),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_refused_mid_stream() {
    let dir = create_temp_dir();
    let path = create_test_file(dir.path(), "long.bin", &random_bytes(1000));

    let queue = ShareQueue::new();
    let share = ShareInfo::new(&path).into_handle();
    queue.push(share.clone());

    let (transport, peer) = FakePeer::new(PeerScript::RefuseNthPut(4, ResponseCode::Forbidden))
        .with_max_packet_size(255)
        .spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    let events = collect_until(&mut rx, |e| matches!(e, TransferEvent::SessionError(_))).await;
    let progress = progress_of(&events);
    assert!(!progress.is_empty(), "refusal came before any chunk was accepted");
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert!(progress.last().is_some_and(|sent| *sent < 1000));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TransferEvent::ShareComplete(_) | TransferEvent::ShareInterrupted(_))));
    assert_eq!(
        share.status(),
        ShareStatus::ServerError(ServerErrorKind::Forbidden)
    );
    assert!(!queue.contains(&share));

    handle.stop();
    collect_until(&mut rx, is_complete).await;
    handle.join().await;

    let log = peer.await.unwrap();
    assert_eq!(log.aborts, 0);
    assert!(log.objects.iter().all(|o| !o.complete));
}

#[tokio::test]
async fn test_final_answer_downgrades_success() {
    let dir = create_temp_dir();
    let path = create_test_file(dir.path(), "almost.bin", &random_bytes(500));

    let queue = ShareQueue::new();
    let share = ShareInfo::new(&path).into_handle();
    queue.push(share.clone());

    let (transport, _peer) = FakePeer::new(PeerScript::FinalCode(ResponseCode::Forbidden))
        .with_max_packet_size(255)
        .spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    let events = collect_until(&mut rx, |e| matches!(e, TransferEvent::SessionError(_))).await;
    assert_eq!(progress_of(&events).last(), Some(&500));
    assert!(matches!(
        events.last(),
        Some(TransferEvent::SessionError(Some(s))) if std::sync::Arc::ptr_eq(s, &share)
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TransferEvent::ShareComplete(_))));
    assert_eq!(
        share.status(),
        ShareStatus::ServerError(ServerErrorKind::Forbidden)
    );

    handle.stop();
    collect_until(&mut rx, is_complete).await;
}

#[tokio::test]
async fn test_missing_file_marked_failed() {
    let dir = create_temp_dir();
    let queue = ShareQueue::new();
    let share = ShareInfo::new(dir.path().join("absent.txt")).into_handle();
    queue.push(share.clone());

    let (transport, _peer) = FakePeer::new(PeerScript::AcceptAll).spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    collect_until(&mut rx, |e| matches!(e, TransferEvent::AccessFailure(_))).await;
    handle.stop();
    let rest = collect_until(&mut rx, is_complete).await;

    assert!(!rest
        .iter()
        .any(|e| matches!(e, TransferEvent::SessionError(_) | TransferEvent::TransferStart(..))));
    assert_eq!(
        share.status(),
        ShareStatus::ClientError(ClientErrorKind::FileError)
    );
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_missing_file_retained_and_polled() {
    let dir = create_temp_dir();
    let queue = ShareQueue::new();
    let share = ShareInfo::new(dir.path().join("later.txt")).into_handle();
    queue.push(share.clone());

    let (transport, _peer) = FakePeer::new(PeerScript::AcceptAll).spawn();
    let options = SessionOptions {
        poll_interval: Duration::from_millis(50),
        access_failure: AccessFailurePolicy::Retain,
        ..SessionOptions::default()
    };
    let (handle, mut rx) = start(transport, &queue, options);

    let started = tokio::time::Instant::now();
    let mut failures = 0;
    while failures < 3 {
        let events = collect_until(&mut rx, |e| matches!(e, TransferEvent::AccessFailure(_))).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::SessionError(_))));
        failures += 1;
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(share.status(), ShareStatus::Pending);
    assert!(queue.contains(&share));

    handle.stop();
    collect_until(&mut rx, is_complete).await;
}

#[tokio::test]
async fn test_stop_while_waiting_for_remote() {
    let dir = create_temp_dir();
    let path = create_test_file(dir.path(), "stall.bin", &random_bytes(4096));

    let queue = ShareQueue::new();
    let share = ShareInfo::new(&path).into_handle();
    queue.push(share.clone());

    let peer = FakePeer::new(PeerScript::StallAfterBodies(1));
    let stalled = std::sync::Arc::clone(&peer.stalled);
    let (transport, peer_task) = peer.spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());
    let closer = handle.closer();

    tokio::time::timeout(Duration::from_secs(10), stalled.notified())
        .await
        .expect("peer never received a body");
    handle.stop();

    let events = collect_until(&mut rx, is_complete).await;
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            TransferEvent::ConnectSuccess => "connect",
            TransferEvent::TransferStart(..) => "start",
            TransferEvent::ShareInterrupted(_) => "interrupted",
            TransferEvent::SessionComplete => "complete",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["connect", "start", "interrupted", "complete"]);

    assert!(closer.is_closed());
    assert_eq!(share.status(), ShareStatus::Canceled);
    assert_eq!(handle.state(), SessionState::Terminated);

    handle.join().await;
    let log = peer_task.await.unwrap();
    assert!(!log.disconnected);
    assert!(log.objects.iter().all(|o| !o.complete));
}

#[tokio::test]
async fn test_shares_sent_in_insertion_order() {
    let dir = create_temp_dir();
    let queue = ShareQueue::new();
    let shares: Vec<_> = ["first.txt", "second.txt", "third.txt"]
        .iter()
        .map(|name| {
            let path = create_test_file(dir.path(), name, name.as_bytes());
            let share = ShareInfo::new(path).into_handle();
            queue.push(share.clone());
            share
        })
        .collect();

    let (transport, peer) = FakePeer::new(PeerScript::AcceptAll).spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    let mut events = Vec::new();
    let mut completed = 0;
    while completed < shares.len() {
        events.extend(collect_until(&mut rx, |e| matches!(e, TransferEvent::ShareComplete(_))).await);
        completed += 1;
    }
    handle.stop();
    collect_until(&mut rx, is_complete).await;

    let order: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::TransferStart(s, _) => Some(("start", s.id())),
            TransferEvent::ShareComplete(s) => Some(("done", s.id())),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = shares
        .iter()
        .flat_map(|s| [("start", s.id()), ("done", s.id())])
        .collect();
    assert_eq!(order, expected);

    handle.join().await;
    let log = peer.await.unwrap();
    assert_eq!(log.count_hint, Some(3));
    let names: Vec<_> = log.objects.iter().filter_map(|o| o.name.clone()).collect();
    assert_eq!(names, vec!["first.txt", "second.txt", "third.txt"]);
}

#[tokio::test]
async fn test_filename_rewritten_for_matching_destination() {
    let dir = create_temp_dir();
    let path = create_test_file(dir.path(), "holiday.2024.jpg", b"jpeg bytes");

    let queue = ShareQueue::new();
    let share = ShareInfo::new(&path)
        .with_destination("00:04:48:12:34:56")
        .into_handle();
    queue.push(share.clone());

    let (transport, peer) = FakePeer::new(PeerScript::AcceptAll).spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    collect_until(&mut rx, |e| matches!(e, TransferEvent::ShareComplete(_))).await;
    handle.stop();
    collect_until(&mut rx, is_complete).await;
    handle.join().await;

    let log = peer.await.unwrap();
    assert_eq!(log.objects[0].name.as_deref(), Some("holiday_2024.jpg"));
    assert_eq!(log.objects[0].mime_type.as_deref(), Some("image/jpeg"));
}

#[tokio::test]
async fn test_empty_file_delivered() {
    let dir = create_temp_dir();
    let path = create_test_file(dir.path(), "empty.txt", b"");

    let queue = ShareQueue::new();
    let share = ShareInfo::new(&path).into_handle();
    queue.push(share.clone());

    let (transport, peer) = FakePeer::new(PeerScript::AcceptAll).spawn();
    let (handle, mut rx) = start(transport, &queue, fast_options());

    collect_until(&mut rx, |e| matches!(e, TransferEvent::ShareComplete(_))).await;
    assert_eq!(share.status(), ShareStatus::Success);
    handle.stop();
    collect_until(&mut rx, is_complete).await;
    handle.join().await;

    let log = peer.await.unwrap();
    assert_eq!(log.objects.len(), 1);
    assert_eq!(log.objects[0].length, Some(0));
    assert!(log.objects[0].body.is_empty());
}
