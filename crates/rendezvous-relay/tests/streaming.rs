#![expect(clippy::unwrap_used, reason = "test code panics on errors")]

//! End-to-end piping: pairing in both orders, byte accounting, failure
//! classification, backpressure, and the `AsyncRead`/`AsyncWrite` adapters.

use std::io;
use std::time::Duration;

use proptest::prelude::*;
use rendezvous_relay::{
    DestinationReceiver, DestinationStream, EventKind, Session, SessionEvent, SessionManager, SessionManagerConfig,
    SessionState, SourceStream, DEFAULT_CHANNEL_CAPACITY,
};
use test_utils::framed_payload;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures every lifecycle event of `session` in an mpsc channel.
fn observe(session: &Session) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    for kind in [
        EventKind::Finished,
        EventKind::Timeout,
        EventKind::Error,
        EventKind::ClientError,
    ] {
        let tx = tx.clone();
        session.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }

    rx
}

/// Waits for exactly one lifecycle event, panicking if a second one shows up
/// within a short grace period.
async fn expect_single_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    let event = timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("waiting for lifecycle event")
        .expect("event channel closed before any event");

    match timeout(Duration::from_millis(50), rx.recv()).await {
        Ok(Some(extra)) => panic!("received a second lifecycle event: {extra:?}"),
        _ => event,
    }
}

/// Drives the consumer side: collects blocks until the data channel closes,
/// reports drain-complete, and returns the received bytes.
fn drive_destination(mut receiver: DestinationReceiver) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(block) = receiver.recv().await {
            received.extend_from_slice(&block);
        }
        receiver.drained();
        received
    })
}

#[tokio::test]
async fn streams_source_bytes_to_destination() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (source_tx, source) = SourceStream::channel(8);
    let (destination, receiver) = DestinationStream::channel(8);

    session.register_source(source).unwrap();
    assert_eq!(session.state(), SessionState::SourceConnected);
    session.register_destination(destination).unwrap();
    assert_eq!(session.state(), SessionState::Streaming);

    let consumer = drive_destination(receiver);

    source_tx.data("abc").await.unwrap();
    source_tx.data("def").await.unwrap();
    source_tx.eof().await.unwrap();

    assert_eq!(consumer.await.unwrap(), b"abcdef");

    let event = expect_single_event(&mut events).await;
    assert!(matches!(event, SessionEvent::Finished));
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.bytes_transferred(), 6);
    assert!(!session.is_active());
    assert!(manager.get_session(session.id()).is_none());
}

#[tokio::test]
async fn pairs_in_reverse_registration_order() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (destination, receiver) = DestinationStream::channel(8);
    session.register_destination(destination).unwrap();
    assert_eq!(session.state(), SessionState::DestinationConnected);

    tokio::time::sleep(Duration::from_millis(10)).await;

    let (source_tx, source) = SourceStream::channel(8);
    session.register_source(source).unwrap();
    assert_eq!(session.state(), SessionState::Streaming);

    let consumer = drive_destination(receiver);

    source_tx.data("abcdef").await.unwrap();
    source_tx.eof().await.unwrap();

    assert_eq!(consumer.await.unwrap(), b"abcdef");

    let event = expect_single_event(&mut events).await;
    assert!(matches!(event, SessionEvent::Finished));
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.bytes_transferred(), 6);
}

#[tokio::test]
async fn classifies_source_error_while_streaming() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (source_tx, source) = SourceStream::channel(8);
    let (destination, mut receiver) = DestinationStream::channel(8);
    session.register_source(source).unwrap();
    session.register_destination(destination).unwrap();

    // Collect whatever arrives before the failure; the data channel closes
    // without a drain signal once the session tears the destination down.
    let consumer = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(block) = receiver.recv().await {
            received.extend_from_slice(&block);
        }
        received
    });

    source_tx.data("abc").await.unwrap();
    source_tx.error(io::Error::other("blahdeblah")).await.unwrap();

    let event = expect_single_event(&mut events).await;
    match event {
        SessionEvent::Error(error) => assert_eq!(error.to_string(), "Source error: blahdeblah"),
        other => panic!("unexpected event: {other:?}"),
    }

    assert_eq!(session.state(), SessionState::SourceError);
    assert!(!session.is_active());
    assert_eq!(session.bytes_transferred(), 3);
    assert_eq!(consumer.await.unwrap(), b"abc");
}

#[tokio::test]
async fn classifies_source_premature_close() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (source_tx, source) = SourceStream::channel(8);
    let (destination, _receiver) = DestinationStream::channel(8);
    session.register_source(source).unwrap();
    session.register_destination(destination).unwrap();

    drop(source_tx);

    let event = expect_single_event(&mut events).await;
    match event {
        SessionEvent::Error(error) => assert_eq!(error.to_string(), "Source disconnected before end"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::SourceDisconnected);
}

#[tokio::test]
async fn classifies_destination_error() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (_source_tx, source) = SourceStream::channel(8);
    let (destination, receiver) = DestinationStream::channel(8);
    session.register_source(source).unwrap();
    session.register_destination(destination).unwrap();

    receiver.error(io::Error::other("disk full"));

    let event = expect_single_event(&mut events).await;
    match event {
        SessionEvent::Error(error) => assert_eq!(error.to_string(), "Destination error: disk full"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::DestinationError);
}

#[tokio::test]
async fn classifies_destination_premature_close() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (source_tx, source) = SourceStream::channel(8);
    let (destination, receiver) = DestinationStream::channel(8);
    session.register_source(source).unwrap();
    session.register_destination(destination).unwrap();

    drop(receiver);

    let event = expect_single_event(&mut events).await;
    match event {
        SessionEvent::Error(error) => assert_eq!(error.to_string(), "Destination disconnected before end"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::DestinationDisconnected);

    // The source was torn down along with the session.
    assert!(source_tx.data("late").await.is_err());
}

#[tokio::test]
async fn early_drain_counts_as_disconnect() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (_source_tx, source) = SourceStream::channel(8);
    let (destination, receiver) = DestinationStream::channel(8);
    session.register_source(source).unwrap();
    session.register_destination(destination).unwrap();

    // Drain-complete before end-of-stream: the consumer went away early.
    receiver.drained();

    let event = expect_single_event(&mut events).await;
    match event {
        SessionEvent::Error(error) => assert_eq!(error.to_string(), "Destination disconnected before end"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::DestinationDisconnected);
}

#[tokio::test]
async fn emits_exactly_one_event_when_signals_race() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (source_tx, source) = SourceStream::channel(8);
    let (destination, receiver) = DestinationStream::channel(8);
    session.register_source(source).unwrap();
    session.register_destination(destination).unwrap();

    // Fail both sides back to back; whichever signal wins, only one event
    // may come out.
    drop(receiver);
    let _ = source_tx.error(io::Error::other("boom")).await;

    let event = expect_single_event(&mut events).await;
    assert!(matches!(event, SessionEvent::Error(_)));
    assert!(session.state().is_terminal());
    assert!(!session.is_active());
}

#[tokio::test]
async fn backpressure_suspends_the_source() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (source_tx, source) = SourceStream::channel(1);
    let (destination, receiver) = DestinationStream::channel(1);
    session.register_source(source).unwrap();
    session.register_destination(destination).unwrap();

    // Nobody consumes yet: the pipeline holds one block per channel plus one
    // in the pump's hand, then the producer must suspend.
    source_tx.data("a").await.unwrap();
    source_tx.data("b").await.unwrap();
    source_tx.data("c").await.unwrap();
    assert!(
        timeout(Duration::from_millis(50), source_tx.data("d")).await.is_err(),
        "producer must be paused while the destination does not consume"
    );

    // Consuming unblocks the producer end to end.
    let consumer = drive_destination(receiver);
    source_tx.data("d").await.unwrap();
    source_tx.eof().await.unwrap();

    assert_eq!(consumer.await.unwrap(), b"abcd");

    let event = expect_single_event(&mut events).await;
    assert!(matches!(event, SessionEvent::Finished));
    assert_eq!(session.bytes_transferred(), 4);
}

#[tokio::test]
async fn adapts_async_read_write_streams() {
    let manager = SessionManager::new(SessionManagerConfig::default());
    let session = manager.create_session();
    let mut events = observe(&session);

    let (mut produce, source_io) = tokio::io::duplex(1024);
    let (sink_io, mut consume) = tokio::io::duplex(1024);

    session
        .register_source(SourceStream::from_reader(source_io, DEFAULT_CHANNEL_CAPACITY))
        .unwrap();
    session
        .register_destination(DestinationStream::from_writer(sink_io, DEFAULT_CHANNEL_CAPACITY))
        .unwrap();

    produce.write_all(b"abcdef").await.unwrap();
    produce.shutdown().await.unwrap();

    let mut received = Vec::new();
    consume.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"abcdef");

    let event = expect_single_event(&mut events).await;
    assert!(matches!(event, SessionEvent::Finished));
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.bytes_transferred(), 6);
}

#[test]
fn relays_arbitrary_framings_losslessly() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    proptest!(ProptestConfig::with_cases(16), |(payload in framed_payload().no_shrink())| {
        rt.block_on(async {
            let manager = SessionManager::new(SessionManagerConfig::default());
            let session = manager.create_session();
            let mut events = observe(&session);

            let (source_tx, source) = SourceStream::channel(4);
            let (destination, receiver) = DestinationStream::channel(4);
            session.register_source(source).unwrap();
            session.register_destination(destination).unwrap();

            let consumer = drive_destination(receiver);

            let expected = payload.concat();
            let total = payload.total_len() as u64;

            for frame in payload.0 {
                source_tx.data(frame).await.unwrap();
            }
            source_tx.eof().await.unwrap();

            assert_eq!(consumer.await.unwrap(), expected);

            let event = expect_single_event(&mut events).await;
            assert!(matches!(event, SessionEvent::Finished));
            assert_eq!(session.state(), SessionState::Finished);
            assert_eq!(session.bytes_transferred(), total);
        });
    })
}
