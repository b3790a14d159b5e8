//! Integration tests for the connection state machine.
//!
//! Validates:
//! - Created → Activated → Established → Invalidated transitions
//! - events queue until the connection is activated and has a handler
//! - exactly one `Invalidated` event, always last
//! - operations after invalidation fail
//! - malformed bodies are non-fatal, malformed headers are fatal
//! - a panicking handler is contained

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Encoder;

use dictlink::codec::{encode, Frame, FrameCodec, FrameHeader};
use dictlink::ipc::{ConnectionState, Origin};
use dictlink::models::Message;
use dictlink::{AppError, Connection, Dispatcher, Event};

use super::test_helpers::{
    assert_quiet, connected_pair, event_recorder, eventually, next, run_dispatcher,
};

fn hello() -> Message {
    Message::new().with("Hello", "world")
}

fn encoded_frame(header: FrameHeader, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    FrameCodec::new(1024)
        .encode(
            Frame {
                header,
                payload: Bytes::copy_from_slice(payload),
            },
            &mut buf,
        )
        .expect("frame must encode");
    buf
}

// ── State transitions ───────────────────────────────────────────────────────

#[tokio::test]
async fn walks_through_every_state() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client, server) = connected_pair(&dispatcher, &dispatcher);

    assert_eq!(client.state(), ConnectionState::Created);
    assert_eq!(client.origin(), Origin::Dialed);
    assert_eq!(server.origin(), Origin::Accepted);
    assert_ne!(client.id(), server.id());

    let (handler, mut events) = event_recorder();
    server.set_event_handler(handler);
    server.activate().expect("activate");
    assert_eq!(server.state(), ConnectionState::Activated);

    client.send(hello()).expect("send");
    let event = next(&mut events).await;
    assert!(matches!(event, Event::Message(_)), "got: {event:?}");
    assert_eq!(server.state(), ConnectionState::Established);

    server.close();
    assert_eq!(server.state(), ConnectionState::Invalidated);
    assert_eq!(next(&mut events).await, Event::Invalidated);

    dispatcher.stop();
}

#[tokio::test]
async fn traffic_before_activation_establishes_on_activate() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client, server) = connected_pair(&dispatcher, &dispatcher);

    let (handler, mut events) = event_recorder();
    server.set_event_handler(handler);
    client.send(hello()).expect("send");

    assert_quiet(&mut events).await;
    assert_eq!(
        server.state(),
        ConnectionState::Created,
        "no events flow before activation"
    );

    server.activate().expect("activate");
    assert_eq!(server.state(), ConnectionState::Established);
    match next(&mut events).await {
        Event::Message(message) => assert_eq!(message.body().as_dict(), Some(&hello())),
        other => panic!("expected message, got {other:?}"),
    }

    dispatcher.stop();
}

#[tokio::test]
async fn events_wait_for_a_handler() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client, server) = connected_pair(&dispatcher, &dispatcher);

    server.activate().expect("activate");
    client.send(hello()).expect("send");
    client.send(Message::new().with("n", 2_i64)).expect("send");
    eventually(|| server.state() == ConnectionState::Established).await;

    let (handler, mut events) = event_recorder();
    server.set_event_handler(handler);

    for expected in [hello(), Message::new().with("n", 2_i64)] {
        match next(&mut events).await {
            Event::Message(message) => assert_eq!(message.body().as_dict(), Some(&expected)),
            other => panic!("expected message, got {other:?}"),
        }
    }

    dispatcher.stop();
}

#[tokio::test]
async fn activate_is_idempotent() {
    let dispatcher = Dispatcher::new();
    let (client, _server) = connected_pair(&dispatcher, &dispatcher);

    client.activate().expect("first activate");
    client.activate().expect("second activate");
    assert_eq!(client.state(), ConnectionState::Activated);
}

// ── Invalidation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn peer_close_delivers_exactly_one_invalidated() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client, server) = connected_pair(&dispatcher, &dispatcher);

    let (handler, mut events) = event_recorder();
    client.set_event_handler(handler);
    client.activate().expect("activate");

    server.close();

    assert_eq!(next(&mut events).await, Event::Invalidated);
    assert_quiet(&mut events).await;
    assert_eq!(client.state(), ConnectionState::Invalidated);

    dispatcher.stop();
}

#[tokio::test]
async fn invalidation_reaches_a_never_activated_connection() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client, server) = connected_pair(&dispatcher, &dispatcher);

    let (handler, mut events) = event_recorder();
    client.set_event_handler(handler);

    server.send(hello()).expect("send");
    server.close();

    // Traffic that arrived before invalidation is still delivered in order.
    assert!(matches!(next(&mut events).await, Event::Message(_)));
    assert_eq!(next(&mut events).await, Event::Invalidated);
    assert_quiet(&mut events).await;
    assert_eq!(client.state(), ConnectionState::Invalidated);

    dispatcher.stop();
}

#[tokio::test]
async fn repeated_close_is_a_no_op() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client, _server) = connected_pair(&dispatcher, &dispatcher);

    let (handler, mut events) = event_recorder();
    client.set_event_handler(handler);
    client.activate().expect("activate");

    client.close();
    client.close();

    assert_eq!(next(&mut events).await, Event::Invalidated);
    assert_quiet(&mut events).await;

    dispatcher.stop();
}

#[tokio::test]
async fn operations_after_invalidation_fail() {
    let dispatcher = Dispatcher::new();
    let (client, _server) = connected_pair(&dispatcher, &dispatcher);

    client.close();

    let err = client.send(hello()).expect_err("send after close must fail");
    assert!(matches!(err, AppError::ConnectionInvalid(_)), "got: {err:?}");

    let err = client
        .send_with_reply(hello(), |_: &Connection, _| {})
        .expect_err("request after close must fail");
    assert!(matches!(err, AppError::ConnectionInvalid(_)), "got: {err:?}");
    assert_eq!(client.pending_requests(), 0);

    let err = client.activate().expect_err("activate after close must fail");
    assert!(matches!(err, AppError::UseAfterInvalidate(_)), "got: {err:?}");
}

#[tokio::test]
async fn frames_queued_before_close_are_still_delivered() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client, server) = connected_pair(&dispatcher, &dispatcher);

    let (handler, mut events) = event_recorder();
    server.set_event_handler(handler);
    server.activate().expect("activate");

    client.send(hello()).expect("send");
    client.close();

    assert!(matches!(next(&mut events).await, Event::Message(_)));
    assert_eq!(next(&mut events).await, Event::Invalidated);

    dispatcher.stop();
}

// ── Transport faults ────────────────────────────────────────────────────────

#[tokio::test]
async fn undecodable_body_is_reported_without_invalidating() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);

    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(local);
    let conn = Connection::attach(&dispatcher, read, write, Origin::Accepted);
    let (handler, mut events) = event_recorder();
    conn.set_event_handler(handler);
    conn.activate().expect("activate");

    let good = encode(&hello()).expect("encode");
    remote
        .write_all(&encoded_frame(FrameHeader::message(1), &[0x09]))
        .await
        .expect("write bad body");
    remote
        .write_all(&encoded_frame(FrameHeader::message(2), &good))
        .await
        .expect("write good body");

    match next(&mut events).await {
        Event::TransportError(AppError::Codec(msg)) => {
            assert_eq!(msg, "unknown value tag 0x09");
        }
        other => panic!("expected codec transport error, got {other:?}"),
    }
    match next(&mut events).await {
        Event::Message(message) => assert_eq!(message.body().as_dict(), Some(&hello())),
        other => panic!("expected message, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Established);

    dispatcher.stop();
}

#[tokio::test]
async fn malformed_header_invalidates_the_connection() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);

    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(local);
    let conn = Connection::attach(&dispatcher, read, write, Origin::Accepted);
    let (handler, mut events) = event_recorder();
    conn.set_event_handler(handler);
    conn.activate().expect("activate");

    // Length 24, then a header with the wrong magic.
    let mut raw = vec![0, 0, 0, 24];
    raw.extend_from_slice(&[0xff; 24]);
    remote.write_all(&raw).await.expect("write garbage");

    match next(&mut events).await {
        Event::TransportError(AppError::Codec(msg)) => {
            assert!(msg.starts_with("bad frame magic"), "got: {msg}");
        }
        other => panic!("expected codec transport error, got {other:?}"),
    }
    assert_eq!(next(&mut events).await, Event::Invalidated);
    assert_eq!(conn.state(), ConnectionState::Invalidated);

    dispatcher.stop();
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let (client_a, server_a) = connected_pair(&dispatcher, &dispatcher);
    let (client_b, server_b) = connected_pair(&dispatcher, &dispatcher);

    server_a.set_event_handler(|_: &Connection, _: Event| panic!("handler failure"));
    server_a.activate().expect("activate");

    let (handler, mut events) = event_recorder();
    server_b.set_event_handler(handler);
    server_b.activate().expect("activate");

    client_a.send(hello()).expect("send");
    client_b.send(hello()).expect("send");

    assert!(
        matches!(next(&mut events).await, Event::Message(_)),
        "other connections keep receiving after a handler panics"
    );
    assert!(!dispatcher.is_stopped());

    dispatcher.stop();
}
