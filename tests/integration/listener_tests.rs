//! Integration tests for listeners over real local sockets.
//!
//! Validates:
//! - bind / accept / activate against a named endpoint
//! - connect to an unbound name fails promptly
//! - a name can be owned by one listener only
//! - accepted connections are tracked and closed with the listener

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use dictlink::ipc::{ConnectionState, Origin};
use dictlink::models::Message;
use dictlink::{service, AppError, Connection, Dispatcher, Event, Listener};

use super::test_helpers::{
    event_recorder, eventually, next, reply_recorder, run_dispatcher, unique_endpoint,
    EVENT_TIMEOUT,
};

#[tokio::test]
async fn client_receives_reply_from_service() {
    let server_dispatcher = Dispatcher::new();
    let client_dispatcher = Dispatcher::new();
    run_dispatcher(&server_dispatcher);
    run_dispatcher(&client_dispatcher);

    let endpoint = unique_endpoint("svc");
    let listener = service::serve(&server_dispatcher, &endpoint).expect("serve");

    let client = tokio::time::timeout(
        EVENT_TIMEOUT,
        Connection::connect(&client_dispatcher, &endpoint),
    )
    .await
    .expect("connect must not hang")
    .expect("connect");
    assert_eq!(client.origin(), Origin::Dialed);
    client.activate().expect("activate");

    let (continuation, mut replies) = reply_recorder();
    client
        .send_with_reply(Message::new().with("Hello", "world"), continuation)
        .expect("send_with_reply");

    let reply = next(&mut replies).await.expect("reply must succeed");
    assert_eq!(reply.as_dict(), Some(&Message::new().with("foo", "bar")));

    listener.close();
    server_dispatcher.stop();
    client_dispatcher.stop();
}

#[tokio::test]
async fn connect_without_listener_fails() {
    let dispatcher = Dispatcher::new();
    let endpoint = unique_endpoint("absent");

    let result = tokio::time::timeout(EVENT_TIMEOUT, Connection::connect(&dispatcher, &endpoint))
        .await
        .expect("connect must not hang");

    let err = result.expect_err("connect must fail");
    assert!(
        matches!(&err, AppError::ConnectionInvalid(msg) if msg.contains("failed to connect")),
        "got: {err:?}"
    );
}

#[tokio::test]
async fn second_bind_on_same_name_fails() {
    let dispatcher = Dispatcher::new();
    let endpoint = unique_endpoint("dup");

    let first = Listener::bind(&dispatcher, &endpoint).expect("first bind");
    let err = Listener::bind(&dispatcher, &endpoint).expect_err("second bind must fail");
    assert!(matches!(err, AppError::Bind(_)), "got: {err:?}");

    assert_eq!(first.endpoint(), &endpoint);
    first.close();
}

#[tokio::test]
async fn accepted_connections_queue_until_handler_is_set() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let endpoint = unique_endpoint("backlog");

    let listener = Listener::bind(&dispatcher, &endpoint).expect("bind");
    listener.activate().expect("activate");
    listener.activate().expect("activate is idempotent");

    let _client = Connection::connect(&dispatcher, &endpoint)
        .await
        .expect("connect");
    eventually(|| listener.live_connections() == 1).await;

    let (tx, mut accepted) = mpsc::unbounded_channel();
    listener.set_accept_handler(move |conn: Connection| {
        let _ = tx.send(conn);
    });

    let conn = next(&mut accepted).await;
    assert_eq!(conn.origin(), Origin::Accepted);
    assert_eq!(conn.state(), ConnectionState::Created);

    listener.close();
    dispatcher.stop();
}

#[tokio::test]
async fn peer_disconnect_is_reported_and_untracked() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let endpoint = unique_endpoint("untrack");

    let listener = Listener::bind(&dispatcher, &endpoint).expect("bind");
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    listener.set_accept_handler(move |conn: Connection| {
        let (handler, mut events) = event_recorder();
        conn.set_event_handler(handler);
        conn.activate().expect("activate accepted connection");
        let forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let _ = forward.send(event);
            }
        });
    });
    listener.activate().expect("activate");

    let client = Connection::connect(&dispatcher, &endpoint)
        .await
        .expect("connect");
    eventually(|| listener.live_connections() == 1).await;

    client.close();

    assert_eq!(next(&mut events_rx).await, Event::Invalidated);
    eventually(|| listener.live_connections() == 0).await;

    listener.close();
    dispatcher.stop();
}

#[tokio::test]
async fn closing_listener_closes_accepted_connections() {
    let dispatcher = Dispatcher::new();
    run_dispatcher(&dispatcher);
    let endpoint = unique_endpoint("close");

    let listener = Listener::bind(&dispatcher, &endpoint).expect("bind");
    let accepted: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&accepted);
    listener.set_accept_handler(move |conn: Connection| {
        conn.activate().expect("activate accepted connection");
        sink.lock().unwrap().push(conn);
    });
    listener.activate().expect("activate");

    let client = Connection::connect(&dispatcher, &endpoint)
        .await
        .expect("connect");
    let (handler, mut events) = event_recorder();
    client.set_event_handler(handler);
    client.activate().expect("activate");
    eventually(|| accepted.lock().unwrap().len() == 1).await;

    listener.close();

    assert_eq!(next(&mut events).await, Event::Invalidated);
    assert_eq!(
        accepted.lock().unwrap()[0].state(),
        ConnectionState::Invalidated
    );

    let err = listener.activate().expect_err("closed listener cannot activate");
    assert!(matches!(err, AppError::UseAfterInvalidate(_)), "got: {err:?}");

    // The accept task releases the socket asynchronously.
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        match Connection::connect(&dispatcher, &endpoint).await {
            Err(err) => {
                assert!(matches!(err, AppError::ConnectionInvalid(_)), "got: {err:?}");
                break;
            }
            Ok(stale) => {
                stale.close();
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "closed listener must free its name"
                );
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }

    dispatcher.stop();
}
