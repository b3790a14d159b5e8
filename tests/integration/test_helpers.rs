//! Shared helpers for connection-level integration tests.
//!
//! Provides running dispatchers, in-memory connection pairs, unique
//! endpoint names, and channel-backed recorders for events and replies so
//! test modules can assert on what the dispatcher delivered.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dictlink::ipc::Origin;
use dictlink::models::EndpointName;
use dictlink::{Connection, Dispatcher, Event, Result, Value};

/// Upper bound for anything that is expected to happen.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to watch for something that must not happen.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Endpoint name no other test (or test run) uses.
pub fn unique_endpoint(tag: &str) -> EndpointName {
    let name = format!("dictlink-test-{tag}-{}", uuid::Uuid::new_v4().simple());
    EndpointName::new(name).expect("generated endpoint name is valid")
}

/// Spawn `dispatcher.run()` on the current runtime.
pub fn run_dispatcher(dispatcher: &Dispatcher) -> JoinHandle<Result<()>> {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move { dispatcher.run().await })
}

/// Two connections joined by an in-memory pipe.
///
/// The first is the dialing side on `client`, the second the accepted
/// side on `server`. Neither has a handler or is activated.
pub fn connected_pair(client: &Dispatcher, server: &Dispatcher) -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        Connection::attach(client, a_read, a_write, Origin::Dialed),
        Connection::attach(server, b_read, b_write, Origin::Accepted),
    )
}

/// Event handler forwarding every event into a channel.
pub fn event_recorder() -> (
    impl FnMut(&Connection, Event) + Send + 'static,
    mpsc::UnboundedReceiver<Event>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |_: &Connection, event: Event| {
        let _ = tx.send(event);
    };
    (handler, rx)
}

/// Reply continuation forwarding its result into a channel.
pub fn reply_recorder() -> (
    impl FnOnce(&Connection, Result<Value>) + Send + 'static,
    mpsc::UnboundedReceiver<Result<Value>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let continuation = move |_: &Connection, result: Result<Value>| {
        let _ = tx.send(result);
    };
    (continuation, rx)
}

/// Handler answering every message with `body`.
pub fn echo_server(body: Value) -> impl FnMut(&Connection, Event) + Send + 'static {
    move |conn: &Connection, event: Event| {
        if let Event::Message(message) = event {
            conn.respond(&message, body.clone())
                .expect("respond must succeed");
        }
    }
}

/// Next item from `rx`, failing the test after [`EVENT_TIMEOUT`].
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed before delivery")
}

/// Assert nothing more arrives on `rx` for [`QUIET_PERIOD`].
///
/// A closed channel counts as quiet: handlers are released after the
/// final event.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    match tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(item)) => panic!("unexpected delivery: {item:?}"),
    }
}

/// Poll `check` until it holds or [`EVENT_TIMEOUT`] passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
