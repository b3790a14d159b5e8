//! Reference service served by `dictlink-server`.
//!
//! Answers every dictionary message with `{"foo": "bar"}` and logs any
//! other payload without replying.

use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::ipc::{Connection, Event, Listener};
use crate::models::{EndpointName, Message};
use crate::Result;

/// Body sent in answer to every dictionary.
#[must_use]
pub fn reply_body() -> Message {
    Message::new().with("foo", "bar")
}

/// Bind `endpoint` and start serving on `dispatcher`.
///
/// # Errors
///
/// Returns `AppError::Bind` if the endpoint cannot be bound.
pub fn serve(dispatcher: &Dispatcher, endpoint: &EndpointName) -> Result<Listener> {
    let listener = Listener::bind(dispatcher, endpoint)?;
    listener.set_accept_handler(|conn: Connection| accept_peer(&conn));
    listener.activate()?;
    Ok(listener)
}

/// Accept handler: wire up the event handler and start delivery.
pub fn accept_peer(conn: &Connection) {
    info!(connection = %conn.id(), "new connection");
    conn.set_event_handler(handle_peer_event);
    if let Err(err) = conn.activate() {
        warn!(connection = %conn.id(), %err, "peer gone before activation");
    }
}

/// Per-connection event handler.
pub fn handle_peer_event(conn: &Connection, event: Event) {
    match event {
        Event::Message(message) => {
            let Some(dict) = message.body().as_dict() else {
                warn!(
                    connection = %conn.id(),
                    kind = message.body().type_name(),
                    "received something other than a dictionary"
                );
                return;
            };

            info!(connection = %conn.id(), %dict, "message received");
            if let Err(err) = conn.respond(&message, reply_body()) {
                warn!(connection = %conn.id(), %err, "failed to send reply");
            }
        }
        Event::Invalidated => {
            info!(connection = %conn.id(), "connection closed by remote end");
        }
        Event::TransportError(err) => {
            warn!(connection = %conn.id(), %err, "transport error");
        }
    }
}
