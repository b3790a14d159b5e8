//! Named-endpoint listener.
//!
//! Binds a local socket (Unix domain socket or named pipe) through the
//! `interprocess` crate and yields a [`Connection`] per accepted peer.
//! Accepted connections start in [`ConnectionState::Created`](crate::ipc::ConnectionState);
//! the accept handler is expected to register an event handler and
//! activate them.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::ListenerOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::dispatch::{panic_message, Dispatcher};
use crate::ipc::connection::{Connection, WeakConnection};
use crate::ipc::event::{AcceptHandler, ConnectionId, ConnectionState, Origin};
use crate::models::EndpointName;
use crate::{AppError, Result};

/// Pause after a failed `accept` so a persistent error cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handle to a bound endpoint.
///
/// Cheap to clone. Dropping the last handle stops accepting; connections
/// already accepted live on.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    endpoint: EndpointName,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    socket: Mutex<Option<LocalSocketListener>>,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    handler: Option<Box<dyn AcceptHandler>>,
    backlog: VecDeque<Connection>,
    delivery_scheduled: bool,
    connections: HashMap<ConnectionId, WeakConnection>,
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Bind `endpoint`. No connection is accepted until
    /// [`activate`](Self::activate).
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bind` if the name is invalid for this platform or
    /// already owned by another listener.
    pub fn bind(dispatcher: &Dispatcher, endpoint: &EndpointName) -> Result<Self> {
        let name = endpoint.to_socket_name()?;
        let socket = ListenerOptions::new()
            .name(name)
            .create_tokio()
            .map_err(|err| AppError::Bind(format!("failed to bind '{endpoint}': {err}")))?;

        info!(%endpoint, "listener bound");

        Ok(Self {
            inner: Arc::new(ListenerInner {
                endpoint: endpoint.clone(),
                dispatcher: dispatcher.clone(),
                cancel: CancellationToken::new(),
                socket: Mutex::new(Some(socket)),
                state: Mutex::new(ListenerState::default()),
            }),
        })
    }

    /// The name this listener owns.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointName {
        &self.inner.endpoint
    }

    /// Register the callback receiving each accepted connection.
    ///
    /// Connections accepted while no handler was registered are handed
    /// over, in order, once one is.
    pub fn set_accept_handler<H>(&self, handler: H)
    where
        H: AcceptHandler + 'static,
    {
        let previous = {
            let mut state = self.lock();
            let previous = state.handler.replace(Box::new(handler));
            self.schedule_delivery(&mut state);
            previous
        };
        drop(previous);
    }

    /// Start accepting. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UseAfterInvalidate` if the listener was closed.
    pub fn activate(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(AppError::UseAfterInvalidate(format!(
                "listener on '{}' is closed",
                self.inner.endpoint
            )));
        }

        let socket = self
            .inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(socket) = socket else {
            return Ok(());
        };

        let span = info_span!("listener", endpoint = %self.inner.endpoint);
        tokio::spawn(
            accept_loop(
                Arc::downgrade(&self.inner),
                socket,
                self.inner.cancel.clone(),
            )
            .instrument(span),
        );
        info!(endpoint = %self.inner.endpoint, "listener activated");
        Ok(())
    }

    /// Accepted connections that are not yet invalidated.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        let mut state = self.lock();
        prune(&mut state.connections);
        state.connections.len()
    }

    /// Stop accepting and close every live accepted connection.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        // Releasing the socket frees the name even if never activated.
        let socket = self
            .inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(socket);

        let (connections, backlog) = {
            let mut state = self.lock();
            let connections: Vec<_> = state
                .connections
                .drain()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            let backlog: Vec<_> = state.backlog.drain(..).collect();
            (connections, backlog)
        };

        info!(
            endpoint = %self.inner.endpoint,
            connections = connections.len(),
            "listener closed"
        );
        for conn in connections.iter().chain(backlog.iter()) {
            conn.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly accepted connection and queue it for the handler.
    fn admit(&self, conn: Connection) {
        info!(connection = %conn.id(), endpoint = %self.inner.endpoint, "new connection");
        let mut state = self.lock();
        prune(&mut state.connections);
        state.connections.insert(conn.id(), conn.downgrade());
        state.backlog.push_back(conn);
        self.schedule_delivery(&mut state);
    }

    fn schedule_delivery(&self, state: &mut ListenerState) {
        if state.delivery_scheduled || state.handler.is_none() || state.backlog.is_empty() {
            return;
        }

        state.delivery_scheduled = true;
        let listener = self.clone();
        if !self
            .inner
            .dispatcher
            .post(move || listener.deliver_one())
        {
            state.delivery_scheduled = false;
        }
    }

    /// Hand one backlogged connection to the accept handler.
    fn deliver_one(&self) {
        let next = {
            let mut state = self.lock();
            if state.handler.is_some() && !state.backlog.is_empty() {
                let conn = state.backlog.pop_front();
                conn.zip(state.handler.take())
            } else {
                None
            }
        };

        let restore = match next {
            Some((conn, mut handler)) => {
                let id = conn.id();
                match catch_unwind(AssertUnwindSafe(|| handler.accept(conn))) {
                    Ok(()) => Some(handler),
                    Err(panic) => {
                        error!(
                            connection = %id,
                            panic = panic_message(&*panic),
                            "accept handler panicked; handler dropped"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let replaced = {
            let mut state = self.lock();
            let replaced = match restore {
                Some(handler) if state.handler.is_none() => {
                    state.handler = Some(handler);
                    None
                }
                other => other,
            };
            state.delivery_scheduled = false;
            self.schedule_delivery(&mut state);
            replaced
        };
        drop(replaced);
    }
}

/// Forget connections that are gone or invalidated.
fn prune(connections: &mut HashMap<ConnectionId, WeakConnection>) {
    connections.retain(|_, weak| {
        weak.upgrade()
            .is_some_and(|conn| conn.state() != ConnectionState::Invalidated)
    });
}

async fn accept_loop(
    listener: Weak<ListenerInner>,
    socket: LocalSocketListener,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                info!("listener shutting down");
                break;
            }

            accept_result = socket.accept() => {
                match accept_result {
                    Ok(stream) => {
                        let Some(inner) = listener.upgrade() else {
                            debug!("listener dropped, stopping accept loop");
                            break;
                        };
                        let listener = Listener { inner };
                        let (reader, writer) = stream.split();
                        let conn = Connection::attach(
                            &listener.inner.dispatcher,
                            reader,
                            writer,
                            Origin::Accepted,
                        );
                        listener.admit(conn);
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}
