//! Dispatcher run loop.
//!
//! Every user callback (connection event handlers, reply continuations,
//! listener accept handlers) runs here and nowhere else. Producers (I/O
//! tasks, API calls) enqueue jobs on an unbounded MPSC ready-queue; the
//! loop pops and runs them one at a time in FIFO order.
//!
//! Per-connection serialization is layered on top by the connection's
//! inbox: at most one drain job per connection is queued at any moment,
//! and each drain job runs exactly one callback before re-queueing itself
//! behind other work.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::ChannelConfig;
use crate::{AppError, Result};

/// Unit of work executed on the run loop.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a run loop.
///
/// Cheap to clone; all clones feed the same ready-queue. Construct one
/// per process and pass it to every [`Listener`](crate::ipc::Listener)
/// and [`Connection`](crate::ipc::Connection).
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    cancel: CancellationToken,
    config: ChannelConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stopped", &self.is_stopped())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher with default channel limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    /// Dispatcher handing `config` to every connection it serves.
    #[must_use]
    pub fn with_config(config: ChannelConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(DispatcherInner {
                tx,
                rx: Mutex::new(Some(rx)),
                cancel: CancellationToken::new(),
                config,
            }),
        }
    }

    /// Channel limits applied to connections on this dispatcher.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Enqueue `job` for execution on the run loop.
    ///
    /// Never blocks and never runs `job` inline. Returns `false` when the
    /// dispatcher has been stopped; the job is dropped unrun.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            debug!("dispatcher stopped; dropping job");
            return false;
        }
        self.inner.tx.send(Box::new(job)).is_ok()
    }

    /// Ask the run loop to exit after the job it is currently running.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token that fires when [`stop`](Self::stop) is called.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Run jobs until [`stop`](Self::stop) is called.
    ///
    /// A panicking job is logged and discarded; the loop keeps running.
    /// Stopping is final: a stopped dispatcher cannot be run again.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Dispatcher` if the loop is already running or
    /// has already run.
    pub async fn run(&self) -> Result<()> {
        let mut rx = self
            .inner
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AppError::Dispatcher("run loop already started".into()))?;

        let cancel = self.inner.cancel.clone();
        let span = info_span!("dispatcher");
        async move {
            info!("dispatcher running");
            let mut executed: u64 = 0;
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => {
                        info!(executed, "dispatcher stopped");
                        break;
                    }

                    job = rx.recv() => {
                        let Some(job) = job else {
                            break;
                        };
                        execute(job);
                        executed += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await;

        Ok(())
    }
}

/// Run a single job, containing any panic.
fn execute(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = panic_message(&*panic), "dispatcher job panicked");
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
