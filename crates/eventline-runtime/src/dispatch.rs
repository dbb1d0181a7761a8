//! Event dispatch
//!
//! Every handler invocation goes through the dispatch wrapper: it assigns
//! the delivery id, logs receipt and outcome, captures failures into the
//! failed queue, and acknowledges replays back to the originating
//! connection. The wrapper also owns the two recovery passes: the debounced
//! retry sweep over the failed queue and the pending-queue replay.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventline_core::{
    remove_from_pending_channel, ErrorDetails, EventId, FailedStore, PendingStore, SecretDigest,
};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::router::{EventHandler, Router};
use crate::transport::ConnectionHandle;

/// Automatic retries granted to a failed event before sweeps skip it
const MAX_AUTO_RETRIES: usize = 3;

/// Debounce window for failure-triggered retry sweeps
const SWEEP_DEBOUNCE: Duration = Duration::from_secs(10);

/// Fixed delay before each swept record is re-invoked
const RETRY_STAGGER: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Dispatch Origin
// ----------------------------------------------------------------------------

/// How a dispatch was triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOrigin {
    /// A live inbound event; the wrapper assigns a fresh id
    Fresh,
    /// A replay of a previously recorded event, keeping its original id
    Replay(EventId),
}

// ----------------------------------------------------------------------------
// Dispatch Errors
// ----------------------------------------------------------------------------

/// Errors a dispatch can return to its caller
///
/// Handler failures are not among them; those are captured into the failed
/// queue. The only way to get an error back is asking for an event nobody
/// registered.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("event \"{0}\" does not exist; check the spelling and try again")]
    UnknownEvent(String),
}

// ----------------------------------------------------------------------------
// Handler Context
// ----------------------------------------------------------------------------

/// Context handed to every handler invocation
#[derive(Clone)]
pub struct Context {
    id: EventId,
    event: String,
    conn: ConnectionHandle,
    dispatcher: Arc<Dispatcher>,
}

impl Context {
    /// Delivery id of this invocation, stable across retries
    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// Name of the event being handled
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Emit an event back on the originating connection
    pub fn reply(&self, event: impl Into<String>, args: Vec<Value>) {
        self.conn.emit(event, args);
    }

    /// Run another registered event server-side, with a fresh id
    pub async fn run_event(&self, event: &str, args: Vec<Value>) -> Result<(), DispatchError> {
        self.dispatcher
            .run_event(&self.conn, DispatchOrigin::Fresh, event, args)
            .await
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Routes inbound events through the instrumented wrapper
pub struct Dispatcher {
    router: Router,
    failed: FailedStore,
    pending_path: PathBuf,
    digest: SecretDigest,
    log_args: bool,
    sweep_timer: Mutex<Option<JoinHandle<()>>>,
    active: Mutex<Option<ConnectionHandle>>,
}

impl Dispatcher {
    /// Build a dispatcher over a frozen router
    pub fn new(
        router: Router,
        failed: FailedStore,
        pending_path: PathBuf,
        digest: SecretDigest,
        log_args: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            failed,
            pending_path,
            digest,
            log_args,
            sweep_timer: Mutex::new(None),
            active: Mutex::new(None),
        })
    }

    /// Whether a handler is registered for `event`
    pub fn has_route(&self, event: &str) -> bool {
        self.router.has(event)
    }

    /// Failed queue backing this dispatcher
    pub fn failed_events(&self) -> &FailedStore {
        &self.failed
    }

    /// Remember the most recently authorized connection as the replay target
    pub fn set_active(&self, conn: ConnectionHandle) {
        *self.active.lock().unwrap() = Some(conn);
    }

    /// Most recently authorized connection, if its writer is still alive
    pub fn active(&self) -> Option<ConnectionHandle> {
        self.active
            .lock()
            .unwrap()
            .clone()
            .filter(ConnectionHandle::is_open)
    }

    /// Look up an event and run it through the wrapper
    ///
    /// Returns once the handler completed (successfully or not); the only
    /// error is an unregistered event name. Boxed so handlers can re-enter
    /// the router through their context.
    pub fn run_event(
        self: &Arc<Self>,
        conn: &ConnectionHandle,
        origin: DispatchOrigin,
        event: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<(), DispatchError>> {
        let handler = self.router.get(event);
        let this = Arc::clone(self);
        let conn = conn.clone();
        let event = event.to_string();

        Box::pin(async move {
            let handler = handler.ok_or_else(|| DispatchError::UnknownEvent(event.clone()))?;
            this.invoke(handler, conn, origin, event, args).await;
            Ok(())
        })
    }

    /// The dispatch wrapper around one handler invocation
    async fn invoke(
        self: Arc<Self>,
        handler: Arc<dyn EventHandler>,
        conn: ConnectionHandle,
        origin: DispatchOrigin,
        event: String,
        args: Vec<Value>,
    ) {
        let (id, is_replay) = match origin {
            DispatchOrigin::Fresh => (EventId::generate(), false),
            DispatchOrigin::Replay(id) => (id, true),
        };

        info!(id = %id, event = %event, replay = is_replay, "received");
        if self.log_args {
            match serde_json::to_string(&args) {
                Ok(rendered) => info!(id = %id, args = %rendered, "received args"),
                Err(err) => info!(id = %id, %err, "could not render args"),
            }
        }

        let ctx = Context {
            id: id.clone(),
            event: event.clone(),
            conn: conn.clone(),
            dispatcher: Arc::clone(&self),
        };

        match handler.handle(ctx, args.clone()).await {
            Ok(()) => {
                if is_replay {
                    self.failed.mark_successful(&id);
                    self.acknowledge(&conn, &id);
                }
                info!(id = %id, event = %event, "done");
            }
            Err(err) => {
                if is_replay {
                    // The record moves to the failed queue; the originating
                    // communicator must not keep a pending copy.
                    self.acknowledge(&conn, &id);
                }

                let details = ErrorDetails::capture(err.as_ref());
                error!(id = %id, event = %event, error = %details.message, "handler failed");
                self.failed.record_failure(&id, &event, &args, details);
                self.schedule_sweep(&conn);
            }
        }
    }

    fn acknowledge(&self, conn: &ConnectionHandle, id: &EventId) {
        conn.emit(
            remove_from_pending_channel(&self.digest),
            vec![json!(id.as_str())],
        );
    }

    /// (Re)arm the debounced retry sweep
    ///
    /// A burst of failures coalesces into one sweep rather than one per
    /// failure.
    pub fn schedule_sweep(self: &Arc<Self>, conn: &ConnectionHandle) {
        let this = Arc::clone(self);
        let conn = conn.clone();

        let mut timer = self.sweep_timer.lock().unwrap();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(SWEEP_DEBOUNCE).await;
            this.retry_failed_events(&conn, false).await;
        }));
    }

    /// Sweep the failed queue for retries
    ///
    /// Without `force`, records that already spent their automatic budget
    /// (3 retries) are skipped; a forced sweep re-invokes everything. Each
    /// eligible record is re-invoked with its original id after a fixed
    /// stagger delay, and sweeps never wait for one retry to finish before
    /// starting the next.
    pub async fn retry_failed_events(self: &Arc<Self>, conn: &ConnectionHandle, force: bool) {
        let records = self.failed.list_failed();
        if records.is_empty() {
            return;
        }

        let mut retried = 0usize;
        for (id, record) in records {
            if !force && record.retry_count() >= MAX_AUTO_RETRIES {
                debug!(id = %id, event = %record.event, "retry budget spent; skipping");
                continue;
            }

            warn!(id = %id, event = %record.event, "retrying failed event");
            retried += 1;

            let this = Arc::clone(self);
            let conn = conn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RETRY_STAGGER).await;
                let replay = this.run_event(
                    &conn,
                    DispatchOrigin::Replay(id),
                    &record.event,
                    record.args.clone(),
                );
                if let Err(err) = replay.await {
                    warn!(%err, "failed event is no longer routable");
                }
            });
        }

        if retried > 0 {
            warn!(count = retried, "retried failed events");
        }
    }

    /// Replay the communicator's pending queue
    ///
    /// This is a cross-role read of the pending snapshot file: events the
    /// peer queued while offline are re-invoked here with their original
    /// ids, oldest first. Dispatch entry follows that order; completion is
    /// not awaited.
    pub async fn run_pending_events(self: &Arc<Self>, conn: &ConnectionHandle) {
        let snapshot = match PendingStore::load_snapshot(&self.pending_path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "could not read the pending queue snapshot");
                return;
            }
        };
        if snapshot.is_empty() {
            return;
        }

        warn!(count = snapshot.len(), "pending events to replay");

        let mut records: Vec<_> = snapshot.into_iter().collect();
        records.sort_by_key(|(_, record)| record.added_at);

        for (id, record) in records {
            let replay = self.run_event(
                conn,
                DispatchOrigin::Replay(id),
                &record.event,
                record.args.clone(),
            );
            tokio::spawn(async move {
                if let Err(err) = replay.await {
                    warn!(%err, "pending event is no longer routable");
                }
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
