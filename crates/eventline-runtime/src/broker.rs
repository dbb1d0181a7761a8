//! Broker, the server role
//!
//! Accepts connections, gates each one behind the authentication handshake,
//! and routes inbound events to registered handlers through the dispatch
//! wrapper. A freshly authorized connection immediately gets a retry sweep
//! of the failed queue and a replay of the peer's pending queue.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventline_core::{
    authorized_channel, control, AuthorizePayload, Envelope, EventlineConfig, FailedStore,
    SecretDigest,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Context, DispatchOrigin, Dispatcher};
use crate::errors::RuntimeError;
use crate::router::{EventHandler, HandlerResult, RouterBuilder};
use crate::transport::{framed, ConnectionHandle, FrameStream};

/// How long a connection may idle in `AwaitingAuth` before it is dropped
///
/// A wrong key does not close the connection; only never presenting a valid
/// one does.
const AUTH_TIMEOUT: Duration = Duration::from_secs(60);

// ----------------------------------------------------------------------------
// Broker
// ----------------------------------------------------------------------------

/// Server-role endpoint of the event link
pub struct Broker {
    config: Arc<EventlineConfig>,
    digest: SecretDigest,
    failed: FailedStore,
    routes: Mutex<Option<RouterBuilder>>,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Validate the configuration and open the failed queue
    ///
    /// Configuration faults are fatal here, before any socket is bound.
    pub fn open(config: Arc<EventlineConfig>) -> Result<Self, RuntimeError> {
        config.validate()?;

        let digest = SecretDigest::derive(&config.secret_key);
        let failed = FailedStore::open(&config.storage.failed_path, config.save_debounce())?;

        Ok(Self {
            config,
            digest,
            failed,
            routes: Mutex::new(Some(RouterBuilder::new())),
            dispatcher: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Failed queue, for operator tooling
    pub fn failed_events(&self) -> &FailedStore {
        &self.failed
    }

    /// Register a handler for an event name
    ///
    /// Registration must happen before `start_listening`; afterwards the
    /// registry is frozen and late registrations are rejected with a log
    /// line.
    pub fn on(&self, event: impl Into<String>, handler: Arc<dyn EventHandler>) -> &Self {
        match self.routes.lock().unwrap().as_mut() {
            Some(routes) => routes.on(event, handler),
            None => warn!("handler registered after start_listening; ignored"),
        }
        self
    }

    /// Register an async closure for an event name
    pub fn on_fn<F, Fut>(&self, event: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Context, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        match self.routes.lock().unwrap().as_mut() {
            Some(routes) => routes.on_fn(event, handler),
            None => warn!("handler registered after start_listening; ignored"),
        }
        self
    }

    /// Freeze the registry, bind the listener, and start accepting
    ///
    /// Returns the bound address (useful when the configured port is 0 in
    /// tests).
    pub async fn start_listening(&self) -> Result<SocketAddr, RuntimeError> {
        let routes = self
            .routes
            .lock()
            .unwrap()
            .take()
            .ok_or(RuntimeError::AlreadyListening)?;
        let router = routes.build();
        info!(events = router.len(), "event registry frozen");

        let dispatcher = Dispatcher::new(
            router,
            self.failed.clone(),
            self.config.storage.pending_path.clone(),
            self.digest.clone(),
            self.config.log_args,
        );
        *self.dispatcher.lock().unwrap() = Some(Arc::clone(&dispatcher));

        let addr = self.config.broker_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RuntimeError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| RuntimeError::Bind {
            addr: self.config.broker_addr(),
            source,
        })?;
        info!(addr = %local_addr, "broker listening");

        let digest = self.digest.clone();
        *self.accept_task.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(
                            Arc::clone(&dispatcher),
                            digest.clone(),
                            stream,
                            peer,
                        ));
                    }
                    Err(err) => {
                        error!(%err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));

        Ok(local_addr)
    }

    /// Force a retry sweep of the failed queue
    ///
    /// Replays need a connection to reply on; without an authorized peer
    /// this logs and does nothing.
    pub async fn retry_failed_events(&self, force: bool) {
        let dispatcher = self.dispatcher.lock().unwrap().clone();
        match dispatcher {
            Some(dispatcher) => match dispatcher.active() {
                Some(conn) => dispatcher.retry_failed_events(&conn, force).await,
                None => warn!("no authorized connection; retry sweep skipped"),
            },
            None => warn!("broker is not listening; retry sweep skipped"),
        }
    }

    /// Stop accepting new connections
    ///
    /// Live connections keep running until their sockets close.
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Connection Lifecycle
// ----------------------------------------------------------------------------

/// Outcome of the authentication gate
enum AuthGate {
    /// Valid digest presented; carries the optional communicator name
    Authorized(Option<String>),
    /// Peer went away before authenticating
    Closed,
}

async fn serve_connection(
    dispatcher: Arc<Dispatcher>,
    digest: SecretDigest,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (mut frames, handle) = framed(stream, peer);

    // AwaitingAuth: nothing is dispatched until a valid digest arrives.
    let gate = timeout(AUTH_TIMEOUT, await_authorization(&mut frames, &handle, &digest)).await;
    let name = match gate {
        Ok(AuthGate::Authorized(name)) => name,
        Ok(AuthGate::Closed) => {
            debug!(%peer, "connection closed before authorization");
            return;
        }
        Err(_) => {
            warn!(%peer, "authorization idle timeout; dropping connection");
            return;
        }
    };

    info!(%peer, name = name.as_deref().unwrap_or("unnamed"), "established a secured connection");
    handle.send(Envelope::bare(authorized_channel(&digest)));
    dispatcher.set_active(handle.clone());

    // A fresh link is the moment to recover: sweep the failed queue, then
    // drain whatever the peer queued while offline.
    dispatcher.retry_failed_events(&handle, false).await;
    dispatcher.run_pending_events(&handle).await;

    // Listening: dispatch entry follows frame receipt order, completion
    // does not.
    while let Some(envelope) = frames.next().await {
        match envelope.event.as_str() {
            control::RETRY_FAILED_EVENTS => {
                dispatcher.retry_failed_events(&handle, true).await;
            }
            control::RUN_PENDING_EVENTS => {
                dispatcher.run_pending_events(&handle).await;
            }
            event if dispatcher.has_route(event) => {
                let dispatch = dispatcher.run_event(
                    &handle,
                    DispatchOrigin::Fresh,
                    event,
                    envelope.args,
                );
                tokio::spawn(async move {
                    // Routability was checked above; the handler's own
                    // failures are captured inside the wrapper.
                    let _ = dispatch.await;
                });
            }
            other => {
                debug!(%peer, event = %other, "no handler registered; frame dropped");
            }
        }
    }

    info!(%peer, "connection closed");
}

/// Wait for a valid `Authorize` frame
///
/// A wrong key earns an `error` envelope and another chance; only closing
/// the socket (or the caller's idle timeout) ends the wait.
async fn await_authorization(
    frames: &mut FrameStream,
    handle: &ConnectionHandle,
    digest: &SecretDigest,
) -> AuthGate {
    while let Some(envelope) = frames.next().await {
        if envelope.event != control::AUTHORIZE {
            debug!(event = %envelope.event, "frame from unauthenticated connection dropped");
            continue;
        }

        let payload = envelope
            .args
            .first()
            .cloned()
            .and_then(|value| serde_json::from_value::<AuthorizePayload>(value).ok());

        match payload {
            Some(payload) if digest.matches(&payload.secret_key_hash) => {
                return AuthGate::Authorized(payload.name);
            }
            _ => {
                warn!(peer = %handle.peer(), "authorization failed");
                handle.emit(
                    control::ERROR,
                    vec![json!("Authorization Failed, Invalid SECRET_KEY!")],
                );
            }
        }
    }

    AuthGate::Closed
}
