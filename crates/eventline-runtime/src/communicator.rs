//! Communicator, the client role
//!
//! Owns the connection to the broker: dials, authenticates, forwards
//! outgoing events while connected, and buffers them in the pending queue
//! while not. Under keep-alive the supervisor redials every 5 seconds,
//! giving up after 5 consecutive failed attempts until `connect` is called
//! again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventline_core::{
    authorized_channel, control, remove_from_pending_channel, AuthorizePayload, EventId,
    EventlineConfig, PendingStore, SecretDigest,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::RuntimeError;
use crate::transport::{framed, ConnectionHandle, MAX_RECONNECT_FAILURES, RECONNECT_INTERVAL};

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

/// Connection state machine of the communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection; emits go to the pending queue
    Disconnected,
    /// Dialing the broker
    Connecting,
    /// Connected, `Authorize` sent, confirmation not yet received
    Authenticating,
    /// Authorized; emits go straight to the wire
    Connected,
}

// ----------------------------------------------------------------------------
// Reconnect Policy
// ----------------------------------------------------------------------------

/// Keep-alive pacing; fixed in production, shrunk in tests
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReconnectPolicy {
    pub interval: Duration,
    pub max_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: RECONNECT_INTERVAL,
            max_failures: MAX_RECONNECT_FAILURES,
        }
    }
}

// ----------------------------------------------------------------------------
// Communicator
// ----------------------------------------------------------------------------

/// Optional hook run each time the link reaches `Connected`
pub type AuthorizedHook = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    config: Arc<EventlineConfig>,
    digest: SecretDigest,
    pending: PendingStore,
    state_tx: watch::Sender<LinkState>,
    link: Mutex<Option<ConnectionHandle>>,
    on_authorized: Mutex<Option<AuthorizedHook>>,
    dial_attempts: AtomicU32,
}

impl Inner {
    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }
}

/// Client-role endpoint of the event link
pub struct Communicator {
    inner: Arc<Inner>,
    policy: ReconnectPolicy,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Communicator {
    /// Validate the configuration and open the pending queue
    pub fn open(config: Arc<EventlineConfig>) -> Result<Self, RuntimeError> {
        config.validate()?;

        let digest = SecretDigest::derive(&config.secret_key);
        let pending = PendingStore::open(&config.storage.pending_path, config.save_debounce())?;
        let (state_tx, _) = watch::channel(LinkState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                digest,
                pending,
                state_tx,
                link: Mutex::new(None),
                on_authorized: Mutex::new(None),
                dial_attempts: AtomicU32::new(0),
            }),
            policy: ReconnectPolicy::default(),
            supervisor: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pending queue, for operator tooling
    pub fn pending_events(&self) -> &PendingStore {
        &self.inner.pending
    }

    /// Watch the link state machine
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether the link is currently authorized
    pub fn is_connected(&self) -> bool {
        self.inner.state() == LinkState::Connected
    }

    /// Run a hook every time authorization completes
    pub fn on_authorized(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_authorized.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Start (or restart) the connection supervisor
    ///
    /// Each dial builds a brand-new TCP connection, so a supervisor that
    /// exhausted its keep-alive budget resumes cleanly from here.
    pub fn connect(&self) {
        let mut supervisor = self.supervisor.lock().unwrap();
        if let Some(previous) = supervisor.take() {
            previous.abort();
        }
        *supervisor = Some(tokio::spawn(supervise(
            Arc::clone(&self.inner),
            self.policy,
        )));
    }

    /// Drop the link and stop reconnecting
    pub fn disconnect(&self) {
        if let Some(supervisor) = self.supervisor.lock().unwrap().take() {
            supervisor.abort();
        }
        *self.inner.link.lock().unwrap() = None;
        self.inner.set_state(LinkState::Disconnected);
    }

    /// Emit an event: straight to the wire when connected, buffered when not
    ///
    /// Returns the pending id when the event was buffered.
    pub fn emit(&self, event: impl Into<String>, args: Vec<Value>) -> Option<EventId> {
        let event = event.into();

        if self.is_connected() {
            if let Some(link) = self.inner.link.lock().unwrap().clone() {
                link.emit(event, args);
                return None;
            }
        }

        debug!(event = %event, "offline; buffering event as pending");
        Some(self.inner.pending.record(event, args))
    }

    /// Buffer an event as pending regardless of connection state
    pub fn push(&self, event: impl Into<String>, args: Vec<Value>) -> EventId {
        self.inner.pending.record(event, args)
    }

    /// Ask the broker to force-retry its failed queue
    pub fn retry_failed_events(&self) {
        self.send_control(control::RETRY_FAILED_EVENTS);
    }

    /// Ask the broker to replay the pending queue
    pub fn run_pending_events(&self) {
        self.send_control(control::RUN_PENDING_EVENTS);
    }

    fn send_control(&self, event: &str) {
        if !self.is_connected() {
            warn!(event = %event, "not connected; control command dropped");
            return;
        }
        if let Some(link) = self.inner.link.lock().unwrap().clone() {
            link.emit(event, Vec::new());
        }
    }

    #[cfg(test)]
    pub(crate) fn dial_attempts(&self) -> u32 {
        self.inner.dial_attempts.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn supervisor_finished(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap()
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().unwrap().take() {
            supervisor.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Supervisor
// ----------------------------------------------------------------------------

async fn supervise(inner: Arc<Inner>, policy: ReconnectPolicy) {
    let addr = inner.config.broker_addr();
    let keep_alive = inner.config.keep_alive;
    let mut consecutive_failures = 0u32;

    loop {
        inner.set_state(LinkState::Connecting);
        inner.dial_attempts.fetch_add(1, Ordering::SeqCst);

        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                // A successful connect resets the keep-alive budget.
                consecutive_failures = 0;
                run_link(&inner, stream).await;
                *inner.link.lock().unwrap() = None;
                inner.set_state(LinkState::Disconnected);
                warn!(addr = %addr, "link to broker closed");
            }
            Err(err) => {
                consecutive_failures += 1;
                inner.set_state(LinkState::Disconnected);
                error!(addr = %addr, %err, attempt = consecutive_failures, "failed to connect to broker");
            }
        }

        if !keep_alive {
            return;
        }
        if consecutive_failures >= policy.max_failures {
            warn!(
                attempts = consecutive_failures,
                "keep-alive budget exhausted; call connect() to resume"
            );
            return;
        }

        tokio::time::sleep(policy.interval).await;
    }
}

/// Drive one live connection until its socket goes away
async fn run_link(inner: &Arc<Inner>, stream: TcpStream) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            debug!(%err, "connection lost before it started");
            return;
        }
    };

    let (mut frames, handle) = framed(stream, peer);
    *inner.link.lock().unwrap() = Some(handle.clone());
    inner.set_state(LinkState::Authenticating);

    let payload = AuthorizePayload {
        secret_key_hash: inner.digest.to_string(),
        name: inner.config.name.clone(),
    };
    let payload = serde_json::to_value(&payload).unwrap_or(Value::Null);
    handle.emit(control::AUTHORIZE, vec![payload]);

    let authorized = authorized_channel(&inner.digest);
    let remove_from_pending = remove_from_pending_channel(&inner.digest);

    while let Some(envelope) = frames.next().await {
        if envelope.event == authorized {
            info!(peer = %peer, "connected to the broker");
            inner.set_state(LinkState::Connected);
            let hook = inner.on_authorized.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook();
            }
        } else if envelope.event == remove_from_pending {
            let Some(id) = envelope.first_arg_str() else {
                debug!("pending acknowledgement without an id; dropped");
                continue;
            };
            let id = EventId::from(id);
            if inner.pending.remove(&id) {
                // The acknowledgement must survive a crash, so skip the
                // debounce for this one.
                if let Err(err) = inner.pending.save_now() {
                    error!(%err, "could not persist pending acknowledgement");
                }
                debug!(%id, "pending event acknowledged");
            }
        } else if envelope.event == control::ERROR {
            error!(
                message = envelope.first_arg_str().unwrap_or("unknown"),
                "broker reported an error"
            );
        } else {
            debug!(event = %envelope.event, "unhandled broker event dropped");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &std::path::Path, port: u16) -> Arc<EventlineConfig> {
        Arc::new(EventlineConfig {
            secret_key: "secret".into(),
            host: "127.0.0.1".into(),
            port,
            keep_alive: true,
            log_args: false,
            name: Some("test".into()),
            environment: eventline_core::Environment::Development,
            storage: eventline_core::StorageConfig {
                pending_path: dir.join("pending.json"),
                failed_path: dir.join("failed.json"),
            },
        })
    }

    /// Pick a port with no listener behind it
    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn offline_emits_are_buffered_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let communicator = Communicator::open(test_config(dir.path(), 7001)).unwrap();

        let id = communicator.emit("hello", vec![json!(42)]).unwrap();
        let record = communicator.pending_events().get(&id).unwrap();
        assert_eq!(record.event, "hello");
        assert_eq!(record.args, vec![json!(42)]);

        // push buffers even though emit would too while offline
        let pushed = communicator.push("critical", vec![]);
        assert_ne!(id, pushed);
        assert_eq!(communicator.pending_events().len(), 2);
    }

    #[tokio::test]
    async fn keep_alive_gives_up_after_the_failure_cap() {
        let dir = tempfile::tempdir().unwrap();
        let port = dead_port().await;

        let communicator = Communicator::open(test_config(dir.path(), port))
            .unwrap()
            .with_policy(ReconnectPolicy {
                interval: Duration::from_millis(20),
                max_failures: 3,
            });

        communicator.connect();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(communicator.dial_attempts(), 3);
        assert!(communicator.supervisor_finished());

        // No further attempts happen on their own.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(communicator.dial_attempts(), 3);

        // An external connect() call starts a fresh budget.
        communicator.connect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(communicator.dial_attempts() > 3);
    }

    #[tokio::test]
    async fn control_commands_are_dropped_while_offline() {
        let dir = tempfile::tempdir().unwrap();
        let communicator = Communicator::open(test_config(dir.path(), 7001)).unwrap();

        // No panic, no pending record: control commands are connected-only.
        communicator.retry_failed_events();
        communicator.run_pending_events();
        assert!(communicator.pending_events().is_empty());
    }
}
