//! Eventline Core
//!
//! Protocol types, wire framing, authentication digests, and the durable
//! event queues for the Eventline event link. This crate has no socket I/O;
//! the broker and communicator roles live in `eventline-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod auth;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod record;
pub mod store;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use auth::SecretDigest;
pub use config::{Environment, EventlineConfig, StorageConfig};
pub use envelope::{authorized_channel, control, remove_from_pending_channel, AuthorizePayload, Envelope};
pub use errors::{ConfigError, EventlineError, FrameError, Result, StoreError};
pub use record::{ErrorDetails, FailedEvent, PendingEvent, RetryAttempt};
pub use store::{FailedStore, PendingStore};
pub use types::{EventId, Timestamp};
