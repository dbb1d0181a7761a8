//! Eventline Runtime
//!
//! The broker (server role) and communicator (client role) of the Eventline
//! event link, plus the framed TCP transport and the event dispatch wrapper
//! that gives handlers at-least-once semantics: events emitted while offline
//! are buffered and replayed, handler failures are captured and retried.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod broker;
pub mod communicator;
pub mod dispatch;
pub mod errors;
pub mod router;
pub mod telemetry;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use broker::Broker;
pub use communicator::{Communicator, LinkState};
pub use dispatch::{Context, DispatchError, DispatchOrigin};
pub use errors::{Result, RuntimeError};
pub use router::{EventHandler, HandlerResult};
pub use transport::ConnectionHandle;
