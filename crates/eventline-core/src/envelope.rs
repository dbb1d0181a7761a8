//! Wire envelopes and reserved control events
//!
//! An envelope is one named event with its argument list, the unit both
//! roles exchange over the framed transport. This module also defines the
//! reserved event names that drive authentication and acknowledgement.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::SecretDigest;

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// One framed unit of `{event, args}` on the wire
///
/// Envelopes carry no id; delivery identity is assigned locally by the
/// sender (pending queue) or receiver (dispatch wrapper).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name
    pub event: String,
    /// Event arguments, in call order
    pub args: Vec<Value>,
}

impl Envelope {
    /// Create an envelope for an event with arguments
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Create an envelope for an event with no arguments
    pub fn bare(event: impl Into<String>) -> Self {
        Self::new(event, Vec::new())
    }

    /// First argument as a string, if present
    pub fn first_arg_str(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }
}

// ----------------------------------------------------------------------------
// Reserved Control Events
// ----------------------------------------------------------------------------

/// Reserved event names used by the protocol itself
pub mod control {
    /// Client → server: authentication handshake, `AuthorizePayload` argument
    pub const AUTHORIZE: &str = "Authorize";

    /// Server → client: generic error report, string argument
    pub const ERROR: &str = "error";

    /// Client → server: force-retry the failed queue, ignoring retry budgets
    pub const RETRY_FAILED_EVENTS: &str = "$retryFailedEvents";

    /// Client → server: replay the pending queue
    pub const RUN_PENDING_EVENTS: &str = "$runPendingEvents";

    /// Prefix of the digest-parameterized authorization confirmation
    pub const AUTHORIZED_PREFIX: &str = "Authorized:";

    /// Prefix of the digest-parameterized pending acknowledgement
    pub const REMOVE_FROM_PENDING_PREFIX: &str = "RemoveFromPending:";
}

/// Name of the `Authorized:<digest>` confirmation channel
///
/// The digest parameterizes the channel so differently-keyed peers cannot
/// cross-talk.
pub fn authorized_channel(digest: &SecretDigest) -> String {
    format!("{}{}", control::AUTHORIZED_PREFIX, digest)
}

/// Name of the `RemoveFromPending:<digest>` acknowledgement channel
pub fn remove_from_pending_channel(digest: &SecretDigest) -> String {
    format!("{}{}", control::REMOVE_FROM_PENDING_PREFIX, digest)
}

// ----------------------------------------------------------------------------
// Authorize Payload
// ----------------------------------------------------------------------------

/// Payload of the `Authorize` handshake event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizePayload {
    /// Hex SHA-256 digest of the shared secret; the plaintext never
    /// crosses the wire
    pub secret_key_hash: String,
    /// Optional human-readable communicator name, for log lines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_names_embed_the_digest() {
        let digest = SecretDigest::derive("top-secret");
        let authorized = authorized_channel(&digest);
        let remove = remove_from_pending_channel(&digest);

        assert!(authorized.starts_with("Authorized:"));
        assert!(remove.starts_with("RemoveFromPending:"));
        assert!(authorized.ends_with(digest.as_str()));
        assert_ne!(
            authorized_channel(&SecretDigest::derive("other")),
            authorized
        );
    }

    #[test]
    fn authorize_payload_uses_camel_case_keys() {
        let payload = AuthorizePayload {
            secret_key_hash: "abc".into(),
            name: Some("worker-1".into()),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["secretKeyHash"], "abc");
        assert_eq!(value["name"], "worker-1");
    }

    #[test]
    fn first_arg_str_reads_only_strings() {
        let envelope = Envelope::new("ack", vec![json!("id-1"), json!(2)]);
        assert_eq!(envelope.first_arg_str(), Some("id-1"));
        assert_eq!(Envelope::bare("ping").first_arg_str(), None);
    }
}
