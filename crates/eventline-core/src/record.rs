//! Queue records for the durable event stores
//!
//! A `PendingEvent` is an outbound event buffered by the communicator while
//! disconnected. A `FailedEvent` is an inbound event whose handler failed,
//! recorded by the broker for retry. Both persist as camelCase JSON in the
//! role's snapshot file.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Error Details
// ----------------------------------------------------------------------------

/// Captured shape of a handler failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// Display form of the error
    pub message: String,
    /// Full error chain, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorDetails {
    /// Capture an application error and its chain
    pub fn capture(error: &(dyn std::error::Error + 'static)) -> Self {
        let message = error.to_string();
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message,
            detail: (!chain.is_empty()).then(|| chain.join(": ")),
        }
    }

    /// Build from a bare message
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Retry Attempt
// ----------------------------------------------------------------------------

/// One failed re-attempt of a previously failed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// When the re-attempt ran
    pub at: Timestamp,
    /// Why it failed
    pub error: ErrorDetails,
}

// ----------------------------------------------------------------------------
// Pending Event
// ----------------------------------------------------------------------------

/// An outbound event buffered because the communicator was offline
///
/// Owned exclusively by the communicator-side store; removed when the broker
/// confirms successful processing of a replayed copy, or when an operator
/// flushes the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEvent {
    /// Event name
    pub event: String,
    /// Event arguments
    pub args: Vec<Value>,
    /// When the event was buffered
    pub added_at: Timestamp,
}

impl PendingEvent {
    /// Buffer an event now
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
            added_at: Timestamp::now(),
        }
    }
}

// ----------------------------------------------------------------------------
// Failed Event
// ----------------------------------------------------------------------------

/// An inbound event whose handler failed, awaiting retry
///
/// Owned exclusively by the broker-side store. Subsequent failed re-attempts
/// append to `retries` and replace `last_error`; they never create a new
/// record, so the id stays stable for the record's whole life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    /// Event name
    pub event: String,
    /// Original event arguments, kept for re-invocation
    pub args: Vec<Value>,
    /// When the first failure was recorded
    pub added_at: Timestamp,
    /// The most recent failure
    pub last_error: ErrorDetails,
    /// Failed re-attempts, oldest first; empty until the first retry fails
    #[serde(default)]
    pub retries: Vec<RetryAttempt>,
}

impl FailedEvent {
    /// Record a first failure now
    pub fn new(event: impl Into<String>, args: Vec<Value>, error: ErrorDetails) -> Self {
        Self {
            event: event.into(),
            args,
            added_at: Timestamp::now(),
            last_error: error,
            retries: Vec::new(),
        }
    }

    /// Record a failed re-attempt
    pub fn record_retry(&mut self, error: ErrorDetails) {
        self.retries.push(RetryAttempt {
            at: Timestamp::now(),
            error: error.clone(),
        });
        self.last_error = error;
    }

    /// Number of failed re-attempts so far
    pub fn retry_count(&self) -> usize {
        self.retries.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_event_accumulates_retries_in_place() {
        let mut failed = FailedEvent::new(
            "ship",
            vec![json!("x")],
            ErrorDetails::from_message("boom"),
        );
        assert_eq!(failed.retry_count(), 0);
        assert_eq!(failed.last_error.message, "boom");

        failed.record_retry(ErrorDetails::from_message("still boom"));
        assert_eq!(failed.retry_count(), 1);
        assert_eq!(failed.last_error.message, "still boom");
        assert_eq!(failed.retries[0].error.message, "still boom");
    }

    #[test]
    fn snapshot_keys_are_camel_case() {
        let pending = PendingEvent::new("hello", vec![json!(42)]);
        let value = serde_json::to_value(&pending).unwrap();
        assert!(value.get("addedAt").is_some());

        let failed = FailedEvent::new("hello", vec![], ErrorDetails::from_message("e"));
        let value = serde_json::to_value(&failed).unwrap();
        assert!(value.get("lastError").is_some());
        assert_eq!(value["retries"], json!([]));
    }

    #[test]
    fn error_capture_walks_the_source_chain() {
        let error = anyhow::anyhow!("root cause").context("while shipping");
        let details = ErrorDetails::capture(error.as_ref());

        assert_eq!(details.message, "while shipping");
        assert_eq!(details.detail.as_deref(), Some("root cause"));
    }
}
