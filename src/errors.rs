//! Control-plane error types.
//!
//! Store failures are surfaced to callers, listener failures are isolated
//! and only logged, and invalid requests are rejected before they reach
//! any shared state.

use thiserror::Error;

/// Errors raised by the coordination layer.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The mastership store failed or did not answer in time.
    ///
    /// Never retried internally; the caller owns retry and backoff.
    #[error("mastership store unavailable during {op}: {source}")]
    StoreUnavailable {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A request or configuration value that can never succeed.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A single listener callback failed. Other listeners still run.
    #[error("listener {listener} failed: {message}")]
    ListenerFailure { listener: String, message: String },
}

impl ControlError {
    /// Wrap a store error for operation `op`.
    pub fn store(op: &'static str, source: anyhow::Error) -> Self {
        ControlError::StoreUnavailable { op, source }
    }

    /// Build an [`ControlError::InvalidRequest`] from anything printable.
    pub fn invalid(message: impl Into<String>) -> Self {
        ControlError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Short machine-friendly code, logged as the `code` field of every
    /// failure warning.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::StoreUnavailable { .. } => "StoreUnavailable",
            ControlError::InvalidRequest { .. } => "InvalidRequest",
            ControlError::ListenerFailure { .. } => "ListenerFailure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_message_keeps_source() {
        let err = ControlError::store("set_role", anyhow::anyhow!("connection refused"));
        assert_eq!(err.code(), "StoreUnavailable");
        assert_eq!(
            err.to_string(),
            "mastership store unavailable during set_role: connection refused"
        );
    }

    #[test]
    fn test_invalid_request_code() {
        let err = ControlError::invalid("max_events must be positive");
        assert_eq!(err.code(), "InvalidRequest");
        assert!(err.to_string().contains("max_events"));
    }

    #[test]
    fn test_listener_failure_code() {
        let err = ControlError::ListenerFailure {
            listener: "replica-info".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.code(), "ListenerFailure");
        assert_eq!(err.to_string(), "listener replica-info failed: boom");
    }
}
