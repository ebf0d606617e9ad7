//! Error taxonomy shared by the REST client, the push channel and the session actions.

use std::fmt;

use thiserror::Error;

/// Convenient result alias returning [`ApiError`] failures.
pub type ApiResult<T> = Result<T, ApiError>;

/// Failures that can occur while talking to the contest REST API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build contest API client")]
    ClientBuilder {
        /// Underlying builder error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The request never produced a response.
    #[error("failed to send contest API request to `{path}`")]
    RequestSend {
        /// Request path relative to the API base.
        path: String,
        /// Underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The server answered with a status the client does not understand.
    #[error("unexpected contest API response status {status} for `{path}`")]
    RequestStatus {
        /// Request path relative to the API base.
        path: String,
        /// HTTP status code.
        status: u16,
    },
    /// The server explicitly declined the request (4xx with a reason).
    #[error("contest API rejected `{path}`: {reason} ({message})")]
    Rejected {
        /// Request path relative to the API base.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Machine-readable reason from the error body.
        reason: String,
        /// Human-readable message from the error body.
        message: String,
    },
    /// Response payload could not be decoded.
    #[error("failed to decode contest API response for `{path}`")]
    DecodeResponse {
        /// Request path relative to the API base.
        path: String,
        /// Underlying decode error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ApiError {
    /// Whether the failure is a transport problem worth retrying, as opposed to an
    /// authoritative answer from the server.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RequestSend { .. } => true,
            ApiError::RequestStatus { status, .. } => *status >= 500 || *status == 429,
            ApiError::Rejected { .. } => false,
            ApiError::ClientBuilder { .. } | ApiError::DecodeResponse { .. } => false,
        }
    }
}

/// Failures raised by a push transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("failed to connect push transport: {0}")]
    Connect(String),
    /// Reading from an open connection failed.
    #[error("push transport receive error: {0}")]
    Receive(String),
    /// Polling fallback could not refresh the contest.
    #[error("polling transport failed")]
    Poll(#[source] ApiError),
    /// Too many malformed messages arrived on one connection.
    #[error("dropped {count} malformed messages on one connection")]
    TooManyMalformed {
        /// Malformed frames seen before giving up on the connection.
        count: u32,
    },
    /// The resync handshake did not complete in time.
    #[error("resync handshake timed out")]
    ResyncTimeout,
    /// The resync handshake failed outright.
    #[error("resync handshake failed")]
    Resync(#[source] ApiError),
}

/// Terminal outcome of a push channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Reconnection attempts exhausted the retry budget.
    #[error("push channel gave up after {attempts} failed attempts: {last_error}")]
    RetriesExhausted {
        /// Failed attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },
    /// The server announced that the contest is over.
    #[error("contest ended; push channel closed")]
    ContestEnded,
}

/// Inbound message could not be turned into a typed event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not valid JSON for any known message kind.
    #[error("malformed push message")]
    Malformed(#[from] serde_json::Error),
    /// The payload parsed but carries invalid values.
    #[error("invalid push message: {0}")]
    Invalid(String),
}

impl From<validator::ValidationErrors> for ProtocolError {
    fn from(err: validator::ValidationErrors) -> Self {
        ProtocolError::Invalid(err.to_string())
    }
}

/// Machine-readable reason attached to a failed `register`/`join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFailure {
    /// The action is not meaningful in the current phase.
    WrongPhase,
    /// The server declined the action; not retried automatically.
    Rejected {
        /// Reason reported by the server.
        reason: String,
    },
    /// The request failed in transit and may be retried.
    Transport,
    /// The phase changed while the request was in flight.
    Cancelled,
    /// The contest session shut down before the action completed.
    SessionClosed,
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionFailure::WrongPhase => f.write_str("wrong_phase"),
            ActionFailure::Rejected { reason } => write!(f, "rejected:{reason}"),
            ActionFailure::Transport => f.write_str("transport"),
            ActionFailure::Cancelled => f.write_str("cancelled"),
            ActionFailure::SessionClosed => f.write_str("session_closed"),
        }
    }
}

/// Error returned to callers of `register`/`join`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{action} failed ({failure}): {message}")]
pub struct ActionError {
    /// Which action failed.
    pub action: &'static str,
    /// Machine-readable classification.
    pub failure: ActionFailure,
    /// Human-readable detail.
    pub message: String,
}

impl ActionError {
    /// Build an action error from its parts.
    pub fn new(action: &'static str, failure: ActionFailure, message: impl Into<String>) -> Self {
        Self {
            action,
            failure,
            message: message.into(),
        }
    }

    /// Translate a REST failure into an action error, keeping the rejection reason.
    pub fn from_api(action: &'static str, err: &ApiError) -> Self {
        match err {
            ApiError::Rejected {
                reason, message, ..
            } => Self::new(
                action,
                ActionFailure::Rejected {
                    reason: reason.clone(),
                },
                message.clone(),
            ),
            other if other.is_retryable() => {
                Self::new(action, ActionFailure::Transport, other.to_string())
            }
            other => Self::new(
                action,
                ActionFailure::Rejected {
                    reason: "unexpected_response".into(),
                },
                other.to_string(),
            ),
        }
    }

    /// Whether the caller may retry the action as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.failure,
            ActionFailure::Transport | ActionFailure::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_keeps_reason_and_is_terminal() {
        let api = ApiError::Rejected {
            path: "contests/7/register".into(),
            status: 409,
            reason: "contest_full".into(),
            message: "no seats left".into(),
        };
        let err = ActionError::from_api("register", &api);
        assert_eq!(
            err.failure,
            ActionFailure::Rejected {
                reason: "contest_full".into()
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable_transport_failures() {
        let api = ApiError::RequestStatus {
            path: "contests/7/join".into(),
            status: 503,
        };
        assert!(api.is_retryable());
        let err = ActionError::from_api("join", &api);
        assert_eq!(err.failure, ActionFailure::Transport);
        assert!(err.is_retryable());
    }
}
