//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use courier_msg::{error_codes, CorrelationId, ErrorReply, TransportError};
use thiserror::Error;

/// Failures surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The broker could not be reached, or the connection dropped mid-request.
    #[error("broker connection unavailable: {0}")]
    Connection(String),
    /// No correlated reply arrived within the request timeout.
    #[error("no reply from '{queue}' within {timeout:?}")]
    Timeout { queue: String, timeout: Duration },
    /// The remote service answered with an error-shaped reply.
    #[error("remote service error: {message}")]
    Remote {
        code: Option<String>,
        message: String,
    },
    /// The request payload could not be serialized.
    #[error("request payload could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
    /// The reply body was not valid JSON.
    #[error("reply body could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
    /// A correlation id was already registered as in flight.
    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelation(CorrelationId),
    /// No handler is registered for the action.
    #[error("no handler registered for action '{0}'")]
    NoSuchAction(String),
    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Transport(#[source] TransportError),
}

impl RpcError {
    /// Whether the failure is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Whether the failure is a connection problem.
    pub fn is_connection(&self) -> bool {
        matches!(self, RpcError::Connection(_))
    }

    /// Convert an error-shaped reply body into [`RpcError::Remote`].
    pub fn from_reply(reply: ErrorReply) -> Self {
        RpcError::Remote {
            code: reply.code,
            message: reply.error,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => RpcError::Connection(err.to_string()),
            other => RpcError::Transport(other),
        }
    }
}

/// Failures returned by action handlers. The dispatcher turns them into error replies.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Domain-level rejection, e.g. invalid credentials.
    #[error("{0}")]
    Domain(String),
    /// The payload did not match what the handler expects.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    /// Unexpected failure inside the handler.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Domain error with a message meant for the caller.
    pub fn domain(message: impl Into<String>) -> Self {
        HandlerError::Domain(message.into())
    }

    /// Error-shaped reply describing this failure.
    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply::new(error_codes::HANDLER_ERROR, self.to_string())
    }
}

/// Failures building an action registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The action name was registered twice.
    #[error("action '{0}' is already registered")]
    Duplicate(String),
    /// Action names must not be empty.
    #[error("action names cannot be empty")]
    EmptyName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_transport_maps_to_connection_error() {
        assert!(RpcError::from(TransportError::Closed).is_connection());
        assert!(matches!(
            RpcError::from(TransportError::QueueNotFound("q".into())),
            RpcError::Transport(_)
        ));
    }

    #[test]
    fn remote_errors_keep_reply_code() {
        let err = RpcError::from_reply(ErrorReply::new(error_codes::NO_SUCH_ACTION, "nope"));
        match err {
            RpcError::Remote { code, message } => {
                assert_eq!(code.as_deref(), Some(error_codes::NO_SUCH_ACTION));
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn handler_errors_render_as_replies() {
        let reply = HandlerError::domain("Invalid credentials").to_reply();
        assert_eq!(reply.error, "Invalid credentials");
        assert_eq!(reply.code.as_deref(), Some(error_codes::HANDLER_ERROR));
    }
}
