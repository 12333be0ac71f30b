//! ---
//! courier_section: "02-messaging-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message envelopes and broker transports."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Message envelopes and the broker transport abstraction.
//!
//! A [`Broker`] is one logical connection to a message broker. It declares durable and
//! ephemeral queues, publishes [`Message`]s carrying correlation metadata, and hands out
//! [`Subscription`]s whose [`Delivery`]s must be acknowledged explicitly. Two backends ship
//! with the crate: [`MemoryBroker`] (in-process, reference semantics) and [`RedisBroker`]
//! (Redis Streams with consumer groups).

pub mod memory;
pub mod redis_streams;
pub mod transport;
pub mod types;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures raised by broker transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection backing this transport is closed.
    #[error("broker connection is closed")]
    Closed,
    /// The queue does not exist on the broker.
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),
    /// The queue is exclusive to another connection.
    #[error("queue '{0}' is locked by another connection")]
    ResourceLocked(String),
    /// Failure reported by the broker backend itself.
    #[error("broker backend error: {0}")]
    Backend(String),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the failure means the connection must be re-established.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

pub use memory::{MemoryBroker, MemoryConnection};
pub use redis_streams::{default_consumer_name, RedisBroker, RedisBrokerConfig};
pub use transport::{Acknowledger, Broker, BrokerPtr, Delivery, DeliveryTag, Subscription};
pub use types::{
    error_codes, ActionRequest, CorrelationId, ErrorReply, Message, MessageProperties,
    CONTENT_TYPE_JSON,
};
