//! ---
//! courier_section: "02-messaging-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message envelopes and broker transports."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Message, Result};

/// Shared handle to a broker connection.
pub type BrokerPtr = Arc<dyn Broker>;

/// One logical connection to a message broker.
///
/// Every operation is safe to call concurrently from many tasks; the RPC client shares one
/// connection between all in-flight requests of a process.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable queue. Declaring an existing queue is a no-op.
    async fn declare_durable(&self, queue: &str) -> Result<()>;

    /// Declare an exclusive, auto-deleting queue and return its broker-assigned name.
    async fn declare_ephemeral(&self) -> Result<String>;

    /// Declare an ephemeral queue that must stay usable for at least `lifetime`.
    ///
    /// Backends whose ephemeral queues never expire on their own ignore `lifetime`.
    async fn declare_reply_queue(&self, lifetime: Duration) -> Result<String> {
        let _ = lifetime;
        self.declare_ephemeral().await
    }

    /// Publish a message to a named queue. Messages for unknown queues are dropped.
    async fn publish(&self, queue: &str, message: Message) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement.
    async fn subscribe(&self, queue: &str) -> Result<Subscription>;

    /// Delete a queue. Deleting an unknown queue is a no-op.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Close the connection, cancelling its consumers and dropping its exclusive queues.
    async fn close(&self) -> Result<()>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Human-readable backend name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Opaque broker-assigned identifier of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub String);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend hook settling deliveries.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge a delivery so the broker never redelivers it.
    async fn ack(&self, tag: &DeliveryTag) -> Result<()>;
}

/// A message handed to a consumer, pending acknowledgement.
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: String,
    /// The delivered message.
    pub message: Message,
    /// Whether the broker delivered this message before without receiving an ack.
    pub redelivered: bool,
    tag: DeliveryTag,
    acker: Arc<dyn Acknowledger>,
    acked: AtomicBool,
}

impl Delivery {
    /// Construct a delivery; used by broker backends.
    pub fn new(
        queue: impl Into<String>,
        message: Message,
        redelivered: bool,
        tag: DeliveryTag,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            message,
            redelivered,
            tag,
            acker,
            acked: AtomicBool::new(false),
        }
    }

    /// Broker-assigned delivery tag.
    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    /// Acknowledge the delivery. Repeated calls are no-ops.
    pub async fn ack(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.acker.ack(&self.tag).await
    }

    /// Whether [`Delivery::ack`] has been called.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("redelivered", &self.redelivered)
            .field("correlation_id", &self.message.correlation_id())
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Live consumer on a queue. Dropping it cancels the consumer.
pub struct Subscription {
    queue: String,
    inbox: mpsc::Receiver<Delivery>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Construct a subscription; `on_cancel` runs exactly once when it is dropped.
    pub fn new(
        queue: impl Into<String>,
        inbox: mpsc::Receiver<Delivery>,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            queue: queue.into(),
            inbox,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Queue this subscription consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery. `None` means the consumer was cancelled by the broker
    /// (queue deleted, connection closed).
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inbox.recv().await
    }

    /// Take a delivery that has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.inbox.try_recv().ok()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inbox.close();
        if let Some(cancel) = self.on_cancel.take() {
            cancel();
        }
    }
}
