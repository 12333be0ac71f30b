//! ---
//! courier_section: "02-messaging-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message envelopes and broker transports."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! In-process broker.
//!
//! This is the reference implementation of the transport semantics the RPC layer relies on:
//!
//! - durable queues survive for the lifetime of the [`MemoryBroker`] and support competing
//!   consumers (round-robin, bounded by a per-consumer prefetch of unacknowledged deliveries);
//! - ephemeral queues are exclusive to the [`MemoryConnection`] that declared them and are
//!   removed when it closes, when explicitly deleted, or when their last consumer cancels;
//! - unacknowledged deliveries go back to the head of the queue, flagged `redelivered`, when
//!   their consumer is cancelled;
//! - publishing to an unknown queue drops the message.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::transport::{Acknowledger, Broker, Delivery, DeliveryTag, Subscription};
use crate::{Message, Result, TransportError};

const DEFAULT_PREFETCH: usize = 32;

type SharedState = Arc<Mutex<BrokerState>>;

/// Shared broker state. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: SharedState,
}

struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_id: u64,
    prefetch: usize,
}

struct QueueState {
    durable: bool,
    exclusive_owner: Option<u64>,
    auto_delete: bool,
    ready: VecDeque<Pending>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
    next_tag: u64,
}

struct Pending {
    message: Message,
    redelivered: bool,
}

struct ConsumerState {
    id: u64,
    connection: u64,
    sender: mpsc::Sender<Delivery>,
    unacked: BTreeMap<u64, Message>,
}

impl QueueState {
    fn new(durable: bool, exclusive_owner: Option<u64>, auto_delete: bool) -> Self {
        Self {
            durable,
            exclusive_owner,
            auto_delete,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            next_tag: 0,
        }
    }

    fn requeue(&mut self, consumer: ConsumerState) {
        for (_, message) in consumer.unacked.into_iter().rev() {
            self.ready.push_front(Pending {
                message,
                redelivered: true,
            });
        }
    }

    fn remove_consumer(&mut self, consumer_id: u64) -> bool {
        let Some(index) = self.consumers.iter().position(|c| c.id == consumer_id) else {
            return false;
        };
        let consumer = self.consumers.remove(index);
        self.requeue(consumer);
        self.cursor = 0;
        true
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn pump(&mut self, name: &str, prefetch: usize, state: &Weak<Mutex<BrokerState>>) {
        while !self.ready.is_empty() && !self.consumers.is_empty() {
            let count = self.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (self.cursor + offset) % count)
                .find(|&i| self.consumers[i].unacked.len() < prefetch)
            else {
                break;
            };
            self.cursor = (index + 1) % count;
            let Some(pending) = self.ready.pop_front() else {
                break;
            };
            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer_id = self.consumers[index].id;
            let acker = Arc::new(MemoryAcker {
                state: state.clone(),
                queue: name.to_owned(),
                consumer: consumer_id,
            });
            let delivery = Delivery::new(
                name,
                pending.message.clone(),
                pending.redelivered,
                DeliveryTag(tag.to_string()),
                acker,
            );
            match self.consumers[index].sender.try_send(delivery) {
                Ok(()) => {
                    trace!(queue = %name, consumer = consumer_id, tag, "delivered");
                    self.consumers[index]
                        .unacked
                        .insert(tag, pending.message);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.ready.push_front(pending);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.ready.push_front(pending);
                    self.remove_consumer(consumer_id);
                }
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker with the default prefetch.
    pub fn new() -> Self {
        Self::with_prefetch(DEFAULT_PREFETCH)
    }

    /// Create an empty broker limiting each consumer to `prefetch` unacknowledged deliveries.
    pub fn with_prefetch(prefetch: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues: HashMap::new(),
                next_id: 0,
                prefetch: prefetch.max(1),
            })),
        }
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.next_id
        };
        debug!(connection = id, "memory broker connection opened");
        Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
            open: AtomicBool::new(true),
        })
    }

    /// Whether a queue with this name exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Number of queues currently declared.
    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Whether the named queue is durable.
    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.state.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Number of messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Number of delivered but unacknowledged messages.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.unacked.len()).sum())
            .unwrap_or(0)
    }

    /// Number of active consumers.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }
}

/// One connection to a [`MemoryBroker`]. Dropping it closes the connection.
pub struct MemoryConnection {
    id: u64,
    state: SharedState,
    open: AtomicBool,
}

impl MemoryConnection {
    /// Connection identifier, unique within its broker.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.state);
        let mut state = self.state.lock();
        let prefetch = state.prefetch;
        state
            .queues
            .retain(|_, queue| queue.exclusive_owner != Some(self.id));
        for (name, queue) in state.queues.iter_mut() {
            let owned: Vec<u64> = queue
                .consumers
                .iter()
                .filter(|c| c.connection == self.id)
                .map(|c| c.id)
                .collect();
            if owned.is_empty() {
                continue;
            }
            for consumer_id in owned {
                queue.remove_consumer(consumer_id);
            }
            queue.pump(name, prefetch, &weak);
        }
        debug!(connection = self.id, "memory broker connection closed");
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Broker for MemoryConnection {
    async fn declare_durable(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        match state.queues.get(queue) {
            Some(existing) => match existing.exclusive_owner {
                Some(owner) if owner != self.id => {
                    Err(TransportError::ResourceLocked(queue.to_owned()))
                }
                _ => Ok(()),
            },
            None => {
                state
                    .queues
                    .insert(queue.to_owned(), QueueState::new(true, None, false));
                debug!(queue, "durable queue declared");
                Ok(())
            }
        }
    }

    async fn declare_ephemeral(&self) -> Result<String> {
        self.ensure_open()?;
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.state.lock().queues.insert(
            name.clone(),
            QueueState::new(false, Some(self.id), true),
        );
        trace!(queue = %name, connection = self.id, "ephemeral queue declared");
        Ok(name)
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        self.ensure_open()?;
        let weak = Arc::downgrade(&self.state);
        let mut state = self.state.lock();
        let prefetch = state.prefetch;
        match state.queues.get_mut(queue) {
            Some(target) => {
                target.ready.push_back(Pending {
                    message,
                    redelivered: false,
                });
                target.pump(queue, prefetch, &weak);
            }
            None => {
                debug!(queue, "dropping message published to unknown queue");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let weak = Arc::downgrade(&self.state);
        let mut state = self.state.lock();
        state.next_id += 1;
        let consumer_id = state.next_id;
        let prefetch = state.prefetch;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_owned()))?;
        if matches!(target.exclusive_owner, Some(owner) if owner != self.id) {
            return Err(TransportError::ResourceLocked(queue.to_owned()));
        }

        let (sender, inbox) = mpsc::channel(prefetch);
        target.consumers.push(ConsumerState {
            id: consumer_id,
            connection: self.id,
            sender,
            unacked: BTreeMap::new(),
        });
        target.pump(queue, prefetch, &weak);

        let name = queue.to_owned();
        Ok(Subscription::new(queue, inbox, move || {
            cancel_consumer(&weak, &name, consumer_id)
        }))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let removed = {
            let mut state = self.state.lock();
            if let Some(existing) = state.queues.get(queue) {
                if matches!(existing.exclusive_owner, Some(owner) if owner != self.id) {
                    return Err(TransportError::ResourceLocked(queue.to_owned()));
                }
            }
            state.queues.remove(queue)
        };
        if let Some(removed) = removed {
            trace!(
                queue,
                dropped = removed.ready.len(),
                consumers = removed.consumers.len(),
                "queue deleted"
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

fn cancel_consumer(state: &Weak<Mutex<BrokerState>>, queue: &str, consumer_id: u64) {
    let Some(shared) = state.upgrade() else {
        return;
    };
    let mut guard = shared.lock();
    let prefetch = guard.prefetch;
    let Some(target) = guard.queues.get_mut(queue) else {
        return;
    };
    if !target.remove_consumer(consumer_id) {
        return;
    }
    if target.auto_delete && target.consumers.is_empty() {
        guard.queues.remove(queue);
        trace!(queue, "auto-delete queue removed after last consumer cancelled");
    } else {
        target.pump(queue, prefetch, state);
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    consumer: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        let Some(shared) = self.state.upgrade() else {
            return Err(TransportError::Closed);
        };
        let tag_value: u64 = tag
            .0
            .parse()
            .map_err(|_| TransportError::Backend(format!("malformed delivery tag {}", tag)))?;
        let mut guard = shared.lock();
        let prefetch = guard.prefetch;
        let Some(target) = guard.queues.get_mut(&self.queue) else {
            trace!(queue = %self.queue, %tag, "ack for deleted queue ignored");
            return Ok(());
        };
        let settled = target
            .consumers
            .iter_mut()
            .find(|c| c.id == self.consumer)
            .and_then(|c| c.unacked.remove(&tag_value))
            .is_some();
        if settled {
            target.pump(&self.queue, prefetch, &self.state);
        } else {
            debug!(queue = %self.queue, %tag, "ack for unknown delivery ignored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(subscription: &mut Subscription) -> Delivery {
        timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("delivery within timeout")
            .expect("subscription open")
    }

    #[tokio::test]
    async fn durable_declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.declare_durable("user_requests").await.unwrap();
        conn.publish("user_requests", Message::new("a")).await.unwrap();
        conn.declare_durable("user_requests").await.unwrap();
        assert_eq!(broker.ready_count("user_requests"), 1);
        assert_eq!(broker.is_durable("user_requests"), Some(true));
    }

    #[tokio::test]
    async fn competing_consumers_share_a_queue() {
        let broker = MemoryBroker::with_prefetch(1);
        let conn = broker.connect();
        conn.declare_durable("jobs").await.unwrap();
        let mut first = conn.subscribe("jobs").await.unwrap();
        let mut second = conn.subscribe("jobs").await.unwrap();

        for i in 0..4 {
            conn.publish("jobs", Message::new(format!("job-{i}"))).await.unwrap();
        }

        let a = next(&mut first).await;
        let b = next(&mut second).await;
        assert_ne!(a.message.body, b.message.body);
        assert_eq!(broker.ready_count("jobs"), 2);

        a.ack().await.unwrap();
        b.ack().await.unwrap();
        let c = next(&mut first).await;
        let d = next(&mut second).await;
        c.ack().await.unwrap();
        d.ack().await.unwrap();
        assert_eq!(broker.ready_count("jobs"), 0);
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn unacked_deliveries_are_redelivered_after_cancel() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.declare_durable("jobs").await.unwrap();
        conn.publish("jobs", Message::new("first")).await.unwrap();
        conn.publish("jobs", Message::new("second")).await.unwrap();

        let mut consumer = conn.subscribe("jobs").await.unwrap();
        let first = next(&mut consumer).await;
        assert!(!first.redelivered);
        first.ack().await.unwrap();
        let second = next(&mut consumer).await;
        drop(second);
        drop(consumer);

        assert_eq!(broker.ready_count("jobs"), 1);
        let mut restarted = conn.subscribe("jobs").await.unwrap();
        let again = next(&mut restarted).await;
        assert!(again.redelivered);
        assert_eq!(&again.message.body[..], b"second");
        again.ack().await.unwrap();
        assert!(restarted.try_recv().is_none());
    }

    #[tokio::test]
    async fn repeated_ack_is_a_no_op() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.declare_durable("jobs").await.unwrap();
        conn.publish("jobs", Message::new("x")).await.unwrap();
        let mut consumer = conn.subscribe("jobs").await.unwrap();
        let delivery = next(&mut consumer).await;
        delivery.ack().await.unwrap();
        delivery.ack().await.unwrap();
        assert!(delivery.is_acked());
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn ephemeral_queues_are_exclusive_and_auto_deleted() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let other = broker.connect();
        let reply = owner.declare_ephemeral().await.unwrap();
        assert!(reply.starts_with("amq.gen-"));

        assert!(matches!(
            other.subscribe(&reply).await,
            Err(TransportError::ResourceLocked(_))
        ));
        other.publish(&reply, Message::new("reply")).await.unwrap();

        let mut subscription = owner.subscribe(&reply).await.unwrap();
        let delivery = next(&mut subscription).await;
        delivery.ack().await.unwrap();
        drop(subscription);
        assert!(!broker.queue_exists(&reply));
    }

    #[tokio::test]
    async fn only_the_owner_deletes_an_exclusive_queue() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let other = broker.connect();
        let reply = owner.declare_ephemeral().await.unwrap();

        assert!(matches!(
            other.delete_queue(&reply).await,
            Err(TransportError::ResourceLocked(_))
        ));
        assert!(broker.queue_exists(&reply));

        owner.delete_queue(&reply).await.unwrap();
        assert!(!broker.queue_exists(&reply));
    }

    #[tokio::test]
    async fn closing_a_connection_ends_its_subscriptions() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.declare_durable("jobs").await.unwrap();
        let reply = conn.declare_ephemeral().await.unwrap();
        let mut subscription = conn.subscribe("jobs").await.unwrap();

        conn.close().await.unwrap();
        assert!(!conn.is_open());
        assert!(subscription.recv().await.is_none());
        assert!(!broker.queue_exists(&reply));
        assert!(broker.queue_exists("jobs"));
        assert!(matches!(
            conn.publish("jobs", Message::new("x")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn publishing_to_unknown_queue_drops_message() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.publish("nowhere", Message::new("x")).await.unwrap();
        assert!(!broker.queue_exists("nowhere"));
        assert!(matches!(
            conn.subscribe("nowhere").await,
            Err(TransportError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_a_queue_ends_consumers() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let reply = conn.declare_ephemeral().await.unwrap();
        let mut subscription = conn.subscribe(&reply).await.unwrap();
        conn.delete_queue(&reply).await.unwrap();
        conn.delete_queue(&reply).await.unwrap();
        assert!(subscription.recv().await.is_none());
    }
}
