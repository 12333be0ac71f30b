//! ---
//! courier_section: "02-messaging-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message envelopes and broker transports."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Redis Streams broker.
//!
//! Each queue is a stream with one consumer group. Competing consumers share the group;
//! entries stay in the group's pending list until `XACK`. Every subscription on a queue
//! holds its own consumer slot (`<consumer_name>-<slot>`), and a subscription restarting in
//! the same slot reads that slot's pending entries again before new ones.
//!
//! Ephemeral queues are uniquely named streams with a TTL that the owning connection
//! deletes on close. All reply streams of one connection are read by a single task over one
//! extra Redis connection, so concurrent requests do not each open a socket.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Value};
use tokio::sync::{mpsc, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::transport::{Acknowledger, Broker, Delivery, DeliveryTag, Subscription};
use crate::types::{CorrelationId, MessageProperties};
use crate::{Message, Result, TransportError};

const FIELD_BODY: &str = "body";
const FIELD_CORRELATION_ID: &str = "correlation_id";
const FIELD_REPLY_TO: &str = "reply_to";
const FIELD_MESSAGE_ID: &str = "message_id";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_CONTENT_TYPE: &str = "content_type";

const REPLY_STREAM_PREFIX: &str = "courier.reply.";
/// Extra lifetime given to a reply stream beyond the caller's timeout.
const REPLY_TTL_MARGIN: Duration = Duration::from_secs(30);
/// Longest a reply read blocks, so newly registered reply streams join quickly.
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Connection settings for [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Consumer group shared by all consumers of a queue.
    pub group: String,
    /// Base consumer name inside the group; keep it stable across restarts. Each
    /// subscription appends its slot index.
    pub consumer_name: String,
    /// Minimum expiry applied to ephemeral reply streams.
    pub reply_queue_ttl: Duration,
    /// How long one `XREADGROUP` call blocks before polling again.
    pub block_interval: Duration,
    /// Maximum entries fetched per read and buffered per subscription.
    pub prefetch: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
            group: "courier".to_owned(),
            consumer_name: default_consumer_name(),
            reply_queue_ttl: Duration::from_secs(300),
            block_interval: Duration::from_millis(1000),
            prefetch: 32,
        }
    }
}

/// Host name when available, otherwise a random identifier.
pub fn default_consumer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4().simple()))
}

/// Consumer name used by one subscription slot.
fn slot_consumer_name(base: &str, slot: usize) -> String {
    format!("{}-{}", base, slot)
}

/// Expiry in seconds for a reply stream that must outlive `lifetime`.
fn reply_stream_ttl(configured: Duration, lifetime: Duration) -> u64 {
    configured
        .max(lifetime.saturating_add(REPLY_TTL_MARGIN))
        .as_secs()
        .max(1)
}

/// Per-queue consumer slots held by live subscriptions. Released slots are reused lowest
/// first, so a restarted subscriber takes over the pending entries of the slot it left.
#[derive(Debug, Default)]
struct ConsumerSlots {
    taken: HashMap<String, BTreeSet<usize>>,
}

impl ConsumerSlots {
    fn claim(&mut self, queue: &str) -> usize {
        let taken = self.taken.entry(queue.to_owned()).or_default();
        let mut slot = 0;
        while taken.contains(&slot) {
            slot += 1;
        }
        taken.insert(slot);
        slot
    }

    fn release(&mut self, queue: &str, slot: usize) {
        if let Some(taken) = self.taken.get_mut(queue) {
            taken.remove(&slot);
            if taken.is_empty() {
                self.taken.remove(queue);
            }
        }
    }
}

/// Broker connection backed by Redis Streams.
pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: RedisBrokerConfig,
    open: Arc<AtomicBool>,
    ephemeral: Mutex<HashSet<String>>,
    slots: Arc<Mutex<ConsumerSlots>>,
    replies: OnceCell<ReplyRouter>,
}

impl RedisBroker {
    /// Connect to Redis.
    pub async fn connect(config: RedisBrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(backend)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| {
                warn!(url = %config.url, error = %err, "redis connection failed");
                TransportError::Closed
            })?;
        debug!(url = %config.url, consumer = %config.consumer_name, "redis broker connected");
        Ok(Self {
            client,
            conn,
            config,
            open: Arc::new(AtomicBool::new(true)),
            ephemeral: Mutex::new(HashSet::new()),
            slots: Arc::new(Mutex::new(ConsumerSlots::default())),
            replies: OnceCell::new(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn classify(&self, err: RedisError) -> TransportError {
        classify(&self.open, err)
    }

    async fn declare_reply_stream(&self, ttl_secs: u64) -> Result<String> {
        self.ensure_open()?;
        let name = format!("{}{}", REPLY_STREAM_PREFIX, Uuid::new_v4().simple());
        self.create_group(&name, "$").await?;
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(&name)
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| self.classify(err))?;
        self.ephemeral.lock().insert(name.clone());
        trace!(queue = %name, ttl_secs, "ephemeral stream declared");
        Ok(name)
    }

    async fn reply_router(&self) -> Result<&ReplyRouter> {
        self.replies
            .get_or_try_init(|| async {
                // Blocking reads would stall the shared multiplexed connection.
                let conn = self
                    .client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(|err| self.classify(err))?;
                Ok::<_, TransportError>(ReplyRouter::start(conn, &self.config, self.open.clone()))
            })
            .await
    }

    async fn subscribe_durable(&self, queue: &str) -> Result<Subscription> {
        let reader = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| self.classify(err))?;
        let prefetch = self.config.prefetch.max(1);
        let (sender, inbox) = mpsc::channel(prefetch);
        let acker = Arc::new(RedisAcker {
            conn: self.conn.clone(),
            queue: queue.to_owned(),
            group: self.config.group.clone(),
            open: self.open.clone(),
        });
        let slot = self.slots.lock().claim(queue);
        let consumer = slot_consumer_name(&self.config.consumer_name, slot);
        debug!(queue, consumer = %consumer, "stream subscription started");
        let reader_task = StreamReader {
            conn: reader,
            queue: queue.to_owned(),
            group: self.config.group.clone(),
            consumer,
            prefetch,
            block_ms: self.config.block_interval.as_millis().max(1) as u64,
            open: self.open.clone(),
            acker,
        };
        let task = tokio::spawn(reader_task.run(sender));
        let slots = self.slots.clone();
        let name = queue.to_owned();
        Ok(Subscription::new(queue, inbox, move || {
            task.abort();
            slots.lock().release(&name, slot);
        }))
    }

    async fn create_group(&self, queue: &str, start: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.config.group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(self.classify(err)),
        }
    }
}

fn backend(err: RedisError) -> TransportError {
    TransportError::Backend(err.to_string())
}

fn classify(open: &AtomicBool, err: RedisError) -> TransportError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        open.store(false, Ordering::Release);
        TransportError::Closed
    } else {
        backend(err)
    }
}

fn encode_fields(message: &Message) -> Vec<(&'static str, Vec<u8>)> {
    let properties = &message.properties;
    let mut fields = vec![
        (FIELD_BODY, message.body.to_vec()),
        (FIELD_MESSAGE_ID, properties.message_id.to_string().into_bytes()),
        (FIELD_TIMESTAMP, properties.timestamp.to_rfc3339().into_bytes()),
    ];
    if let Some(correlation_id) = &properties.correlation_id {
        fields.push((FIELD_CORRELATION_ID, correlation_id.as_str().as_bytes().to_vec()));
    }
    if let Some(reply_to) = &properties.reply_to {
        fields.push((FIELD_REPLY_TO, reply_to.as_bytes().to_vec()));
    }
    if let Some(content_type) = &properties.content_type {
        fields.push((FIELD_CONTENT_TYPE, content_type.as_bytes().to_vec()));
    }
    fields
}

fn decode_fields(fields: Vec<Vec<u8>>) -> Message {
    let mut message = Message::new(Vec::new());
    let mut properties = MessageProperties::default();
    let mut pairs = fields.into_iter();
    while let (Some(key), Some(value)) = (pairs.next(), pairs.next()) {
        let text = || String::from_utf8_lossy(&value).into_owned();
        match key.as_slice() {
            b"body" => message.body = value.clone().into(),
            b"correlation_id" => properties.correlation_id = Some(CorrelationId::from(text())),
            b"reply_to" => properties.reply_to = Some(text()),
            b"content_type" => properties.content_type = Some(text()),
            b"message_id" => {
                if let Ok(id) = Uuid::parse_str(&text()) {
                    properties.message_id = id;
                }
            }
            b"timestamp" => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(&text()) {
                    properties.timestamp = ts.with_timezone(&Utc);
                }
            }
            _ => {}
        }
    }
    message.properties = properties;
    message
}

type StreamEntries = Vec<(String, Vec<Vec<u8>>)>;

fn parse_stream_batches(reply: Value) -> Result<Vec<(String, StreamEntries)>> {
    if matches!(reply, Value::Nil) {
        return Ok(Vec::new());
    }
    redis::from_redis_value(&reply).map_err(backend)
}

fn parse_read_reply(reply: Value) -> Result<StreamEntries> {
    Ok(parse_stream_batches(reply)?
        .into_iter()
        .flat_map(|(_stream, entries)| entries)
        .collect())
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_durable(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.create_group(queue, "0").await?;
        debug!(queue, group = %self.config.group, "durable stream declared");
        Ok(())
    }

    async fn declare_ephemeral(&self) -> Result<String> {
        let ttl = self.config.reply_queue_ttl.as_secs().max(1);
        self.declare_reply_stream(ttl).await
    }

    async fn declare_reply_queue(&self, lifetime: Duration) -> Result<String> {
        let ttl = reply_stream_ttl(self.config.reply_queue_ttl, lifetime);
        self.declare_reply_stream(ttl).await
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        self.ensure_open()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(queue).arg("NOMKSTREAM").arg("*");
        for (field, value) in encode_fields(&message) {
            cmd.arg(field).arg(value);
        }
        let mut conn = self.conn.clone();
        let id: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| self.classify(err))?;
        match id {
            Some(id) => trace!(queue, entry = %id, "message appended"),
            None => debug!(queue, "dropping message published to unknown stream"),
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(queue)
            .query_async(&mut conn)
            .await
            .map_err(|err| self.classify(err))?;
        if !exists {
            return Err(TransportError::QueueNotFound(queue.to_owned()));
        }

        if self.ephemeral.lock().contains(queue) {
            let router = self.reply_router().await?;
            let acker = Arc::new(RedisAcker {
                conn: self.conn.clone(),
                queue: queue.to_owned(),
                group: self.config.group.clone(),
                open: self.open.clone(),
            });
            return Ok(router.register(queue, self.config.prefetch.max(1), acker));
        }
        self.subscribe_durable(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        if queue.starts_with(REPLY_STREAM_PREFIX) && !self.ephemeral.lock().contains(queue) {
            return Err(TransportError::ResourceLocked(queue.to_owned()));
        }
        if let Some(router) = self.replies.get() {
            router.unregister(queue);
        }
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(queue)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| self.classify(err))?;
        self.ephemeral.lock().remove(queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        let owned: Vec<String> = self.ephemeral.lock().drain().collect();
        if !owned.is_empty() {
            let mut conn = self.conn.clone();
            if let Err(err) = redis::cmd("DEL")
                .arg(&owned)
                .query_async::<_, ()>(&mut conn)
                .await
            {
                warn!(error = %err, count = owned.len(), "failed to delete ephemeral streams");
            }
        }
        self.open.store(false, Ordering::Release);
        if let Some(router) = self.replies.get() {
            router.wake.notify_one();
        }
        debug!("redis broker closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct StreamReader {
    conn: MultiplexedConnection,
    queue: String,
    group: String,
    consumer: String,
    prefetch: usize,
    block_ms: u64,
    open: Arc<AtomicBool>,
    acker: Arc<RedisAcker>,
}

impl StreamReader {
    async fn run(mut self, sender: mpsc::Sender<Delivery>) {
        // "0" replays this consumer's pending entries; ">" reads new ones.
        let mut cursor = "0".to_owned();
        loop {
            if sender.is_closed() || !self.open.load(Ordering::Acquire) {
                break;
            }
            let history = cursor != ">";
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(self.prefetch);
            if !history {
                cmd.arg("BLOCK").arg(self.block_ms);
            }
            cmd.arg("STREAMS").arg(&self.queue).arg(&cursor);

            let reply: Value = match cmd.query_async(&mut self.conn).await {
                Ok(reply) => reply,
                Err(err) if err.code() == Some("NOGROUP") => {
                    debug!(queue = %self.queue, "stream deleted; ending subscription");
                    break;
                }
                Err(err) => {
                    if matches!(classify(&self.open, err), TransportError::Closed) {
                        warn!(queue = %self.queue, "redis connection lost; ending subscription");
                        break;
                    }
                    warn!(queue = %self.queue, "stream read failed; retrying");
                    tokio::time::sleep(Duration::from_millis(self.block_ms)).await;
                    continue;
                }
            };
            let entries = match parse_read_reply(reply) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "unparseable stream reply");
                    continue;
                }
            };
            if history {
                match entries.last() {
                    Some((last, _)) => cursor = last.clone(),
                    None => {
                        cursor = ">".to_owned();
                        continue;
                    }
                }
            }
            for (entry_id, fields) in entries {
                if fields.is_empty() {
                    // Pending entry trimmed from the stream; settle it.
                    let _ = self.acker.ack(&DeliveryTag(entry_id)).await;
                    continue;
                }
                let delivery = Delivery::new(
                    self.queue.clone(),
                    decode_fields(fields),
                    history,
                    DeliveryTag(entry_id),
                    self.acker.clone(),
                );
                if sender.send(delivery).await.is_err() {
                    return;
                }
            }
        }
    }
}

struct RedisAcker {
    conn: MultiplexedConnection,
    queue: String,
    group: String,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("XACK")
            .arg(&self.queue)
            .arg(&self.group)
            .arg(&tag.0)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| classify(&self.open, err))
    }
}

struct ReplyRoute {
    sender: mpsc::Sender<Delivery>,
    acker: Arc<RedisAcker>,
}

type ReplyRoutes = Arc<Mutex<HashMap<String, ReplyRoute>>>;

/// Single reader for every reply stream of one connection.
struct ReplyRouter {
    routes: ReplyRoutes,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ReplyRouter {
    fn start(conn: MultiplexedConnection, config: &RedisBrokerConfig, open: Arc<AtomicBool>) -> Self {
        let routes: ReplyRoutes = Arc::new(Mutex::new(HashMap::new()));
        let wake = Arc::new(Notify::new());
        let reader = ReplyReader {
            conn,
            group: config.group.clone(),
            consumer: format!("{}-replies", config.consumer_name),
            prefetch: config.prefetch.max(1),
            block_ms: config.block_interval.min(REPLY_POLL_INTERVAL).as_millis().max(1) as u64,
            open,
            routes: routes.clone(),
            wake: wake.clone(),
        };
        let task = tokio::spawn(reader.run());
        Self { routes, wake, task }
    }

    fn register(&self, queue: &str, prefetch: usize, acker: Arc<RedisAcker>) -> Subscription {
        let (sender, inbox) = mpsc::channel(prefetch);
        self.routes
            .lock()
            .insert(queue.to_owned(), ReplyRoute { sender, acker });
        self.wake.notify_one();
        let routes = self.routes.clone();
        let name = queue.to_owned();
        Subscription::new(queue, inbox, move || {
            routes.lock().remove(&name);
        })
    }

    fn unregister(&self, queue: &str) {
        self.routes.lock().remove(queue);
    }
}

impl Drop for ReplyRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ReplyReader {
    conn: MultiplexedConnection,
    group: String,
    consumer: String,
    prefetch: usize,
    block_ms: u64,
    open: Arc<AtomicBool>,
    routes: ReplyRoutes,
    wake: Arc<Notify>,
}

impl ReplyReader {
    async fn run(mut self) {
        loop {
            if !self.open.load(Ordering::Acquire) {
                break;
            }
            let streams: Vec<String> = {
                let mut routes = self.routes.lock();
                routes.retain(|_, route| !route.sender.is_closed());
                routes.keys().cloned().collect()
            };
            if streams.is_empty() {
                self.wake.notified().await;
                continue;
            }

            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(self.prefetch)
                .arg("BLOCK")
                .arg(self.block_ms)
                .arg("STREAMS")
                .arg(&streams);
            for _ in &streams {
                cmd.arg(">");
            }
            let reply: Value = match cmd.query_async(&mut self.conn).await {
                Ok(reply) => reply,
                Err(err) if err.code() == Some("NOGROUP") => {
                    self.drop_missing(&streams).await;
                    continue;
                }
                Err(err) => {
                    if matches!(classify(&self.open, err), TransportError::Closed) {
                        warn!("redis connection lost; ending reply subscriptions");
                        break;
                    }
                    warn!("reply read failed; retrying");
                    tokio::time::sleep(Duration::from_millis(self.block_ms)).await;
                    continue;
                }
            };
            let batches = match parse_stream_batches(reply) {
                Ok(batches) => batches,
                Err(err) => {
                    warn!(error = %err, "unparseable reply stream read");
                    continue;
                }
            };
            for (stream, entries) in batches {
                let route = self
                    .routes
                    .lock()
                    .get(&stream)
                    .map(|route| (route.sender.clone(), route.acker.clone()));
                let Some((sender, acker)) = route else {
                    continue;
                };
                for (entry_id, fields) in entries {
                    let delivery = Delivery::new(
                        stream.clone(),
                        decode_fields(fields),
                        false,
                        DeliveryTag(entry_id),
                        acker.clone(),
                    );
                    if sender.try_send(delivery).is_err() {
                        debug!(queue = %stream, "reply consumer gone or full; leaving entry pending");
                    }
                }
            }
        }
        self.routes.lock().clear();
    }

    /// End the subscriptions of reply streams that were deleted or expired.
    async fn drop_missing(&mut self, streams: &[String]) {
        for stream in streams {
            let exists: std::result::Result<bool, RedisError> = redis::cmd("EXISTS")
                .arg(stream)
                .query_async(&mut self.conn)
                .await;
            if matches!(exists, Ok(false)) {
                debug!(queue = %stream, "reply stream gone; ending subscription");
                self.routes.lock().remove(stream);
            }
        }
    }
}
