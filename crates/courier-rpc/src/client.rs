//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Request side of the RPC layer.
//!
//! Every call gets its own correlation id, its own exclusive reply queue, its own consumer
//! and its own timer, so concurrent calls never wait on each other. The reply queue is torn
//! down when the call resolves, times out, or is abandoned by the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_logging::{courier_debug, courier_warn, LogContext};
use courier_msg::{
    ActionRequest, BrokerPtr, CorrelationId, ErrorReply, Message, Subscription, CONTENT_TYPE_JSON,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::channel::ManagedChannel;
use crate::error::RpcError;
use crate::metrics::RpcMetrics;

/// Reply window used by [`RpcClient::request`] unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Bookkeeping for one outstanding request.
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub correlation_id: CorrelationId,
    pub target_queue: String,
    pub reply_queue: String,
    pub started: Instant,
    pub deadline: Instant,
}

type InFlightTable = Arc<Mutex<HashMap<CorrelationId, InFlightRequest>>>;

/// Issues requests and awaits their correlated replies. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    channel: Arc<ManagedChannel>,
    default_timeout: Duration,
    in_flight: InFlightTable,
    metrics: Option<RpcMetrics>,
}

impl RpcClient {
    pub fn new(channel: Arc<ManagedChannel>) -> Self {
        Self {
            channel,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            metrics: None,
        }
    }

    /// Client bound to one broker connection without reconnect support.
    pub fn from_broker(broker: BrokerPtr) -> Self {
        Self::new(Arc::new(ManagedChannel::fixed(broker)))
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: RpcMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn channel(&self) -> &Arc<ManagedChannel> {
        &self.channel
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of requests currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Snapshot of requests currently awaiting a reply.
    pub fn in_flight_requests(&self) -> Vec<InFlightRequest> {
        self.in_flight.lock().values().cloned().collect()
    }

    /// [`RpcClient::send_request`] with the default timeout.
    pub async fn request<T>(&self, queue: &str, payload: &T) -> Result<Value, RpcError>
    where
        T: Serialize + ?Sized,
    {
        self.send_request(queue, payload, self.default_timeout).await
    }

    /// Send `{action, data}` to a multi-action queue.
    ///
    /// Error-shaped replies (`{"error": "..."}`) come back as [`RpcError::Remote`].
    pub async fn call(&self, queue: &str, action: &str, data: Value) -> Result<Value, RpcError> {
        let reply = self.request(queue, &ActionRequest::new(action, data)).await?;
        match ErrorReply::from_value(&reply) {
            Some(error) => Err(RpcError::from_reply(error)),
            None => Ok(reply),
        }
    }

    /// Publish `payload` to `queue` and wait up to `timeout` for the correlated reply.
    ///
    /// `timeout` bounds the whole call, connecting included. Running out of time before the
    /// request is published is a [`RpcError::Connection`]; afterwards it is a
    /// [`RpcError::Timeout`].
    pub async fn send_request<T>(
        &self,
        queue: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<Value, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(RpcError::Encode)?;
        let now = tokio::time::Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
        let result = self.exchange(queue, body, timeout, deadline).await;
        if let (Some(metrics), Err(err)) = (&self.metrics, &result) {
            match err {
                RpcError::Connection(_) => metrics.record_connection_error(queue),
                RpcError::Timeout { .. } => metrics.record_timeout(queue),
                _ => {}
            }
        }
        result
    }

    async fn exchange(
        &self,
        queue: &str,
        body: Vec<u8>,
        timeout: Duration,
        deadline: tokio::time::Instant,
    ) -> Result<Value, RpcError> {
        let broker = before_deadline(deadline, "connect", self.channel.ensure_connected()).await?;
        let correlation_id = CorrelationId::generate();
        let ctx = LogContext::new()
            .with_queue(queue)
            .with_correlation_id(Some(correlation_id.as_str()));

        let reply_queue =
            before_deadline(deadline, "reply queue declare", broker.declare_reply_queue(timeout))
                .await?;
        let mut pending = PendingReply {
            broker: broker.clone(),
            table: self.in_flight.clone(),
            correlation_id: correlation_id.clone(),
            reply_queue: reply_queue.clone(),
            subscription: None,
            registered: false,
            cleaned: false,
        };
        let started = Instant::now();
        pending.register(InFlightRequest {
            correlation_id: correlation_id.clone(),
            target_queue: queue.to_owned(),
            reply_queue: reply_queue.clone(),
            started,
            deadline: deadline.into_std(),
        })?;
        pending.subscription =
            Some(before_deadline(deadline, "reply subscribe", broker.subscribe(&reply_queue)).await?);

        let mut message = Message::new(body)
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_queue);
        message.properties.content_type = Some(CONTENT_TYPE_JSON.to_owned());
        before_deadline(deadline, "publish", broker.publish(queue, message)).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_request(queue);
        }
        courier_debug!(context = ctx, "request published");

        let outcome = tokio::time::timeout_at(deadline, pending.wait(&ctx)).await;
        pending.finish().await;
        match outcome {
            Ok(Ok(value)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_reply(queue, started.elapsed());
                }
                Ok(value)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                courier_warn!(context = ctx, "no reply within {:?}", timeout);
                Err(RpcError::Timeout {
                    queue: queue.to_owned(),
                    timeout,
                })
            }
        }
    }
}

/// Run one pre-publish step of a request. The broker failing to answer before `deadline`
/// counts as a connection failure.
async fn before_deadline<F, T, E>(
    deadline: tokio::time::Instant,
    step: &str,
    work: F,
) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<RpcError>,
{
    match tokio::time::timeout_at(deadline, work).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(RpcError::Connection(format!(
            "broker did not complete {} before the request deadline",
            step
        ))),
    }
}

/// Owns the per-request resources; dropping it releases them.
struct PendingReply {
    broker: BrokerPtr,
    table: InFlightTable,
    correlation_id: CorrelationId,
    reply_queue: String,
    subscription: Option<Subscription>,
    registered: bool,
    cleaned: bool,
}

impl PendingReply {
    fn register(&mut self, entry: InFlightRequest) -> Result<(), RpcError> {
        let mut table = self.table.lock();
        if table.contains_key(&self.correlation_id) {
            return Err(RpcError::DuplicateCorrelation(self.correlation_id.clone()));
        }
        table.insert(self.correlation_id.clone(), entry);
        self.registered = true;
        Ok(())
    }

    fn unregister(&mut self) {
        if self.registered {
            self.table.lock().remove(&self.correlation_id);
            self.registered = false;
        }
    }

    async fn wait(&mut self, ctx: &LogContext<'_>) -> Result<Value, RpcError> {
        let Some(subscription) = self.subscription.as_mut() else {
            return Err(RpcError::Connection("reply consumer is not active".to_owned()));
        };
        loop {
            let Some(delivery) = subscription.recv().await else {
                return Err(RpcError::Connection(
                    "reply queue closed before a reply arrived".to_owned(),
                ));
            };
            if let Err(err) = delivery.ack().await {
                courier_debug!(context = *ctx, "reply ack failed: {}", err);
            }
            if delivery.message.correlation_id() != Some(&self.correlation_id) {
                courier_warn!(
                    context = *ctx,
                    "discarding reply with foreign correlation id {:?}",
                    delivery.message.correlation_id().map(CorrelationId::as_str)
                );
                continue;
            }
            while let Some(duplicate) = subscription.try_recv() {
                let _ = duplicate.ack().await;
                courier_debug!(context = *ctx, "discarding duplicate reply");
            }
            return serde_json::from_slice(&delivery.message.body).map_err(RpcError::Decode);
        }
    }

    async fn finish(&mut self) {
        self.subscription.take();
        self.unregister();
        if let Err(err) = self.broker.delete_queue(&self.reply_queue).await {
            courier_debug!(
                context = LogContext::new().with_queue(&self.reply_queue),
                "reply queue cleanup failed: {}",
                err
            );
        }
        self.cleaned = true;
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.subscription.take();
        self.unregister();
        if self.cleaned {
            return;
        }
        // Abandoned or failed before completion; delete in the background.
        if let Ok(handle) = Handle::try_current() {
            let broker = self.broker.clone();
            let queue = std::mem::take(&mut self.reply_queue);
            handle.spawn(async move {
                if let Err(err) = broker.delete_queue(&queue).await {
                    tracing::debug!(queue = %queue, error = %err, "reply queue cleanup failed");
                }
            });
        }
    }
}
