//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Server side of the RPC layer.
//!
//! A [`Dispatcher`] consumes a durable queue, routes each request to the handler registered
//! for its action and publishes the result to the request's reply address. Every per-message
//! failure (undecodable body, unknown action, handler error, panic or timeout) is turned into
//! an error reply and the message is acknowledged anyway: a handler that ran is never run
//! twice because of redelivery. The consume loop itself only stops on shutdown or when the
//! broker ends the subscription, which is reported as an error so the process can fail fast.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use courier_common::DispatcherConfig;
use courier_logging::{
    courier_debug, courier_error, courier_warn, log_system_event, LogContext, SystemEventOutcome,
};
use courier_msg::{error_codes, ActionRequest, BrokerPtr, Delivery, ErrorReply, Message, Subscription};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::RpcError;
use crate::metrics::{DispatchOutcome, RpcMetrics};
use crate::registry::{ActionRegistry, HandlerPtr};

const DEFAULT_SERVICE_NAME: &str = "courier";
const BODY_PREVIEW_LIMIT: usize = 256;

/// How request bodies on a queue are interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestShape {
    /// `{"action": "...", "data": ...}` envelopes routed by action name.
    Envelope,
    /// Bare JSON payloads, all routed to one fixed action.
    Bare { action: String },
}

impl RequestShape {
    fn decode(&self, message: &Message) -> Result<(String, Value), serde_json::Error> {
        match self {
            RequestShape::Envelope => {
                let request: ActionRequest = serde_json::from_slice(&message.body)?;
                Ok((request.action, request.data))
            }
            RequestShape::Bare { action } => {
                let payload: Value = serde_json::from_slice(&message.body)?;
                Ok((action.clone(), payload))
            }
        }
    }
}

/// Consume loop routing queue messages to registered handlers.
#[derive(Clone)]
pub struct Dispatcher {
    broker: BrokerPtr,
    registry: ActionRegistry,
    config: DispatcherConfig,
    service: String,
    metrics: Option<RpcMetrics>,
}

impl Dispatcher {
    pub fn new(broker: BrokerPtr, registry: ActionRegistry, config: DispatcherConfig) -> Self {
        Self {
            broker,
            registry,
            config,
            service: DEFAULT_SERVICE_NAME.to_owned(),
            metrics: None,
        }
    }

    /// Service name attached to every log line.
    pub fn with_service_name(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_metrics(mut self, metrics: RpcMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Serve `{action, data}` requests on `queue` until `shutdown` flips to `true`.
    pub async fn serve(&self, queue: &str, shutdown: watch::Receiver<bool>) -> Result<(), RpcError> {
        self.serve_with(queue, RequestShape::Envelope, shutdown).await
    }

    /// Serve a single-purpose queue whose bodies are bare payloads for `action`.
    pub async fn serve_bare(
        &self,
        queue: &str,
        action: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), RpcError> {
        let shape = RequestShape::Bare {
            action: action.to_owned(),
        };
        self.serve_with(queue, shape, shutdown).await
    }

    /// Run [`Dispatcher::serve`] on its own task.
    pub fn spawn(
        &self,
        queue: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), RpcError>> {
        let dispatcher = self.clone();
        let queue = queue.into();
        tokio::spawn(async move { dispatcher.serve(&queue, shutdown).await })
    }

    /// Declare `queue`, start the configured number of consumer slots and run them.
    pub async fn serve_with(
        &self,
        queue: &str,
        shape: RequestShape,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), RpcError> {
        self.broker.declare_durable(queue).await?;
        if let Some(dead_letters) = &self.config.dead_letter_queue {
            self.broker.declare_durable(dead_letters).await?;
        }

        let slots = self.config.consumers.max(1);
        let mut consumers = Vec::with_capacity(slots);
        for slot in 0..slots {
            let subscription = self.broker.subscribe(queue).await?;
            consumers.push(self.consume(queue, &shape, slot, subscription, shutdown.clone()));
        }

        let ctx = LogContext::new()
            .with_service(&self.service)
            .with_queue(queue);
        log_system_event(
            Some(&ctx),
            "dispatcher.started",
            &format!("consuming with {} slot(s)", slots),
            SystemEventOutcome::Success,
        );
        let result = futures::future::try_join_all(consumers).await.map(|_| ());
        match &result {
            Ok(()) => log_system_event(
                Some(&ctx),
                "dispatcher.stopped",
                "shutdown requested",
                SystemEventOutcome::Success,
            ),
            Err(err) => log_system_event(
                Some(&ctx),
                "dispatcher.stopped",
                &err.to_string(),
                SystemEventOutcome::Fault,
            ),
        }
        result
    }

    async fn consume(
        &self,
        queue: &str,
        shape: &RequestShape,
        slot: usize,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RpcError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                next = subscription.recv() => match next {
                    Some(delivery) => self.process(queue, shape, delivery).await,
                    None => {
                        return Err(RpcError::Connection(format!(
                            "subscription to '{}' (slot {}) ended",
                            queue, slot
                        )));
                    }
                },
            }
        }
    }

    /// Handle one delivery end to end: decode, route, reply, acknowledge.
    pub async fn process(&self, queue: &str, shape: &RequestShape, delivery: Delivery) {
        let message = &delivery.message;
        let ctx = LogContext::new()
            .with_service(&self.service)
            .with_queue(queue)
            .with_correlation_id(message.correlation_id().map(|id| id.as_str()));

        let (action, payload) = match shape.decode(message) {
            Ok(decoded) => decoded,
            Err(err) => {
                courier_warn!(
                    context = ctx,
                    "dropping undecodable message: {} (body: {})",
                    err,
                    message.body_preview(BODY_PREVIEW_LIMIT)
                );
                let reply = ErrorReply::new(
                    error_codes::DECODE_ERROR,
                    format!("malformed request body: {}", err),
                );
                self.reply(&ctx, message, &reply.to_value()).await;
                self.settle(&ctx, queue, &delivery, DispatchOutcome::DecodeFailed)
                    .await;
                return;
            }
        };

        let ctx = ctx.with_action(&action);
        let (body, outcome) = match self.registry.resolve(&action) {
            Err(_) => {
                courier_warn!(context = ctx, "no handler registered");
                let reply = ErrorReply::new(
                    error_codes::NO_SUCH_ACTION,
                    format!("Unknown action: {}", action),
                );
                (reply.to_value(), DispatchOutcome::NoSuchAction)
            }
            Ok(handler) => match self.invoke(handler, &action, payload).await {
                Ok(Value::Null) => (self.config.empty_reply.clone(), DispatchOutcome::Handled),
                Ok(value) => (value, DispatchOutcome::Handled),
                Err(reply) => {
                    courier_error!(context = ctx, "handler failed: {}", reply.error);
                    self.dead_letter(&ctx, &delivery, &reply).await;
                    (reply.to_value(), DispatchOutcome::HandlerFailed)
                }
            },
        };

        self.reply(&ctx, message, &body).await;
        self.settle(&ctx, queue, &delivery, outcome).await;
    }

    async fn invoke(
        &self,
        handler: HandlerPtr,
        action: &str,
        payload: Value,
    ) -> Result<Value, ErrorReply> {
        let call = AssertUnwindSafe(handler.handle(action, payload)).catch_unwind();
        let outcome = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(ErrorReply::new(
                        error_codes::HANDLER_TIMEOUT,
                        format!("handler did not finish within {:?}", limit),
                    ))
                }
            },
            None => call.await,
        };
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.to_reply()),
            Err(panic) => Err(ErrorReply::new(
                error_codes::HANDLER_ERROR,
                format!("handler panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    async fn reply(&self, ctx: &LogContext<'_>, request: &Message, body: &Value) {
        let Some(reply_to) = request.reply_to() else {
            courier_debug!(context = *ctx, "one-way message; no reply sent");
            return;
        };
        let mut reply = match Message::json(body) {
            Ok(reply) => reply,
            Err(err) => {
                courier_error!(context = *ctx, "reply could not be encoded: {}", err);
                return;
            }
        };
        if let Some(correlation_id) = request.correlation_id() {
            reply = reply.with_correlation_id(correlation_id.clone());
        }
        if let Err(err) = self.broker.publish(reply_to, reply).await {
            courier_error!(context = *ctx, "failed to publish reply to {}: {}", reply_to, err);
        }
    }

    async fn dead_letter(&self, ctx: &LogContext<'_>, delivery: &Delivery, reason: &ErrorReply) {
        let Some(dead_letters) = &self.config.dead_letter_queue else {
            return;
        };
        if let Err(err) = self
            .broker
            .publish(dead_letters, delivery.message.clone())
            .await
        {
            courier_error!(
                context = *ctx,
                "failed to dead-letter message ({}): {}",
                reason.error,
                err
            );
        }
    }

    async fn settle(
        &self,
        ctx: &LogContext<'_>,
        queue: &str,
        delivery: &Delivery,
        outcome: DispatchOutcome,
    ) {
        if let Err(err) = delivery.ack().await {
            courier_warn!(context = *ctx, "ack failed: {}", err);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(queue, outcome);
        }
        courier_debug!(context = *ctx, "message settled ({})", outcome.as_str());
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use courier_msg::{Broker, CorrelationId, MemoryBroker};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> ActionRegistry {
        let mut builder = ActionRegistry::builder();
        builder
            .register("system/echo", |_action: String, payload: Value| async move {
                Ok::<_, HandlerError>(payload)
            })
            .unwrap()
            .register("system/fail", |_action: String, _payload: Value| async move {
                Err::<Value, _>(HandlerError::domain("Submission not found"))
            })
            .unwrap()
            .register("system/nothing", |_action: String, _payload: Value| async move {
                Ok::<_, HandlerError>(Value::Null)
            })
            .unwrap()
            .register("system/panic", |_action: String, _payload: Value| async move {
                if true {
                    panic!("boom");
                }
                Ok::<_, HandlerError>(Value::Null)
            })
            .unwrap()
            .register("system/sleep", |_action: String, _payload: Value| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, HandlerError>(Value::Null)
            })
            .unwrap();
        builder.build()
    }

    struct Harness {
        broker: MemoryBroker,
        service: BrokerPtr,
        caller: BrokerPtr,
        reply_queue: String,
        replies: Subscription,
    }

    async fn harness() -> Harness {
        let broker = MemoryBroker::new();
        let service: BrokerPtr = broker.connect();
        let caller: BrokerPtr = broker.connect();
        service.declare_durable("requests").await.unwrap();
        let reply_queue = caller.declare_ephemeral().await.unwrap();
        let replies = caller.subscribe(&reply_queue).await.unwrap();
        Harness {
            broker,
            service,
            caller,
            reply_queue,
            replies,
        }
    }

    impl Harness {
        async fn dispatch(&mut self, dispatcher: &Dispatcher, shape: &RequestShape, body: Value) -> Value {
            let correlation_id = CorrelationId::generate();
            let message = Message::json(&body)
                .unwrap()
                .with_correlation_id(correlation_id.clone())
                .with_reply_to(self.reply_queue.clone());
            self.caller.publish("requests", message).await.unwrap();
            let mut requests = self.service.subscribe("requests").await.unwrap();
            let delivery = requests.recv().await.unwrap();
            dispatcher.process("requests", shape, delivery).await;
            drop(requests);
            assert_eq!(self.broker.unacked_count("requests"), 0);
            assert_eq!(self.broker.ready_count("requests"), 0);

            let reply = tokio::time::timeout(Duration::from_secs(1), self.replies.recv())
                .await
                .unwrap()
                .unwrap();
            reply.ack().await.unwrap();
            assert_eq!(reply.message.correlation_id(), Some(&correlation_id));
            reply.message.decode_json().unwrap()
        }
    }

    fn dispatcher(h: &Harness, config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(h.service.clone(), registry(), config).with_service_name("test-service")
    }

    #[tokio::test]
    async fn routes_to_the_registered_handler() {
        let mut h = harness().await;
        let d = dispatcher(&h, DispatcherConfig::default());
        let reply = h
            .dispatch(&d, &RequestShape::Envelope, json!({ "action": "system/echo", "data": { "id": 3 } }))
            .await;
        assert_eq!(reply, json!({ "id": 3 }));
    }

    #[tokio::test]
    async fn failures_become_error_replies() {
        let mut h = harness().await;
        let config = DispatcherConfig {
            handler_timeout: Some(Duration::from_millis(50)),
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&h, config);
        let envelope = RequestShape::Envelope;

        let unknown = h
            .dispatch(&d, &envelope, json!({ "action": "does/not-exist", "data": {} }))
            .await;
        assert_eq!(unknown["code"], error_codes::NO_SUCH_ACTION);
        assert!(unknown["error"].as_str().unwrap().contains("does/not-exist"));

        let failed = h.dispatch(&d, &envelope, json!({ "action": "system/fail" })).await;
        assert_eq!(
            failed,
            json!({ "error": "Submission not found", "code": error_codes::HANDLER_ERROR })
        );

        let panicked = h.dispatch(&d, &envelope, json!({ "action": "system/panic" })).await;
        assert_eq!(panicked["code"], error_codes::HANDLER_ERROR);
        assert!(panicked["error"].as_str().unwrap().contains("boom"));

        let slow = h.dispatch(&d, &envelope, json!({ "action": "system/sleep" })).await;
        assert_eq!(slow["code"], error_codes::HANDLER_TIMEOUT);

        let undecodable = h.dispatch(&d, &envelope, json!(["not", "an", "envelope"])).await;
        assert_eq!(undecodable["code"], error_codes::DECODE_ERROR);
    }

    #[tokio::test]
    async fn null_results_use_the_empty_reply() {
        let mut h = harness().await;
        let d = dispatcher(&h, DispatcherConfig::default());
        let reply = h
            .dispatch(&d, &RequestShape::Envelope, json!({ "action": "system/nothing" }))
            .await;
        assert_eq!(reply, json!({ "error": "No response generated" }));
    }

    #[tokio::test]
    async fn bare_payloads_route_to_a_fixed_action() {
        let mut h = harness().await;
        let d = dispatcher(&h, DispatcherConfig::default());
        let shape = RequestShape::Bare {
            action: "system/echo".into(),
        };
        let reply = h.dispatch(&d, &shape, json!({ "title": "essay" })).await;
        assert_eq!(reply, json!({ "title": "essay" }));
    }

    #[tokio::test]
    async fn failed_messages_are_copied_to_the_dead_letter_queue() {
        let mut h = harness().await;
        h.service.declare_durable("dead_letters").await.unwrap();
        let config = DispatcherConfig {
            dead_letter_queue: Some("dead_letters".into()),
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&h, config);
        h.dispatch(&d, &RequestShape::Envelope, json!({ "action": "system/fail" }))
            .await;
        h.dispatch(&d, &RequestShape::Envelope, json!({ "action": "system/echo" }))
            .await;
        assert_eq!(h.broker.ready_count("dead_letters"), 1);
    }

    #[tokio::test]
    async fn one_way_messages_get_no_reply() {
        let mut h = harness().await;
        let d = dispatcher(&h, DispatcherConfig::default());
        h.caller
            .publish("requests", Message::json(&json!({ "action": "system/echo" })).unwrap())
            .await
            .unwrap();
        let mut requests = h.service.subscribe("requests").await.unwrap();
        let delivery = requests.recv().await.unwrap();
        d.process("requests", &RequestShape::Envelope, delivery).await;
        assert!(h.replies.try_recv().is_none());
        assert_eq!(h.broker.unacked_count("requests"), 0);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_and_fails_on_lost_subscription() {
        let broker = MemoryBroker::new();
        let conn: BrokerPtr = broker.connect();
        let config = DispatcherConfig {
            consumers: 2,
            ..DispatcherConfig::default()
        };
        let d = Dispatcher::new(conn.clone(), registry(), config);

        let (stop, shutdown) = watch::channel(false);
        let task = d.spawn("user_requests", shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.consumer_count("user_requests"), 2);
        stop.send(true).unwrap();
        task.await.unwrap().unwrap();

        let (_keep_running, shutdown) = watch::channel(false);
        let task = d.spawn("user_requests", shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RpcError::Connection(_))));
        drop(stop);
    }
}
