//! ---
//! courier_section: "15-testing"
//! courier_subsection: "integration-tests"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Integration and validation tests for the courier stack."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use courier_common::{new_registry, DispatcherConfig, USER_REQUESTS};
use courier_msg::{error_codes, Broker, BrokerPtr, ErrorReply, MemoryBroker, Message};
use courier_rpc::{
    ActionRegistry, DispatchOutcome, Dispatcher, HandlerError, RpcClient, RpcError, RpcMetrics,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn user_service() -> ActionRegistry {
    let mut builder = ActionRegistry::builder();
    builder
        .register("system/echo", |_action: String, payload: Value| async move {
            Ok::<_, HandlerError>(payload)
        })
        .unwrap()
        .register("user/signin", |_action: String, payload: Value| async move {
            match payload["email"].as_str() {
                Some(email) if payload["password"] == "x" => Ok(json!({
                    "user": { "email": email },
                    "token": format!("token-for-{}", email),
                })),
                _ => Err(HandlerError::domain("Invalid credentials")),
            }
        })
        .unwrap();
    builder.build()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct Service {
    broker: MemoryBroker,
    client: RpcClient,
    metrics: RpcMetrics,
    _stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), RpcError>>,
}

async fn start_service() -> Service {
    let broker = MemoryBroker::new();
    let metrics = RpcMetrics::new(new_registry()).unwrap();
    let (stop, shutdown) = watch::channel(false);
    let task = Dispatcher::new(broker.connect(), user_service(), DispatcherConfig::default())
        .with_metrics(metrics.clone())
        .spawn(USER_REQUESTS, shutdown);
    while broker.consumer_count(USER_REQUESTS) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let client = RpcClient::from_broker(broker.connect())
        .with_default_timeout(Duration::from_secs(5))
        .with_metrics(metrics.clone());
    Service {
        broker,
        client,
        metrics,
        _stop: stop,
        task,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_each_receive_their_own_reply() {
    let service = start_service().await;

    let calls = (0..64).map(|id| {
        let client = service.client.clone();
        async move {
            let reply = client
                .call(USER_REQUESTS, "system/echo", json!({ "id": id }))
                .await
                .unwrap();
            (id, reply)
        }
    });
    for (id, reply) in futures::future::join_all(calls).await {
        assert_eq!(reply, json!({ "id": id }));
    }

    assert_eq!(service.client.in_flight(), 0);
    assert_eq!(service.broker.ready_count(USER_REQUESTS), 0);
    eventually(|| service.broker.unacked_count(USER_REQUESTS) == 0).await;
    service.task.abort();
}

#[tokio::test]
async fn sign_in_round_trip() {
    let service = start_service().await;

    let reply = service
        .client
        .call(
            USER_REQUESTS,
            "user/signin",
            json!({ "email": "a@b.com", "password": "x" }),
        )
        .await
        .unwrap();
    assert_eq!(reply["user"]["email"], "a@b.com");
    assert_eq!(reply["token"], "token-for-a@b.com");

    let err = service
        .client
        .call(
            USER_REQUESTS,
            "user/signin",
            json!({ "email": "a@b.com", "password": "wrong" }),
        )
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { message, .. } => assert_eq!(message, "Invalid credentials"),
        other => panic!("expected remote error, got {:?}", other),
    }
    service.task.abort();
}

#[tokio::test]
async fn unknown_action_gets_an_error_reply() {
    let service = start_service().await;

    let err = service
        .client
        .call(USER_REQUESTS, "does/not-exist", json!({}))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { code, message } => {
            assert_eq!(code.as_deref(), Some(error_codes::NO_SUCH_ACTION));
            assert!(message.contains("does/not-exist"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }
    // The raw reply is still a normal JSON value for callers that inspect it themselves.
    let raw = service
        .client
        .request(USER_REQUESTS, &json!({ "action": "does/not-exist", "data": {} }))
        .await
        .unwrap();
    assert!(ErrorReply::from_value(&raw).is_some());
    service.task.abort();
}

#[tokio::test]
async fn malformed_body_does_not_stop_the_dispatcher() {
    let service = start_service().await;
    let caller = service.broker.connect();
    let reply_queue = caller.declare_ephemeral().await.unwrap();
    let mut replies = caller.subscribe(&reply_queue).await.unwrap();

    caller
        .publish(
            USER_REQUESTS,
            Message::new("this is not json").with_reply_to(reply_queue.clone()),
        )
        .await
        .unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(2), replies.recv())
        .await
        .unwrap()
        .unwrap();
    let body: Value = delivery.message.decode_json().unwrap();
    let reply = ErrorReply::from_value(&body).unwrap();
    assert_eq!(reply.code.as_deref(), Some(error_codes::DECODE_ERROR));

    let echoed = service
        .client
        .call(USER_REQUESTS, "system/echo", json!("still alive"))
        .await
        .unwrap();
    assert_eq!(echoed, json!("still alive"));
    eventually(|| service.broker.unacked_count(USER_REQUESTS) == 0).await;
    service.task.abort();
}

#[tokio::test]
async fn unanswered_request_times_out_once() {
    let broker = MemoryBroker::new();
    let conn: BrokerPtr = broker.connect();
    conn.declare_durable(USER_REQUESTS).await.unwrap();
    let metrics = RpcMetrics::new(new_registry()).unwrap();
    let client = RpcClient::from_broker(conn).with_metrics(metrics.clone());

    let started = Instant::now();
    let err = client
        .send_request(USER_REQUESTS, &json!({}), Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(metrics.timeouts(USER_REQUESTS), 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn reply_arriving_after_the_timeout_is_dropped() {
    let broker = MemoryBroker::new();
    let server: BrokerPtr = broker.connect();
    server.declare_durable("slow_requests").await.unwrap();
    let mut requests = server.subscribe("slow_requests").await.unwrap();
    let metrics = RpcMetrics::new(new_registry()).unwrap();
    let client = RpcClient::from_broker(broker.connect()).with_metrics(metrics.clone());

    let err = client
        .send_request("slow_requests", &json!({ "n": 1 }), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let delivery = requests.recv().await.unwrap();
    let reply_to = delivery.message.reply_to().unwrap().to_owned();
    let correlation_id = delivery.message.correlation_id().unwrap().clone();
    assert!(!broker.queue_exists(&reply_to));

    let late = Message::json(&json!({ "late": true }))
        .unwrap()
        .with_correlation_id(correlation_id);
    server.publish(&reply_to, late).await.unwrap();
    delivery.ack().await.unwrap();

    assert!(!broker.queue_exists(&reply_to));
    assert_eq!(client.in_flight(), 0);
    assert_eq!(metrics.timeouts("slow_requests"), 1);
    assert_eq!(metrics.connection_errors("slow_requests"), 0);

    // The next call on the same client sees only its own reply.
    let responder = tokio::spawn(async move {
        let delivery = requests.recv().await.unwrap();
        let reply = Message::json(&json!({ "n": 2 }))
            .unwrap()
            .with_correlation_id(delivery.message.correlation_id().unwrap().clone());
        server
            .publish(delivery.message.reply_to().unwrap(), reply)
            .await
            .unwrap();
        delivery.ack().await.unwrap();
    });
    let reply = client
        .send_request("slow_requests", &json!({ "n": 2 }), Duration::from_secs(2))
        .await
        .unwrap();
    responder.await.unwrap();
    assert_eq!(reply, json!({ "n": 2 }));
    assert_eq!(metrics.timeouts("slow_requests"), 1);
}

#[tokio::test]
async fn duplicate_replies_are_discarded() {
    let broker = MemoryBroker::new();
    let server: BrokerPtr = broker.connect();
    server.declare_durable("duplicates").await.unwrap();
    let mut requests = server.subscribe("duplicates").await.unwrap();
    let client = RpcClient::from_broker(broker.connect());

    let responder = tokio::spawn(async move {
        let delivery = requests.recv().await.unwrap();
        let reply_to = delivery.message.reply_to().unwrap().to_owned();
        let correlation_id = delivery.message.correlation_id().unwrap().clone();
        for n in 1..=2 {
            let reply = Message::json(&json!({ "n": n }))
                .unwrap()
                .with_correlation_id(correlation_id.clone());
            server.publish(&reply_to, reply).await.unwrap();
        }
        delivery.ack().await.unwrap();
        reply_to
    });

    let reply = client
        .send_request("duplicates", &json!({}), Duration::from_secs(2))
        .await
        .unwrap();
    let reply_to = responder.await.unwrap();

    assert_eq!(reply, json!({ "n": 1 }));
    assert_eq!(client.in_flight(), 0);
    assert!(!broker.queue_exists(&reply_to));
}

#[tokio::test]
async fn dispatched_outcomes_are_counted() {
    let service = start_service().await;

    service
        .client
        .call(USER_REQUESTS, "system/echo", json!(1))
        .await
        .unwrap();
    let _ = service
        .client
        .call(USER_REQUESTS, "nope", json!(1))
        .await
        .unwrap_err();

    let metrics = service.metrics.clone();
    eventually(move || {
        metrics.dispatched(USER_REQUESTS, DispatchOutcome::Handled) == 1
            && metrics.dispatched(USER_REQUESTS, DispatchOutcome::NoSuchAction) == 1
    })
    .await;
    service.task.abort();
}
