//! ---
//! courier_section: "02-messaging-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message envelopes and broker transports."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use courier_msg::{
    ActionRequest, Broker, BrokerPtr, CorrelationId, MemoryBroker, Message, TransportError,
};
use serde_json::json;
use tokio::time::timeout;

#[tokio::test]
async fn request_envelope_survives_the_broker() {
    let broker = MemoryBroker::new();
    let service: BrokerPtr = broker.connect();
    let caller: BrokerPtr = broker.connect();

    service.declare_durable("user_requests").await.expect("declare");
    let reply_queue = caller.declare_ephemeral().await.expect("reply queue");
    let mut requests = service.subscribe("user_requests").await.expect("subscribe");

    let correlation_id = CorrelationId::generate();
    let request = ActionRequest::new("user/signin", json!({ "email": "a@b.com" }));
    caller
        .publish(
            "user_requests",
            Message::json(&request)
                .expect("encode")
                .with_correlation_id(correlation_id.clone())
                .with_reply_to(reply_queue.clone()),
        )
        .await
        .expect("publish");

    let delivery = timeout(Duration::from_secs(1), requests.recv())
        .await
        .expect("delivery in time")
        .expect("subscription open");
    assert_eq!(delivery.queue, "user_requests");
    assert_eq!(delivery.message.correlation_id(), Some(&correlation_id));
    assert_eq!(delivery.message.reply_to(), Some(reply_queue.as_str()));
    let decoded: ActionRequest = delivery.message.decode_json().expect("decode");
    assert_eq!(decoded, request);
    delivery.ack().await.expect("ack");
    assert_eq!(broker.unacked_count("user_requests"), 0);
}

#[tokio::test]
async fn every_message_reaches_exactly_one_competing_consumer() {
    let broker = MemoryBroker::with_prefetch(4);
    let conn: BrokerPtr = broker.connect();
    conn.declare_durable("submission_requests").await.expect("declare");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut workers = Vec::new();
    for _ in 0..3 {
        let mut subscription = conn.subscribe("submission_requests").await.expect("subscribe");
        let tx = tx.clone();
        workers.push(tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                let body = String::from_utf8_lossy(&delivery.message.body).into_owned();
                delivery.ack().await.expect("ack");
                if tx.send(body).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let publisher = Arc::clone(&conn);
    for i in 0..60 {
        publisher
            .publish("submission_requests", Message::new(format!("m-{i}")))
            .await
            .expect("publish");
    }

    let mut seen = HashSet::new();
    while seen.len() < 60 {
        let body = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message in time")
            .expect("workers alive");
        assert!(seen.insert(body), "message delivered twice");
    }
    assert_eq!(broker.ready_count("submission_requests"), 0);

    conn.close().await.expect("close");
    for worker in workers {
        worker.await.expect("worker exits");
    }
}

#[tokio::test]
async fn closed_connection_rejects_operations() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    conn.close().await.expect("close");
    conn.close().await.expect("close twice");
    assert!(matches!(
        conn.declare_durable("q").await,
        Err(TransportError::Closed)
    ));
    assert!(matches!(conn.declare_ephemeral().await, Err(TransportError::Closed)));
    assert!(TransportError::Closed.is_connection_failure());
    assert!(!TransportError::QueueNotFound("q".into()).is_connection_failure());
}

#[tokio::test]
async fn dropping_a_connection_releases_its_reply_queues() {
    let broker = MemoryBroker::new();
    let reply_queue = {
        let conn = broker.connect();
        conn.declare_ephemeral().await.expect("declare")
    };
    assert!(!broker.queue_exists(&reply_queue));
}
