//! ---
//! courier_section: "05-cli"
//! courier_subsection: "binary"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Control CLI for operators interacting with courier brokers."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use courier_common::{AppConfig, NOTIFICATION_REQUESTS, USER_REQUESTS};
use courier_msg::{BrokerPtr, MemoryBroker};
use courier_rpc::{
    declare_topology, ActionRegistry, Dispatcher, HandlerError, ManagedChannel, Notifier,
    RpcClient, RpcError, RpcMetrics, SubmissionNotifier, SubmissionStatus, SubmissionSummary,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::info;

use crate::serve::diagnostic_registry;

async fn sign_in(_action: String, payload: Value) -> Result<Value, HandlerError> {
    let email = payload
        .get("email")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::domain("email is required"))?;
    Ok(json!({
        "user": { "email": email, "role": "STUDENT" },
        "token": "demo-token",
    }))
}

fn demo_registry() -> Result<ActionRegistry> {
    let diagnostics = diagnostic_registry("demo")?;
    let mut builder = ActionRegistry::builder();
    for action in diagnostics.actions() {
        builder.register_shared(action, diagnostics.resolve(action)?)?;
    }
    builder.register("user/signin", sign_in)?;
    Ok(builder.build())
}

/// Run a dispatcher and a client against one in-process broker and print what happened.
pub async fn run(config: &AppConfig, requests: usize, metrics: RpcMetrics) -> Result<()> {
    let broker = MemoryBroker::with_prefetch(config.broker.prefetch);
    let service: BrokerPtr = broker.connect();
    declare_topology(service.as_ref(), &config.topology.queues).await?;

    let dispatcher = Dispatcher::new(service, demo_registry()?, config.dispatcher.clone())
        .with_service_name("demo-user-service")
        .with_metrics(metrics.clone());
    let (stop, shutdown) = watch::channel(false);
    let serving = dispatcher.spawn(USER_REQUESTS, shutdown);

    let channel = Arc::new(ManagedChannel::fixed(broker.connect()));
    let client = RpcClient::new(channel.clone())
        .with_default_timeout(config.client.request_timeout)
        .with_metrics(metrics);

    let calls = (0..requests).map(|id| {
        let client = client.clone();
        async move {
            client
                .call(USER_REQUESTS, "system/echo", json!({ "id": id }))
                .await
        }
    });
    let replies = futures::future::join_all(calls).await;
    let mut matched = 0;
    for (id, reply) in replies.into_iter().enumerate() {
        let reply = reply.with_context(|| format!("echo request {} failed", id))?;
        if reply["id"] == json!(id) {
            matched += 1;
        }
    }
    println!("echo: {}/{} replies matched their request", matched, requests);

    let signed_in = client
        .call(
            USER_REQUESTS,
            "user/signin",
            json!({ "email": "a@b.com", "password": "x" }),
        )
        .await?;
    println!("user/signin -> {}", signed_in);

    match client.call(USER_REQUESTS, "does/not-exist", json!({})).await {
        Err(RpcError::Remote { code, message }) => println!(
            "does/not-exist -> remote error [{}] {}",
            code.unwrap_or_default(),
            message
        ),
        other => anyhow::bail!("unexpected reply for unknown action: {:?}", other),
    }

    let notifier = SubmissionNotifier::new(Notifier::new(channel));
    notifier
        .notify_submission_evaluated(&SubmissionSummary {
            id: "demo-submission".into(),
            title: "Demo essay".into(),
            student_id: "demo-student".into(),
            professor_id: "demo-professor".into(),
            status: Some(SubmissionStatus::Approved),
            grade: Some(10.0),
        })
        .await;
    println!(
        "notification queue depth: {}",
        broker.ready_count(NOTIFICATION_REQUESTS)
    );

    let _ = stop.send(true);
    serving.await.context("dispatcher task panicked")??;
    info!("demo complete");
    Ok(())
}
