//! ---
//! courier_section: "05-cli"
//! courier_subsection: "binary"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Control CLI for operators interacting with courier brokers."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use courier_common::AppConfig;
use courier_logging::{log_system_event, LogContext, SystemEventOutcome};
use courier_msg::BrokerPtr;
use courier_rpc::{
    declare_topology, ActionRegistry, Dispatcher, HandlerError, RegistryError, RpcMetrics,
};
use serde_json::{json, Value};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// Registry of the diagnostic actions every courier service can answer.
pub fn diagnostic_registry(service: &str) -> Result<ActionRegistry, RegistryError> {
    let service = service.to_owned();
    let mut builder = ActionRegistry::builder();
    builder
        .register("system/ping", move |_action: String, _payload: Value| {
            let service = service.clone();
            async move { Ok::<_, HandlerError>(json!({ "pong": true, "service": service })) }
        })?
        .register("system/echo", |_action: String, payload: Value| async move {
            Ok::<_, HandlerError>(payload)
        })?;
    Ok(builder.build())
}

pub async fn run(
    broker: BrokerPtr,
    config: &AppConfig,
    queues: &[String],
    metrics: Option<RpcMetrics>,
) -> Result<()> {
    declare_topology(broker.as_ref(), queues).await?;
    let registry = diagnostic_registry("courierctl")?;
    let mut dispatcher = Dispatcher::new(broker.clone(), registry, config.dispatcher.clone())
        .with_service_name("courierctl");
    if let Some(metrics) = metrics {
        dispatcher = dispatcher.with_metrics(metrics);
    }

    if queues.is_empty() {
        anyhow::bail!("no queues to serve");
    }
    let (stop, shutdown) = watch::channel(false);
    let mut tasks = Vec::with_capacity(queues.len());
    for queue in queues {
        tasks.push(dispatcher.spawn(queue.clone(), shutdown.clone()));
    }
    info!(queues = ?queues, "diagnostic service running; waiting for termination signal");

    let early_exit = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received; shutting down");
            None
        }
        (finished, index, _) = futures::future::select_all(tasks.iter_mut()) => Some((index, finished)),
    };

    let _ = stop.send(true);
    let early_result = early_exit.map(|(index, finished)| {
        tasks.remove(index);
        finished
    });
    for task in tasks {
        task.await.context("dispatcher task panicked")??;
    }
    broker.close().await?;

    let ctx = LogContext::new().with_service("courierctl");
    // A dispatcher only returns on its own when its subscription is lost.
    if let Some(finished) = early_result {
        log_system_event(
            Some(&ctx),
            "service.stop",
            "dispatcher stopped without a shutdown request",
            SystemEventOutcome::Fault,
        );
        finished.context("dispatcher task panicked")??;
        anyhow::bail!("dispatcher stopped unexpectedly");
    }
    log_system_event(
        Some(&ctx),
        "service.stop",
        "diagnostic service stopped",
        SystemEventOutcome::Success,
    );
    Ok(())
}
