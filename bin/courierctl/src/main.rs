//! ---
//! courier_section: "05-cli"
//! courier_subsection: "binary"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Control CLI for operators interacting with courier brokers."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_common::{
    encode_text, init_tracing, new_registry, AppConfig, BrokerConfig, BrokerKind,
};
use courier_msg::{
    default_consumer_name, ActionRequest, BrokerPtr, MemoryBroker, RedisBroker,
    RedisBrokerConfig, TransportError,
};
use courier_rpc::{declare_topology, ManagedChannel, Notifier, RpcClient, RpcMetrics};
use serde_json::Value;
use tracing::{info, warn};

mod demo;
mod serve;

#[derive(Debug, Parser)]
#[command(author, version, about = "courier request/reply control utility", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "KIND", help = "Override broker backend (memory | redis)")]
    broker: Option<BrokerKind>,

    #[arg(long, value_name = "URL", help = "Override broker URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Declare the configured durable queues")]
    Declare,
    #[command(about = "Send {action, data} to a queue and print the reply")]
    Request {
        queue: String,
        action: String,
        #[arg(default_value = "{}", help = "JSON payload")]
        data: String,
        #[arg(long, value_name = "SECS", help = "Reply timeout in seconds")]
        timeout: Option<u64>,
    },
    #[command(about = "Publish a one-way {action, data} event")]
    Publish {
        queue: String,
        action: String,
        #[arg(default_value = "{}", help = "JSON payload")]
        data: String,
    },
    #[command(about = "Run a diagnostic service answering system/ping and system/echo")]
    Serve {
        #[arg(help = "Queues to consume; defaults to the configured topology")]
        queues: Vec<String>,
    },
    #[command(about = "Run an in-process request/reply round trip against the memory broker")]
    Demo {
        #[arg(long, default_value_t = 16, help = "Concurrent echo requests")]
        requests: usize,
        #[arg(long, help = "Print collected metrics afterwards")]
        dump_metrics: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/courier.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(kind) = cli.broker {
        config.broker.kind = kind;
    }
    if let Some(url) = cli.url {
        config.broker.url = url;
    }
    config.validate()?;
    init_tracing("courierctl", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    match cli.command {
        Commands::Declare => {
            let broker = connect(&config.broker, &memory_broker(&config.broker))
                .await
                .context("broker unavailable")?;
            declare_topology(broker.as_ref(), &config.topology.queues).await?;
            println!("declared {} queue(s)", config.topology.queues.len());
        }
        Commands::Request {
            queue,
            action,
            data,
            timeout,
        } => {
            if config.broker.kind == BrokerKind::Memory {
                warn!("memory broker is process-local; nothing outside this process will answer");
            }
            let client = RpcClient::new(managed_channel(&config.broker, memory_broker(&config.broker)));
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(config.client.request_timeout);
            let request = ActionRequest::new(action, parse_json(&data)?);
            let reply = client.send_request(&queue, &request, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Publish {
            queue,
            action,
            data,
        } => {
            let notifier = Notifier::new(managed_channel(&config.broker, memory_broker(&config.broker)));
            let event = ActionRequest::new(action, parse_json(&data)?);
            notifier.try_publish_event(&queue, &event).await?;
            println!("published to {}", queue);
        }
        Commands::Serve { queues } => {
            let queues = if queues.is_empty() {
                config.topology.queues.clone()
            } else {
                queues
            };
            let broker = connect(&config.broker, &memory_broker(&config.broker))
                .await
                .context("broker unavailable at startup")?;
            let metrics = if config.metrics.enabled {
                Some(RpcMetrics::new(new_registry())?)
            } else {
                None
            };
            serve::run(broker, &config, &queues, metrics).await?;
        }
        Commands::Demo {
            requests,
            dump_metrics,
        } => {
            let registry = new_registry();
            let metrics = RpcMetrics::new(registry.clone())?;
            demo::run(&config, requests, metrics).await?;
            if dump_metrics {
                print!("{}", encode_text(&registry)?);
            }
        }
    }

    Ok(())
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("payload is not valid JSON: {}", raw))
}

fn memory_broker(config: &BrokerConfig) -> MemoryBroker {
    MemoryBroker::with_prefetch(config.prefetch)
}

fn redis_config(config: &BrokerConfig) -> RedisBrokerConfig {
    RedisBrokerConfig {
        url: config.url.clone(),
        group: config.consumer_group.clone(),
        consumer_name: config
            .consumer_name
            .clone()
            .unwrap_or_else(default_consumer_name),
        reply_queue_ttl: config.reply_queue_ttl,
        block_interval: config.block_interval,
        prefetch: config.prefetch,
    }
}

async fn connect(config: &BrokerConfig, memory: &MemoryBroker) -> Result<BrokerPtr, TransportError> {
    match config.kind {
        BrokerKind::Memory => Ok(memory.connect()),
        BrokerKind::Redis => {
            let broker = RedisBroker::connect(redis_config(config)).await?;
            Ok(Arc::new(broker))
        }
    }
}

fn managed_channel(config: &BrokerConfig, memory: MemoryBroker) -> Arc<ManagedChannel> {
    let config = config.clone();
    Arc::new(ManagedChannel::new(move || {
        let config = config.clone();
        let memory = memory.clone();
        async move { connect(&config, &memory).await }
    }))
}
