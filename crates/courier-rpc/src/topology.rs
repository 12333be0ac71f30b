//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use courier_msg::Broker;
use tracing::info;

use crate::error::RpcError;

/// Declare every durable queue a deployment relies on. Safe to run from each service.
pub async fn declare_topology<S>(broker: &dyn Broker, queues: &[S]) -> Result<(), RpcError>
where
    S: AsRef<str>,
{
    for queue in queues {
        broker.declare_durable(queue.as_ref()).await?;
    }
    info!(
        backend = broker.name(),
        queues = queues.len(),
        "queue topology declared"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::TopologyConfig;
    use courier_msg::MemoryBroker;

    #[tokio::test]
    async fn declares_the_default_queues_idempotently() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let topology = TopologyConfig::default();
        declare_topology(conn.as_ref(), &topology.queues).await.unwrap();
        declare_topology(conn.as_ref(), &topology.queues).await.unwrap();
        for queue in &topology.queues {
            assert_eq!(broker.is_durable(queue), Some(true));
        }
    }
}
