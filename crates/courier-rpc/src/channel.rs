//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Connection state machine shared by RPC clients and notifiers.
//!
//! A [`ManagedChannel`] moves between [`ChannelState::Disconnected`],
//! [`ChannelState::Connecting`] and [`ChannelState::Connected`]. When a caller finds the
//! connection missing or closed it makes exactly one inline connect attempt; if that fails the
//! caller gets [`RpcError::Connection`] immediately. Concurrent callers serialize on the
//! attempt, so a burst of requests after a drop triggers one reconnect, not many. A connect
//! that never resolves is bounded by each caller's own deadline; abandoning the attempt puts
//! the channel back in [`ChannelState::Disconnected`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use courier_logging::{log_system_event, LogContext, SystemEventOutcome};
use courier_msg::{BrokerPtr, TransportError};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::RpcError;

/// Opens broker connections for a [`ManagedChannel`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> Result<BrokerPtr, TransportError>;
}

#[async_trait]
impl<F, Fut> Connector for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<BrokerPtr, TransportError>> + Send + 'static,
{
    async fn connect(&self) -> Result<BrokerPtr, TransportError> {
        (self)().await
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Broker connection that re-establishes itself on demand.
pub struct ManagedChannel {
    connector: Box<dyn Connector>,
    current: AsyncMutex<Option<BrokerPtr>>,
    state: Mutex<ChannelState>,
    connects: AtomicU64,
}

impl ManagedChannel {
    /// Create a disconnected channel; the first use connects.
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            current: AsyncMutex::new(None),
            state: Mutex::new(ChannelState::Disconnected),
            connects: AtomicU64::new(0),
        }
    }

    /// Wrap an already-open broker connection that cannot be re-established.
    pub fn fixed(broker: BrokerPtr) -> Self {
        let reconnect = broker.clone();
        let mut channel = Self::new(move || {
            let broker = reconnect.clone();
            async move {
                if broker.is_open() {
                    Ok(broker)
                } else {
                    Err(TransportError::Closed)
                }
            }
        });
        *channel.state.get_mut() = ChannelState::Connected;
        *channel.current.get_mut() = Some(broker);
        channel
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Number of successful connect attempts so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Return an open broker connection, reconnecting once if needed.
    pub async fn ensure_connected(&self) -> Result<BrokerPtr, RpcError> {
        let mut current = self.current.lock().await;
        if let Some(broker) = current.as_ref() {
            if broker.is_open() {
                return Ok(broker.clone());
            }
            log_system_event(
                Some(&LogContext::new().with_service(broker.name())),
                "channel.dropped",
                "broker connection closed; reconnecting",
                SystemEventOutcome::Fault,
            );
        }
        *current = None;
        *self.state.lock() = ChannelState::Connecting;
        let _attempt = ConnectAttempt(&self.state);

        match self.connector.connect().await {
            Ok(broker) if broker.is_open() => {
                self.connects.fetch_add(1, Ordering::Relaxed);
                *self.state.lock() = ChannelState::Connected;
                log_system_event(
                    Some(&LogContext::new().with_service(broker.name())),
                    "channel.connected",
                    "broker connection established",
                    SystemEventOutcome::Success,
                );
                *current = Some(broker.clone());
                Ok(broker)
            }
            Ok(_) => {
                *self.state.lock() = ChannelState::Disconnected;
                Err(RpcError::Connection(
                    "connector returned a closed connection".to_owned(),
                ))
            }
            Err(err) => {
                *self.state.lock() = ChannelState::Disconnected;
                log_system_event(
                    None,
                    "channel.connect_failed",
                    &err.to_string(),
                    SystemEventOutcome::Fault,
                );
                Err(RpcError::Connection(err.to_string()))
            }
        }
    }

    /// Close the current connection, if any.
    pub async fn close(&self) -> Result<(), RpcError> {
        let mut current = self.current.lock().await;
        *self.state.lock() = ChannelState::Disconnected;
        if let Some(broker) = current.take() {
            broker.close().await?;
        }
        Ok(())
    }
}

/// Resets a `Connecting` state left behind by a cancelled connect.
struct ConnectAttempt<'a>(&'a Mutex<ChannelState>);

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_msg::{Broker, MemoryBroker};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn connects_lazily_and_reuses_the_connection() {
        let broker = MemoryBroker::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let channel = ManagedChannel::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let conn: BrokerPtr = broker.connect();
            async move { Ok::<_, TransportError>(conn) }
        });
        assert_eq!(channel.state(), ChannelState::Disconnected);

        let first = channel.ensure_connected().await.unwrap();
        let second = channel.ensure_connected().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn reconnects_once_after_a_drop() {
        let broker = MemoryBroker::new();
        let channel = ManagedChannel::new(move || {
            let conn: BrokerPtr = broker.connect();
            async move { Ok::<_, TransportError>(conn) }
        });
        let first = channel.ensure_connected().await.unwrap();
        first.close().await.unwrap();

        let second = channel.ensure_connected().await.unwrap();
        assert!(second.is_open());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(channel.connect_count(), 2);
    }

    #[tokio::test]
    async fn abandoned_connect_leaves_the_channel_disconnected() {
        let channel = ManagedChannel::new(|| async {
            futures::future::pending::<Result<BrokerPtr, TransportError>>().await
        });
        let attempt =
            tokio::time::timeout(Duration::from_millis(50), channel.ensure_connected()).await;
        assert!(attempt.is_err());
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn failed_reconnect_is_a_connection_error() {
        let broker = MemoryBroker::new();
        let conn: BrokerPtr = broker.connect();
        let channel = ManagedChannel::fixed(conn.clone());
        assert_eq!(channel.state(), ChannelState::Connected);
        channel.ensure_connected().await.unwrap();

        conn.close().await.unwrap();
        let err = channel.ensure_connected().await.err().unwrap();
        assert!(err.is_connection());
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
