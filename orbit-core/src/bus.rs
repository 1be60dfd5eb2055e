//! Message bus seam
//!
//! A [`Broker`] hands out sessions; finalizing a session declares the
//! topology and yields a publisher plus a stream of deliveries. The
//! delivery channel closing is how a session reports disconnection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

pub const DEFAULT_EXCHANGE: &str = "orbitctl.deployment_events";
pub const DEFAULT_PERSISTENCE_QUEUE: &str = "orbitctl.deployment_events.persistence";

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publishing while not connected; callers should not retry
    #[error("message bus is not connected")]
    NotConnected,
    #[error("failed to connect to message bus: {0}")]
    Connect(String),
    #[error("failed to declare bus topology: {0}")]
    Declare(String),
    #[error("failed to publish: {0}")]
    Publish(String),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BusError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BusError::NotConnected | BusError::Encode(_))
    }
}

/// Connection state of the queue client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    NotStarted,
    Connecting,
    /// Declaring the exchange and queues, binding the consumer
    FinalizingConnection,
    Connected,
    TryingAgain,
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusTopology {
    /// Durable topic exchange
    pub exchange: String,
    /// Durable queue that keeps every event
    pub persistence_queue: String,
    pub binding_key: String,
}

impl Default for BusTopology {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            persistence_queue: DEFAULT_PERSISTENCE_QUEUE.to_string(),
            binding_key: "#".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publishes a persistent message to the topic exchange
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// A connected, finalized session
pub struct BusLink {
    pub publisher: Arc<dyn BusPublisher>,
    /// Closes when the connection is lost
    pub deliveries: mpsc::Receiver<BusMessage>,
}

#[async_trait]
pub trait BrokerSession: Send {
    async fn finalize(self: Box<Self>, topology: &BusTopology) -> Result<BusLink, BusError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BusError>;
}

#[derive(Debug, Default)]
struct BrokerState {
    subscribers: Vec<mpsc::Sender<BusMessage>>,
    persisted: Vec<BusMessage>,
    topology: Option<BusTopology>,
    refuse_connects: usize,
    connect_attempts: usize,
}

/// In-process topic exchange. Every finalized session receives every
/// message; all messages are also kept, like the persistence queue.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `n` connection attempts fail
    pub fn refuse_next_connects(&self, n: usize) {
        self.lock().refuse_connects = n;
    }

    /// Drops every live session, closing their delivery channels
    pub fn disconnect_all(&self) {
        self.lock().subscribers.clear();
    }

    pub fn persisted(&self) -> Vec<BusMessage> {
        self.lock().persisted.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn declared_topology(&self) -> Option<BusTopology> {
        self.lock().topology.clone()
    }

    pub fn session_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Delivers a message as if another agent had published it
    pub fn inject(&self, routing_key: &str, payload: Vec<u8>) {
        self.deliver(BusMessage {
            routing_key: routing_key.to_string(),
            payload,
        });
    }

    fn deliver(&self, message: BusMessage) {
        let mut state = self.lock();
        state.persisted.push(message.clone());
        state
            .subscribers
            .retain(|tx| tx.try_send(message.clone()).is_ok() || !tx.is_closed());
    }
}

struct MemorySession {
    broker: MemoryBroker,
}

struct MemoryPublisher {
    broker: MemoryBroker,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BusError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BusError::Connect("connection refused".into()));
        }
        Ok(Box::new(MemorySession {
            broker: self.clone(),
        }))
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn finalize(self: Box<Self>, topology: &BusTopology) -> Result<BusLink, BusError> {
        let (tx, rx) = mpsc::channel(64);
        {
            let mut state = self.broker.lock();
            state.topology = Some(topology.clone());
            state.subscribers.push(tx);
        }
        Ok(BusLink {
            publisher: Arc::new(MemoryPublisher {
                broker: self.broker.clone(),
            }),
            deliveries: rx,
        })
    }
}

#[async_trait]
impl BusPublisher for MemoryPublisher {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.broker.inject(routing_key, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sessions_receive_published_messages() {
        let broker = MemoryBroker::new();
        let link = broker
            .connect()
            .await
            .unwrap()
            .finalize(&BusTopology::default())
            .await
            .unwrap();
        let mut other = broker
            .connect()
            .await
            .unwrap()
            .finalize(&BusTopology::default())
            .await
            .unwrap();

        link.publisher
            .publish("DeploymentEvent", b"{}".to_vec())
            .await
            .unwrap();

        let message = other.deliveries.recv().await.unwrap();
        assert_eq!(message.routing_key, "DeploymentEvent");
        assert_eq!(broker.persisted().len(), 1);
        assert_eq!(broker.declared_topology(), Some(BusTopology::default()));
    }

    #[tokio::test]
    async fn test_refused_connects_and_disconnect() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(1);
        assert!(broker.connect().await.is_err());

        let mut link = broker
            .connect()
            .await
            .unwrap()
            .finalize(&BusTopology::default())
            .await
            .unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.session_count(), 1);

        broker.disconnect_all();
        assert!(link.deliveries.recv().await.is_none());
    }

    #[test]
    fn test_not_connected_is_not_retryable() {
        assert!(!BusError::NotConnected.is_retryable());
        assert!(BusError::Connect("x".into()).is_retryable());
    }
}
