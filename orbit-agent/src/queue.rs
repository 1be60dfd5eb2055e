//! Queue client: keeps one bus session alive and feeds its deliveries to the
//! dispatcher as network events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use orbit_core::bus::{Broker, BusError, BusLink, BusPublisher, BusTopology, QueueState};
use orbit_core::event::OrbitEvent;

/// Wait between failed connection attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Wait before reconnecting after a session drops
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct QueueClient {
    broker: Arc<dyn Broker>,
    topology: BusTopology,
    state: watch::Sender<QueueState>,
    publisher: RwLock<Option<Arc<dyn BusPublisher>>>,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn Broker>, topology: BusTopology) -> Self {
        let (state, _) = watch::channel(QueueState::NotStarted);
        Self {
            broker,
            topology,
            state,
            publisher: RwLock::new(None),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<QueueState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: QueueState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "queue state");
        }
    }

    /// Publishes with the event type as routing key. Fails without retrying
    /// unless the client is connected.
    pub async fn publish(&self, event: &OrbitEvent) -> Result<(), BusError> {
        if self.state() != QueueState::Connected {
            return Err(BusError::NotConnected);
        }
        let publisher = self
            .publisher
            .read()
            .await
            .clone()
            .ok_or(BusError::NotConnected)?;
        publisher.publish(event.type_name(), event.to_json()?).await
    }

    async fn connect(&self) -> Result<BusLink, BusError> {
        let session = self.broker.connect().await?;
        self.set_state(QueueState::FinalizingConnection);
        session.finalize(&self.topology).await
    }

    async fn disconnected(&self) {
        *self.publisher.write().await = None;
        self.set_state(QueueState::Disconnected);
    }

    /// Connects, forwards deliveries to `events` and reconnects after
    /// failures. Returns once `events` is closed.
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<OrbitEvent>) {
        loop {
            self.set_state(QueueState::Connecting);
            let link = match self.connect().await {
                Ok(link) => link,
                Err(e) => {
                    warn!(error = %e, retry_in = ?RETRY_INTERVAL, "bus connection failed");
                    self.set_state(QueueState::TryingAgain);
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_INTERVAL) => continue,
                        _ = events.closed() => return self.disconnected().await,
                    }
                }
            };

            *self.publisher.write().await = Some(link.publisher);
            self.set_state(QueueState::Connected);
            info!(exchange = %self.topology.exchange, "connected to message bus");

            let mut deliveries = link.deliveries;
            loop {
                tokio::select! {
                    message = deliveries.recv() => {
                        let Some(message) = message else { break };
                        match OrbitEvent::from_json(&message.payload) {
                            Ok(event) => {
                                if events.send(event).await.is_err() {
                                    return self.disconnected().await;
                                }
                            }
                            Err(e) => warn!(
                                routing_key = %message.routing_key,
                                error = %e,
                                "dropping undecodable bus message"
                            ),
                        }
                    }
                    _ = events.closed() => return self.disconnected().await,
                }
            }

            self.disconnected().await;
            warn!("message bus disconnected");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = events.closed() => return,
            }
        }
    }
}
