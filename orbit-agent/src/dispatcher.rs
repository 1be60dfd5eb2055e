use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use orbit_core::event::OrbitEvent;

use crate::agent::{Agent, Origin};

/// Cadence of the periodic block when no event arrives
pub const IDLE_TICK: Duration = Duration::from_secs(2);

/// Single reader over the exit signal, bus events and loopback events, in
/// that priority order
pub struct Dispatcher {
    agent: Arc<Agent>,
    network: mpsc::Receiver<OrbitEvent>,
    loopback: mpsc::Receiver<OrbitEvent>,
}

impl Dispatcher {
    pub fn new(
        agent: Arc<Agent>,
        network: mpsc::Receiver<OrbitEvent>,
        loopback: mpsc::Receiver<OrbitEvent>,
    ) -> Self {
        Self {
            agent,
            network,
            loopback,
        }
    }

    /// Runs until `exit` resolves. Commands already started keep running.
    pub async fn run(mut self, exit: impl Future<Output = ()>) {
        tokio::pin!(exit);
        let mut idle = tokio::time::interval(IDLE_TICK);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut exit => {
                    info!("exit requested, dispatcher stopping");
                    return;
                }
                Some(event) = self.network.recv() => {
                    self.agent.handle(event, Origin::Network).await;
                }
                Some(event) = self.loopback.recv() => {
                    self.agent.handle(event, Origin::Loopback).await;
                }
                _ = idle.tick() => self.agent.tick(Instant::now()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use orbit_core::event::{DeploymentAction, DeploymentEvent};
    use tokio::sync::oneshot;

    use super::*;
    use crate::agent::fixtures::harness;

    #[tokio::test(start_paused = true)]
    async fn test_idle_tick_polls_and_pings() {
        let h = harness();
        let keepalive = h.agent.keepalive();
        let (_network_tx, network) = mpsc::channel(1);
        let (stop_tx, stop) = oneshot::channel::<()>();

        let dispatcher = Dispatcher::new(h.agent.clone(), network, h.channels.loopback);
        let running = tokio::spawn(dispatcher.run(async {
            let _ = stop.await;
        }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(keepalive.is_alive());
        // the first tick fires at once and schedules a poll
        let mut configs = h.channels.check_configs;
        let machine = configs.recv().await.unwrap();
        assert!(machine.services.contains_key("web"));
        assert_eq!(h.runtime.running().len(), 1);

        stop_tx.send(()).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_wins_over_pending_events() {
        let h = harness();
        let (network_tx, network) = mpsc::channel(4);
        network_tx
            .send(OrbitEvent::deployment(DeploymentEvent {
                action: DeploymentAction::Restart,
                service: "web".into(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(h.agent.clone(), network, h.channels.loopback);
        dispatcher.run(async {}).await;

        assert!(h.agent.commands().active_names().is_empty());
        assert!(h.runtime.calls().is_empty());
    }
}
