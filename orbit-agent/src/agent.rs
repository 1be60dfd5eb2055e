//! Event handlers and the named tasks they start
//!
//! The dispatcher owns the receive loop; everything it does with an event
//! or an idle tick lives here. Long-running work goes through the command
//! controller so at most one poll, container converge or LB converge runs
//! at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use orbit_core::command::{Command, CommandController};
use orbit_core::config::AgentConfig;
use orbit_core::event::{
    DeploymentAction, DeploymentEvent, EventPayload, NewRuntimeConfigurationEvent, OrbitEvent,
    ServiceStateEvent,
};
use orbit_core::kvs::{KeyValueStore, Keyspace};
use orbit_core::model::{HAProxyConfiguration, MachineConfiguration, RuntimeConfiguration};
use orbit_core::runtime::{ContainerRuntime, RuntimeError};

use crate::containers::{ContainerReconciler, STOP_GRACE};
use crate::event_log::EventLog;
use crate::haproxy::HaproxyReconciler;
use crate::health::{CONFIGS_CAPACITY, RESULTS_CAPACITY};
use crate::keepalive::Keepalive;
use crate::poller::{Change, ConfigPoller, classify};
use crate::publisher::ResultPublisher;
use crate::queue::QueueClient;

pub const POLL_COMMAND: &str = "PollConfigurationUpdate";
pub const CONVERGE_COMMAND: &str = "ConvergeContainers";
pub const HAPROXY_CONVERGE_COMMAND: &str = "HaproxyConverge";
pub const HAPROXY_SOFT_SYNC_COMMAND: &str = "HaproxySoftSync";

/// Minimum spacing between polls, measured from the last good converge
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// A service down this long gets its container relaunched
pub const RELAUNCH_AFTER: Duration = Duration::from_secs(60);
/// Quiet period after a relaunch so the restart is observed first
pub const RELAUNCH_COOLDOWN: Duration = Duration::from_secs(60);

pub fn relaunch_command(service: &str) -> String {
    format!("automatic-relaunch-service-{}", service)
}

/// Where an event came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Network,
    Loopback,
}

fn jitter(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_secs * 1000))
}

/// Pending LB reload. Stamps are milliseconds since `epoch` plus one so
/// that zero can mean "no reload pending".
#[derive(Debug)]
pub(crate) struct UpdateWindow {
    epoch: Instant,
    start: AtomicU64,
    current: AtomicU64,
}

impl UpdateWindow {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            start: AtomicU64::new(0),
            current: AtomicU64::new(0),
        }
    }

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64 + 1
    }

    pub(crate) fn mark(&self, now: Instant) {
        let stamp = self.stamp(now);
        let _ = self
            .start
            .compare_exchange(0, stamp, Ordering::SeqCst, Ordering::SeqCst);
        self.current.store(stamp, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.start.store(0, Ordering::SeqCst);
        self.current.store(0, Ordering::SeqCst);
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.start.load(Ordering::SeqCst) != 0
    }

    /// Quiet for `quiet`, or open for longer than `max`
    pub(crate) fn is_due(&self, now: Instant, quiet: Duration, max: Duration) -> bool {
        let start = self.start.load(Ordering::SeqCst);
        if start == 0 {
            return false;
        }
        let current = self.current.load(Ordering::SeqCst);
        let now = self.stamp(now);
        now.saturating_sub(current) >= quiet.as_millis() as u64
            || now.saturating_sub(start) >= max.as_millis() as u64
    }
}

/// Receivers the agent's components feed
pub struct AgentChannels {
    /// Check results and events the agent sends itself
    pub loopback: mpsc::Receiver<OrbitEvent>,
    /// Configurations for the check engine
    pub check_configs: mpsc::Receiver<MachineConfiguration>,
}

pub struct Agent {
    config: AgentConfig,
    commands: CommandController,
    poller: ConfigPoller,
    containers: ContainerReconciler,
    haproxy: Option<HaproxyReconciler>,
    publisher: ResultPublisher,
    queue: Option<Arc<QueueClient>>,
    keepalive: Keepalive,
    event_log: EventLog,
    loopback: mpsc::Sender<OrbitEvent>,
    check_configs: mpsc::Sender<MachineConfiguration>,
    current: RwLock<Option<RuntimeConfiguration>>,
    last_converge: Mutex<Option<Instant>>,
    window: UpdateWindow,
    converge_lock: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        kvs: Arc<dyn KeyValueStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> (Self, AgentChannels) {
        let keyspace = Keyspace::new(&config.kvs.base_path);
        let (loopback_tx, loopback_rx) = mpsc::channel(RESULTS_CAPACITY);
        let (configs_tx, configs_rx) = mpsc::channel(CONFIGS_CAPACITY);

        let agent = Self {
            commands: CommandController::new(),
            poller: ConfigPoller::new(kvs.clone(), keyspace.clone(), config.tags.clone()),
            containers: ContainerReconciler::new(runtime),
            haproxy: config.haproxy.clone().map(HaproxyReconciler::new),
            publisher: ResultPublisher::new(kvs, keyspace),
            queue: None,
            keepalive: Keepalive::new(),
            event_log: EventLog::stderr(),
            loopback: loopback_tx,
            check_configs: configs_tx,
            current: RwLock::new(None),
            last_converge: Mutex::new(None),
            window: UpdateWindow::new(Instant::now()),
            converge_lock: tokio::sync::Mutex::new(()),
            config,
        };
        let channels = AgentChannels {
            loopback: loopback_rx,
            check_configs: configs_rx,
        };
        (agent, channels)
    }

    pub fn with_queue(mut self, queue: Arc<QueueClient>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_event_log(mut self, event_log: EventLog) -> Self {
        self.event_log = event_log;
        self
    }

    /// Sender for events the agent should handle itself, such as check results
    pub fn loopback(&self) -> mpsc::Sender<OrbitEvent> {
        self.loopback.clone()
    }

    pub fn keepalive(&self) -> Keepalive {
        self.keepalive.clone()
    }

    pub fn commands(&self) -> &CommandController {
        &self.commands
    }

    pub fn current(&self) -> Option<RuntimeConfiguration> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, runtime: RuntimeConfiguration) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
    }

    fn current_haproxy(&self) -> Option<HAProxyConfiguration> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|runtime| runtime.machine_configuration.haproxy.clone())
    }

    fn has_container(&self, service: &str) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|runtime| runtime.machine_configuration.services.get(service))
            .is_some_and(|bound| bound.config.container.is_some())
    }

    pub fn last_converge(&self) -> Option<Instant> {
        *self
            .last_converge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_local(&self, endpoint: &str) -> bool {
        endpoint
            .rsplit_once(':')
            .is_some_and(|(host, _)| host == self.config.machine_address)
    }

    /// Handles one event. Deployments and container converges run as
    /// commands; everything else runs before the next event is read.
    pub async fn handle(self: &Arc<Self>, event: OrbitEvent, origin: Origin) {
        self.event_log.record(&event);

        match event.payload {
            EventPayload::Noop => {}
            EventPayload::Deployment(deployment) => {
                let name = format!("deployment-{}", deployment.service);
                let command = self.commands.invoke_named(
                    name,
                    Agent::on_deployment,
                    (self.clone(), deployment),
                );
                self.report(Some(command));
            }
            EventPayload::ServiceState(state) => self.on_service_state(state, origin).await,
            EventPayload::NewRuntimeConfiguration(update) => {
                self.on_new_runtime_configuration(*update)
            }
            EventPayload::ConvergeContainers(converge) => {
                let agent = self.clone();
                let command = self.commands.invoke_if_not_already_running(
                    CONVERGE_COMMAND,
                    |machine| async move { agent.converge_containers(machine).await },
                    converge.machine_configuration,
                );
                self.report(command);
            }
            EventPayload::Unknown { type_name } => {
                debug!(event = %type_name, ?origin, "ignoring unknown event")
            }
        }
    }

    /// The idle-tick block: keepalive, poll gate and deferred LB reload
    pub fn tick(self: &Arc<Self>, now: Instant) {
        if !self.config.check_engine.enabled {
            return;
        }
        self.keepalive.ping();

        let poll_due = self
            .last_converge()
            .is_none_or(|at| now.saturating_duration_since(at) >= POLL_INTERVAL);
        if poll_due {
            let poll = self.schedule_poll();
            self.report(poll);
        }

        if let Some(haproxy) = &self.haproxy {
            let settings = haproxy.settings();
            if self.window.is_due(
                now,
                settings.no_updates_delay_window(),
                settings.max_delay(),
            ) {
                let agent = self.clone();
                let command = self.commands.invoke_if_not_already_running(
                    HAPROXY_CONVERGE_COMMAND,
                    |()| async move { agent.converge_haproxy().await },
                    (),
                );
                self.report(command);
            }
        }
    }

    /// Logs the command's failure once it finishes
    fn report(self: &Arc<Self>, command: Option<Command>) {
        let Some(command) = command else {
            return;
        };
        let agent = self.clone();
        tokio::spawn(async move {
            let name = command.name.clone();
            if let Err(e) = command.wait().await {
                let error = format!("{:#}", e);
                warn!(command = %name, %error, "command failed");
                agent.event_log.record_value(
                    "CommandFailed",
                    &serde_json::json!({ "command": name, "error": error }),
                );
            }
        });
    }

    pub fn schedule_poll(self: &Arc<Self>) -> Option<Command> {
        let agent = self.clone();
        self.commands.invoke_if_not_already_running(
            POLL_COMMAND,
            |()| async move { agent.poll_configuration().await },
            (),
        )
    }

    /// Reads the KVS, announces material changes and converges containers
    /// to the result.
    pub async fn poll_configuration(self: Arc<Self>) -> anyhow::Result<()> {
        let new = self.poller.fetch().await?;
        let previous = self.current();

        match classify(previous.as_ref(), &new) {
            Change::Changed => {
                info!("runtime configuration changed");
                self.set_current(new.clone());
                let event = NewRuntimeConfigurationEvent {
                    old_valid: previous.is_some(),
                    old: previous.unwrap_or_default(),
                    new: new.clone(),
                };
                self.loopback
                    .send(OrbitEvent::new_runtime_configuration(event))
                    .await?;
            }
            Change::BackendsOnly => {
                debug!("backend servers changed");
                self.set_current(new.clone());
                if let Some(desired) = &new.machine_configuration.haproxy {
                    self.soft_sync(desired).await;
                }
            }
            Change::Unchanged => {}
        }

        self.converge_containers(new.machine_configuration).await
    }

    pub async fn converge_containers(&self, machine: MachineConfiguration) -> anyhow::Result<()> {
        let _guard = self.converge_lock.lock().await;
        let report = self.containers.converge(&machine).await?;
        if !report.ambiguous.is_empty() {
            warn!(services = ?report.ambiguous, "ambiguous containers left untouched");
        }
        if !report.is_complete() {
            anyhow::bail!(
                "converge incomplete: failed services {:?}, leftovers not removed {:?}",
                report.failed,
                report.cleanup_failed
            );
        }

        *self
            .last_converge
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        if self.config.check_engine.enabled {
            self.check_configs.send(machine).await?;
        }
        Ok(())
    }

    fn on_new_runtime_configuration(self: &Arc<Self>, update: NewRuntimeConfigurationEvent) {
        let Some(desired) = update.new.machine_configuration.haproxy else {
            return;
        };
        if self.haproxy.is_none() {
            return;
        }

        self.window.mark(Instant::now());
        let agent = self.clone();
        self.commands.invoke_if_not_already_running(
            HAPROXY_SOFT_SYNC_COMMAND,
            |desired| async move {
                agent.soft_sync(&desired).await;
                Ok::<_, anyhow::Error>(())
            },
            desired,
        );
    }

    async fn soft_sync(&self, desired: &HAProxyConfiguration) {
        let Some(haproxy) = &self.haproxy else {
            return;
        };
        match haproxy.soft_sync(desired).await {
            Ok(update) if update.restart_required => {
                debug!("haproxy needs a reload, deferring to the next converge");
                self.window.mark(Instant::now());
            }
            Ok(update) => debug!(
                enabled = update.enabled.len(),
                disabled = update.disabled.len(),
                "haproxy backends synced"
            ),
            Err(e) => warn!(error = %e, "haproxy soft sync failed"),
        }
    }

    async fn converge_haproxy(self: Arc<Self>) -> anyhow::Result<()> {
        let Some(haproxy) = &self.haproxy else {
            return Ok(());
        };
        self.window.clear();
        let Some(desired) = self.current_haproxy() else {
            return Ok(());
        };

        match haproxy.converge(&desired).await {
            Ok(outcome) => {
                info!(
                    written = outcome.written,
                    reloaded = outcome.reloaded,
                    "haproxy converged"
                );
                Ok(())
            }
            Err(e) => {
                // retried once the window is quiet again
                self.window.mark(Instant::now());
                Err(e.into())
            }
        }
    }

    async fn on_service_state(self: &Arc<Self>, state: ServiceStateEvent, origin: Origin) {
        if !self.is_local(&state.endpoint) {
            return;
        }

        if let Err(e) = self.publisher.publish_state(&state).await {
            warn!(service = %state.service, endpoint = %state.endpoint, error = %e, "failed to publish check result");
        }

        let forward = origin == Origin::Loopback
            && self
                .config
                .bus
                .as_ref()
                .is_some_and(|bus| bus.publish_service_state);
        if let (true, Some(queue)) = (forward, &self.queue) {
            if let Err(e) = queue.publish(&OrbitEvent::service_state(state.clone())).await {
                debug!(error = %e, "service state not forwarded");
            }
        }

        let down_for = (Utc::now() - state.same_state_since)
            .to_std()
            .unwrap_or_default();
        if !state.is_up && down_for > RELAUNCH_AFTER && self.has_container(&state.service) {
            let name = relaunch_command(&state.service);
            let command = self.commands.invoke_if_not_already_running(
                name,
                Agent::relaunch,
                (self.clone(), state.service),
            );
            self.report(command);
        }
    }

    async fn relaunch((agent, service): (Arc<Agent>, String)) -> anyhow::Result<()> {
        tokio::time::sleep(jitter(agent.config.relaunch.jitter_secs)).await;
        warn!(%service, "service has been down too long, relaunching");

        match agent.containers.runtime().stop(&service, STOP_GRACE).await {
            Ok(()) | Err(RuntimeError::NoSuchContainer(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let event = OrbitEvent::deployment(DeploymentEvent {
            action: DeploymentAction::AutomaticRelaunch,
            service,
            user: "orbit-agent".into(),
            machine_address: agent.config.machine_address.clone(),
            ..Default::default()
        });
        agent.announce(event).await?;

        tokio::time::sleep(RELAUNCH_COOLDOWN).await;
        Ok(())
    }

    /// Publishes on the bus when connected, otherwise handles it locally
    async fn announce(&self, event: OrbitEvent) -> anyhow::Result<()> {
        if let Some(queue) = &self.queue {
            match queue.publish(&event).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "bus unavailable, handling event locally"),
            }
        }
        self.loopback.send(event).await?;
        Ok(())
    }

    async fn on_deployment((agent, deployment): (Arc<Agent>, DeploymentEvent)) -> anyhow::Result<()> {
        if !deployment.machine_address.is_empty()
            && deployment.machine_address != agent.config.machine_address
        {
            return Ok(());
        }

        let delay = jitter(deployment.jitter);
        info!(
            service = %deployment.service,
            action = ?deployment.action,
            user = %deployment.user,
            ?delay,
            "deployment requested"
        );
        tokio::time::sleep(delay).await;

        match deployment.action {
            DeploymentAction::Deploy | DeploymentAction::AutomaticRelaunch => {}
            DeploymentAction::Restart => {
                if !agent.has_container(&deployment.service) {
                    debug!(service = %deployment.service, "no container to restart here");
                    return Ok(());
                }
                match agent
                    .containers
                    .runtime()
                    .stop(&deployment.service, STOP_GRACE)
                    .await
                {
                    Ok(()) | Err(RuntimeError::NoSuchContainer(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            DeploymentAction::Unknown => {
                warn!(service = %deployment.service, "unknown deployment action");
                return Ok(());
            }
        }

        match agent.schedule_poll() {
            Some(poll) => poll.wait().await,
            None => Ok(()),
        }
    }
}
