mod adapters;
mod agent;
mod containers;
mod dispatcher;
mod event_log;
mod haproxy;
mod health;
mod keepalive;
mod poller;
mod publisher;
mod queue;
mod verify;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use orbit_core::bus::Broker;
use orbit_core::config::{AgentConfig, BusConfig, RuntimeKind};
use orbit_core::kvs::{KeyValueStore, Keyspace};
use orbit_core::runtime::ContainerRuntime;

use adapters::{EtcdStore, FakeRuntime};
use agent::Agent;
use dispatcher::Dispatcher;
use health::{CheckEngine, RESULTS_CAPACITY};
use queue::QueueClient;

#[derive(Parser)]
#[command(name = "orbit-agent")]
#[command(about = "Keep this machine's containers and load balancer converged", long_about = None)]
struct Cli {
    /// Agent configuration file; searched for when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (the default)
    Daemon,
    /// Check that the keyspace for this machine's tags is complete
    Verify,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<(PathBuf, AgentConfig)> {
    match path {
        Some(path) => {
            let config = AgentConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            Ok((path.to_path_buf(), config))
        }
        None => Ok(AgentConfig::discover(&std::env::current_dir()?)?),
    }
}

async fn connect_runtime(kind: RuntimeKind) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    match kind {
        RuntimeKind::Fake => Ok(Arc::new(FakeRuntime::new().with_open_registry())),
        #[cfg(feature = "docker")]
        RuntimeKind::Docker => Ok(Arc::new(adapters::DockerRuntime::connect().await?)),
        #[cfg(not(feature = "docker"))]
        RuntimeKind::Docker => anyhow::bail!("runtime `docker` needs the `docker` feature"),
    }
}

#[cfg(feature = "amqp")]
fn connect_broker(bus: &BusConfig) -> anyhow::Result<Arc<dyn Broker>> {
    Ok(Arc::new(adapters::AmqpBroker::new(bus.url.clone())))
}

#[cfg(not(feature = "amqp"))]
fn connect_broker(_bus: &BusConfig) -> anyhow::Result<Arc<dyn Broker>> {
    anyhow::bail!("a message bus is configured but the `amqp` feature is disabled")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_verify(kvs: Arc<dyn KeyValueStore>, config: &AgentConfig) -> anyhow::Result<()> {
    let keyspace = Keyspace::new(&config.kvs.base_path);
    match verify::verify(kvs.as_ref(), &keyspace, &config.tags).await {
        Ok(report) => {
            println!(
                "ok: {} services, {} tags, {} haproxy endpoints",
                report.services, report.tags, report.haproxy_endpoints
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_daemon(kvs: Arc<dyn KeyValueStore>, config: AgentConfig) -> anyhow::Result<()> {
    let runtime = connect_runtime(config.runtime).await?;
    info!(
        machine = %config.machine_address,
        tags = ?config.tags,
        runtime = runtime.name(),
        "starting orbit agent"
    );

    let (agent, channels) = Agent::new(config.clone(), kvs, runtime);
    let (network_tx, network_rx) = mpsc::channel(RESULTS_CAPACITY);
    let agent = match &config.bus {
        Some(bus) => {
            let queue = Arc::new(QueueClient::new(connect_broker(bus)?, bus.topology()));
            tokio::spawn(queue.clone().run(network_tx));
            agent.with_queue(queue)
        }
        None => agent,
    };
    let agent = Arc::new(agent);

    if config.check_engine.enabled {
        let engine = CheckEngine::new(&config.machine_address, &config.availability_zone)
            .publish_down_events(config.check_engine.publish_down_events);
        tokio::spawn(engine.run(channels.check_configs, agent.loopback()));
    }

    let keepalive = agent.keepalive();
    let port = config.keepalive.port;
    tokio::spawn(async move {
        if let Err(e) = keepalive::serve(keepalive, port).await {
            error!(error = %e, "keepalive endpoint stopped");
        }
    });

    Dispatcher::new(agent, network_rx, channels.loopback)
        .run(shutdown_signal())
        .await;
    info!("orbit agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let (path, config) = load_config(cli.config.as_deref())?;
    info!(path = %path.display(), "loaded configuration");
    let kvs: Arc<dyn KeyValueStore> = Arc::new(EtcdStore::new(&config.kvs.endpoint)?);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => run_daemon(kvs, config).await,
        Commands::Verify => run_verify(kvs, &config).await,
    }
}
