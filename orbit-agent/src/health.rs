//! Check engine: one worker per service, probing on its own cadence

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use orbit_core::event::{OrbitEvent, ServiceStateEvent};
use orbit_core::model::{
    BasicAuth, CheckKind, DEFAULT_CHECK_DELAY, EndpointInfo, MachineConfiguration, ServiceCheck,
    ServiceConfiguration,
};

pub const RESULTS_CAPACITY: usize = 100;
pub const CONFIGS_CAPACITY: usize = 1;

/// Settings shared by every worker
#[derive(Clone, Debug)]
struct WorkerContext {
    machine_address: String,
    availability_zone: String,
    publish_down_events: bool,
}

pub struct CheckEngine {
    context: Arc<WorkerContext>,
}

impl CheckEngine {
    pub fn new(machine_address: impl Into<String>, availability_zone: impl Into<String>) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                machine_address: machine_address.into(),
                availability_zone: availability_zone.into(),
                publish_down_events: false,
            }),
        }
    }

    /// Also emit results when a service is down
    pub fn publish_down_events(mut self, enabled: bool) -> Self {
        Arc::make_mut(&mut self.context).publish_down_events = enabled;
        self
    }

    /// Runs until `configs` closes. Dropping a worker's sender is what
    /// stops it, so closing `configs` stops every worker.
    pub async fn run(
        self,
        mut configs: mpsc::Receiver<MachineConfiguration>,
        results: mpsc::Sender<OrbitEvent>,
    ) {
        let mut workers: BTreeMap<String, watch::Sender<ServiceConfiguration>> = BTreeMap::new();

        while let Some(machine) = configs.recv().await {
            let mut desired = BTreeMap::new();
            for (name, bound) in &machine.services {
                match bound.get_config() {
                    Ok(config) => {
                        desired.insert(name.clone(), config);
                    }
                    Err(e) => warn!(service = %name, error = %e, "invalid service overrides"),
                }
            }

            workers.retain(|name, _| {
                let keep = desired.contains_key(name);
                if !keep {
                    info!(service = %name, "stopping check worker");
                }
                keep
            });

            for (name, config) in desired {
                match workers.get(&name) {
                    Some(tx) => {
                        tx.send_replace(config);
                    }
                    None => {
                        info!(service = %name, "starting check worker");
                        let (tx, rx) = watch::channel(config);
                        tokio::spawn(worker(self.context.clone(), rx, results.clone()));
                        workers.insert(name, tx);
                    }
                }
            }
        }

        debug!("configuration channel closed, check engine exiting");
    }
}

async fn worker(
    context: Arc<WorkerContext>,
    mut updates: watch::Receiver<ServiceConfiguration>,
    results: mpsc::Sender<OrbitEvent>,
) {
    let mut config = updates.borrow_and_update().clone();
    let mut delay = DEFAULT_CHECK_DELAY;
    let mut last_up: Option<bool> = None;
    let mut since = Utc::now();
    let mut prober = Prober::default();

    loop {
        match updates.has_changed() {
            Ok(true) => config = updates.borrow_and_update().clone(),
            Ok(false) => {}
            Err(_) => return,
        }

        // every check runs so each one's timeout is exercised
        let mut is_up = true;
        for check in &config.checks {
            if !prober.run(&config.name, check).await {
                is_up = false;
            }
        }

        // the first positive delay sticks, even across updates
        if let Some(d) = config.checks.iter().find_map(ServiceCheck::delay) {
            delay = d;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                changed = updates.changed() => match changed {
                    Ok(()) => config = updates.borrow_and_update().clone(),
                    Err(_) => return,
                },
            }
        }

        let state_changed = last_up != Some(is_up);
        if state_changed {
            since = Utc::now();
            last_up = Some(is_up);
        }

        if !is_up && !context.publish_down_events {
            continue;
        }

        let event = OrbitEvent::service_state(ServiceStateEvent {
            service: config.name.clone(),
            endpoint: format!("{}:{}", context.machine_address, config.endpoint_port),
            is_up,
            state_changed,
            same_state_since: since,
            endpoint_info: EndpointInfo {
                revision: config.effective_revision(),
                availability_zone: context.availability_zone.clone(),
            },
        });
        if results.send(event).await.is_err() {
            return;
        }
    }
}

/// Runs probes, keeping one HTTP client per timeout pair so connection
/// pools survive between rounds
#[derive(Default)]
pub struct Prober {
    clients: BTreeMap<(Duration, Duration), reqwest::Client>,
}

impl Prober {
    fn client(
        &mut self,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<reqwest::Client, String> {
        let key = (connect_timeout, response_timeout);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout + response_timeout)
            .no_proxy()
            .build()
            .map_err(|e| e.to_string())?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Runs one probe; failures are logged at debug level
    pub async fn run(&mut self, service: &str, check: &ServiceCheck) -> bool {
        let outcome = match &check.kind {
            CheckKind::Dummy { dummy_result } => {
                if *dummy_result {
                    Ok(())
                } else {
                    Err("dummy check configured to fail".to_string())
                }
            }
            CheckKind::Http {
                url,
                http_host,
                basic_auth,
                expect_http_status,
                expect_string,
            } => match self.client(check.connect_timeout(), check.response_timeout()) {
                Ok(client) => {
                    check_http(
                        &client,
                        url,
                        http_host.as_deref(),
                        basic_auth.as_ref(),
                        expect_http_status,
                        expect_string.as_deref(),
                    )
                    .await
                }
                Err(e) => Err(e),
            },
            CheckKind::Tcp { host_port } => check_tcp(host_port, check.connect_timeout()).await,
        };

        match outcome {
            Ok(()) => true,
            Err(reason) => {
                debug!(service, check = check.type_name(), %reason, "check failed");
                false
            }
        }
    }
}

async fn check_http(
    client: &reqwest::Client,
    url: &str,
    http_host: Option<&str>,
    basic_auth: Option<&BasicAuth>,
    expect_http_status: &str,
    expect_string: Option<&str>,
) -> Result<(), String> {
    let mut request = client.get(url);
    if let Some(host) = http_host {
        request = request.header(reqwest::header::HOST, host);
    }
    if let Some(auth) = basic_auth {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }

    let response = request.send().await.map_err(|e| e.to_string())?;

    let expected = if expect_http_status.is_empty() {
        "200"
    } else {
        expect_http_status
    };
    let status = response.status().as_u16().to_string();
    if !status.starts_with(expected) {
        return Err(format!("status {} does not match {}", status, expected));
    }

    if let Some(needle) = expect_string {
        let body = response.text().await.map_err(|e| e.to_string())?;
        if !body.contains(needle) {
            return Err(format!("body does not contain {:?}", needle));
        }
    }
    Ok(())
}

async fn check_tcp(host_port: &str, connect_timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(host_port)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connection timeout".into()),
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use orbit_core::event::EventPayload;
    use orbit_core::model::BoundService;

    use super::*;

    fn machine(services: &[(&str, Vec<ServiceCheck>)]) -> MachineConfiguration {
        let mut machine = MachineConfiguration::default();
        for (name, checks) in services {
            machine.services.insert(
                name.to_string(),
                BoundService::new(ServiceConfiguration {
                    name: name.to_string(),
                    checks: checks.clone(),
                    ..Default::default()
                }),
            );
        }
        machine
    }

    fn state(event: OrbitEvent) -> ServiceStateEvent {
        match event.payload {
            EventPayload::ServiceState(state) => state,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dummy_up_is_published() {
        let (config_tx, config_rx) = mpsc::channel(CONFIGS_CAPACITY);
        let (result_tx, mut result_rx) = mpsc::channel(RESULTS_CAPACITY);
        tokio::spawn(CheckEngine::new("10.0.0.1", "").run(config_rx, result_tx));

        config_tx
            .send(machine(&[("svc", vec![ServiceCheck::dummy(true)])]))
            .await
            .unwrap();

        let first = state(result_rx.recv().await.unwrap());
        assert_eq!(first.service, "svc");
        assert_eq!(first.endpoint, "10.0.0.1:0");
        assert!(first.is_up);
        assert!(first.state_changed);

        let second = state(result_rx.recv().await.unwrap());
        assert!(!second.state_changed);
        assert_eq!(second.same_state_since, first.same_state_since);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_service_stops_publishing() {
        let (config_tx, config_rx) = mpsc::channel(CONFIGS_CAPACITY);
        let (result_tx, mut result_rx) = mpsc::channel(RESULTS_CAPACITY);
        let engine = tokio::spawn(CheckEngine::new("10.0.0.1", "").run(config_rx, result_tx));

        config_tx
            .send(machine(&[("svc", vec![ServiceCheck::dummy(true)])]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        config_tx.send(machine(&[])).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(config_tx);
        engine.await.unwrap();

        // every sender is gone and nothing was ever published
        assert!(result_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_is_silent_unless_enabled() {
        let (config_tx, config_rx) = mpsc::channel(CONFIGS_CAPACITY);
        let (result_tx, mut result_rx) = mpsc::channel(RESULTS_CAPACITY);
        tokio::spawn(CheckEngine::new("10.0.0.1", "az1").run(config_rx, result_tx));
        config_tx
            .send(machine(&[("svc", vec![ServiceCheck::dummy(false)])]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(result_rx.try_recv().is_err());

        let (config_tx, config_rx) = mpsc::channel(CONFIGS_CAPACITY);
        let (result_tx, mut result_rx) = mpsc::channel(RESULTS_CAPACITY);
        tokio::spawn(
            CheckEngine::new("10.0.0.1", "az1")
                .publish_down_events(true)
                .run(config_rx, result_tx),
        );
        config_tx
            .send(machine(&[(
                "svc",
                vec![ServiceCheck::dummy(true), ServiceCheck::dummy(false)],
            )]))
            .await
            .unwrap();
        let down = state(result_rx.recv().await.unwrap());
        assert!(!down.is_up);
        assert_eq!(down.endpoint_info.availability_zone, "az1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_positive_delay_sets_cadence() {
        let (config_tx, config_rx) = mpsc::channel(CONFIGS_CAPACITY);
        let (result_tx, mut result_rx) = mpsc::channel(RESULTS_CAPACITY);
        tokio::spawn(CheckEngine::new("10.0.0.1", "").run(config_rx, result_tx));

        let mut slow = ServiceCheck::dummy(true);
        slow.delay_ms = 5000;
        let mut fast = ServiceCheck::dummy(true);
        fast.delay_ms = 10;
        config_tx
            .send(machine(&[("svc", vec![ServiceCheck::dummy(true), slow, fast])]))
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        result_rx.recv().await.unwrap();
        result_rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(11), "{:?}", elapsed);
    }

    async fn serve_check_endpoint() -> String {
        let app = Router::new().route("/check", get(|| async { "OK\n" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{}", addr)
    }

    fn http_check(url: String, status: &str, body: Option<&str>) -> ServiceCheck {
        let mut check = ServiceCheck::http(url);
        if let CheckKind::Http {
            expect_http_status,
            expect_string,
            ..
        } = &mut check.kind
        {
            *expect_http_status = status.to_string();
            *expect_string = body.map(str::to_string);
        }
        check.connect_timeout_ms = 1000;
        check.response_timeout_ms = 1000;
        check
    }

    #[tokio::test]
    async fn test_http_status_and_body() {
        let base = serve_check_endpoint().await;
        let mut prober = Prober::default();

        let ok = http_check(format!("{}/check", base), "", None);
        assert!(prober.run("svc", &ok).await);

        let missing = http_check(format!("{}/notFound", base), "", None);
        assert!(!prober.run("svc", &missing).await);

        let expect_404 = http_check(format!("{}/notFound", base), "404", None);
        assert!(prober.run("svc", &expect_404).await);

        let prefix = http_check(format!("{}/check", base), "2", Some("OK"));
        assert!(prober.run("svc", &prefix).await);

        let wrong_body = http_check(format!("{}/check", base), "", Some("FAIL"));
        assert!(!prober.run("svc", &wrong_body).await);
    }

    #[tokio::test]
    async fn test_tcp_open_and_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut prober = Prober::default();
        let mut check = ServiceCheck::tcp(addr.to_string());
        check.connect_timeout_ms = 1000;
        assert!(prober.run("svc", &check).await);

        drop(listener);
        assert!(!prober.run("svc", &check).await);
    }

    #[tokio::test]
    async fn test_http_client_is_reused_per_timeouts() {
        let base = serve_check_endpoint().await;
        let mut prober = Prober::default();

        let check = http_check(format!("{}/check", base), "", None);
        assert!(prober.run("svc", &check).await);
        assert!(prober.run("svc", &check).await);
        assert_eq!(prober.clients.len(), 1);

        let mut slower = check.clone();
        slower.response_timeout_ms = 2000;
        assert!(prober.run("svc", &slower).await);
        assert_eq!(prober.clients.len(), 2);
    }
}
