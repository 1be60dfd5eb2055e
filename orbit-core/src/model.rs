//! Desired-state model shared by the poller, reconcilers and check engine.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deep_eq::DeepEq;
use crate::{deep_eq_struct, deep_eq_via_partial_eq};

pub type ServiceName = String;

/// `address -> info` for every live endpoint of one service
pub type BackendServers = BTreeMap<String, EndpointInfo>;

pub const DEFAULT_CHECK_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_TCP_CONNECT_TIMEOUT: Duration = Duration::from_millis(50);

/// One logical service, stored at `/services/<name>/config`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub name: ServiceName,

    #[serde(default)]
    pub endpoint_port: u16,

    #[serde(default)]
    pub checks: Vec<ServiceCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerConfiguration>,

    /// Deployed revision; replaces the image tag when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_control: Option<SourceControl>,
}

impl ServiceConfiguration {
    /// Image reference with the revision applied
    pub fn effective_image(&self) -> Option<String> {
        self.container.as_ref().map(|c| {
            apply_revision(&c.image, self.revision.as_ref().map(|r| r.revision.as_str()))
        })
    }

    /// Revision reported for this service's endpoints
    pub fn effective_revision(&self) -> String {
        match (&self.revision, &self.container) {
            (Some(rev), _) => rev.revision.clone(),
            (None, Some(container)) => image_tag(&container.image).to_string(),
            (None, None) => String::new(),
        }
    }
}

/// Stored at `/services/<name>/revision`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    #[serde(rename = "Revision")]
    pub revision: String,
    #[serde(rename = "DeploymentTime", default, skip_serializing_if = "Option::is_none")]
    pub deployment_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceControl {
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_url: Option<String>,
}

/// A single health probe with its timing knobs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceCheck {
    #[serde(flatten)]
    pub kind: CheckKind,

    #[serde(default)]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub response_timeout_ms: u64,

    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    /// Fixed result, used as a fixture
    Dummy {
        #[serde(default)]
        dummy_result: bool,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        http_host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        basic_auth: Option<BasicAuth>,
        /// Status code prefix; empty means "200"
        #[serde(default)]
        expect_http_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_string: Option<String>,
    },
    Tcp {
        host_port: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ServiceCheck {
    pub fn dummy(result: bool) -> Self {
        Self::from_kind(CheckKind::Dummy {
            dummy_result: result,
        })
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self::from_kind(CheckKind::Http {
            url: url.into(),
            http_host: None,
            basic_auth: None,
            expect_http_status: String::new(),
            expect_string: None,
        })
    }

    pub fn tcp(host_port: impl Into<String>) -> Self {
        Self::from_kind(CheckKind::Tcp {
            host_port: host_port.into(),
        })
    }

    fn from_kind(kind: CheckKind) -> Self {
        Self {
            kind,
            connect_timeout_ms: 0,
            response_timeout_ms: 0,
            delay_ms: 0,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            CheckKind::Dummy { .. } => "dummy",
            CheckKind::Http { .. } => "http",
            CheckKind::Tcp { .. } => "tcp",
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        match (self.connect_timeout_ms, &self.kind) {
            (0, CheckKind::Tcp { .. }) => DEFAULT_TCP_CONNECT_TIMEOUT,
            (0, _) => DEFAULT_HTTP_TIMEOUT,
            (ms, _) => Duration::from_millis(ms),
        }
    }

    /// Read/write deadline; TCP checks reuse the connect timeout
    pub fn response_timeout(&self) -> Duration {
        match (self.response_timeout_ms, &self.kind) {
            (0, CheckKind::Tcp { .. }) => self.connect_timeout(),
            (0, _) => DEFAULT_HTTP_TIMEOUT,
            (ms, _) => Duration::from_millis(ms),
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        (self.delay_ms > 0).then(|| Duration::from_millis(self.delay_ms))
    }
}

/// Container spec; fields other than the ones below pass through untouched
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfiguration {
    /// `registry/name:tag`
    pub image: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default)]
    pub host_config: HostConfig,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_mode: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Splits `registry:5000/name:tag` into (`registry:5000/name`, `tag`).
/// The tag is empty when the reference carries none.
fn split_image(image: &str) -> (&str, &str) {
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(i) => (&image[..last_slash + i], &image[last_slash + i + 1..]),
        None => (image, ""),
    }
}

/// Image reference without its tag
pub fn image_repository(image: &str) -> &str {
    split_image(image).0
}

/// Image tag; `latest` when absent
pub fn image_tag(image: &str) -> &str {
    match split_image(image).1 {
        "" => "latest",
        tag => tag,
    }
}

/// `repository:(revision ?? tag)`
pub fn apply_revision(image: &str, revision: Option<&str>) -> String {
    let tag = match revision {
        Some(rev) if !rev.is_empty() => rev,
        _ => image_tag(image),
    };
    format!("{}:{}", image_repository(image), tag)
}

/// A service as bound to a tag, with that tag's overrides
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundService {
    pub config: ServiceConfiguration,

    /// JSON object merged over `config`
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub overrides: Value,
}

impl BoundService {
    pub fn new(config: ServiceConfiguration) -> Self {
        Self {
            config,
            overrides: Value::Null,
        }
    }

    /// The configuration with overrides applied. The name never changes.
    pub fn get_config(&self) -> Result<ServiceConfiguration, serde_json::Error> {
        let has_overrides = matches!(&self.overrides, Value::Object(map) if !map.is_empty());
        if !has_overrides {
            return Ok(self.config.clone());
        }

        let mut merged = serde_json::to_value(&self.config)?;
        merge_json(&mut merged, &self.overrides);
        let mut config: ServiceConfiguration = serde_json::from_value(merged)?;
        config.name = self.config.name.clone();
        Ok(config)
    }
}

/// Recursive object merge; non-object values in `patch` replace `base`.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Desired state for one machine: the merge of all its tags
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfiguration {
    #[serde(default)]
    pub services: BTreeMap<ServiceName, BoundService>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<HAProxyConfiguration>,

    /// Image repositories this agent may stop
    #[serde(default)]
    pub authoritative_names: Vec<String>,
}

impl MachineConfiguration {
    /// Folds a later tag over this one; the later tag wins on conflicts.
    pub fn merge(&mut self, later: MachineConfiguration) {
        self.services.extend(later.services);

        for name in later.authoritative_names {
            if !self.authoritative_names.contains(&name) {
                self.authoritative_names.push(name);
            }
        }

        match (&mut self.haproxy, later.haproxy) {
            (_, None) => {}
            (None, Some(haproxy)) => self.haproxy = Some(haproxy),
            (Some(current), Some(haproxy)) => {
                if !haproxy.global_section.is_empty() {
                    current.global_section = haproxy.global_section;
                }
                current.endpoints.extend(haproxy.endpoints);
            }
        }
    }

    pub fn is_authoritative(&self, image: &str) -> bool {
        let repository = image_repository(image);
        self.authoritative_names.iter().any(|name| name == repository)
    }

    /// Checks that every map key matches the `name` it stores.
    pub fn validate(&self) -> Result<(), IntegrityError> {
        for (key, bound) in &self.services {
            if &bound.config.name != key {
                return Err(IntegrityError::ServiceName {
                    key: key.clone(),
                    name: bound.config.name.clone(),
                });
            }
        }
        if let Some(haproxy) = &self.haproxy {
            haproxy.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("service stored under `{key}` is named `{name}`")]
    ServiceName { key: String, name: String },
    #[error("haproxy endpoint stored under `{key}` is named `{name}`")]
    EndpointName { key: String, name: String },
}

/// Load-balancer desired state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HAProxyConfiguration {
    /// Copied verbatim to the top of the rendered file
    #[serde(default)]
    pub global_section: String,

    #[serde(default)]
    pub endpoints: BTreeMap<ServiceName, HAProxyEndpoint>,
}

impl HAProxyConfiguration {
    pub fn validate(&self) -> Result<(), IntegrityError> {
        for (key, endpoint) in &self.endpoints {
            if &endpoint.name != key {
                return Err(IntegrityError::EndpointName {
                    key: key.clone(),
                    name: endpoint.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// The stanza kind of an endpoint. Only these two shapes are valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointSection {
    Listen { address: String, config: String },
    Backend { config: String },
}

impl EndpointSection {
    pub fn config(&self) -> &str {
        match self {
            EndpointSection::Listen { config, .. } | EndpointSection::Backend { config } => config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointShapeError {
    #[error("endpoint `{0}` must set either listen + listen_address or backend")]
    Neither(String),
    #[error("endpoint `{0}` sets both a listen and a backend section")]
    Both(String),
    #[error("backend endpoint `{0}` must not set listen_address")]
    BackendWithAddress(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEndpoint", into = "RawEndpoint")]
pub struct HAProxyEndpoint {
    pub name: ServiceName,
    pub section: EndpointSection,
    /// Appended to every `server` line
    pub per_server: String,
    /// Live backends, filled in from `/services/<name>/endpoints`
    pub backend_servers: BackendServers,
}

impl HAProxyEndpoint {
    pub fn listen(
        name: impl Into<String>,
        address: impl Into<String>,
        config: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            section: EndpointSection::Listen {
                address: address.into(),
                config: config.into(),
            },
            per_server: String::new(),
            backend_servers: BackendServers::new(),
        }
    }

    pub fn backend(name: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            section: EndpointSection::Backend {
                config: config.into(),
            },
            per_server: String::new(),
            backend_servers: BackendServers::new(),
        }
    }

    pub fn with_per_server(mut self, per_server: impl Into<String>) -> Self {
        self.per_server = per_server.into();
        self
    }

    /// Server name as it appears in the LB: `NAME-ADDRESS`
    pub fn server_name(&self, address: &str) -> String {
        format!("{}-{}", self.name, address)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RawEndpoint {
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    listen: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    listen_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    backend: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    per_server: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    backend_servers: BackendServers,
}

impl TryFrom<RawEndpoint> for HAProxyEndpoint {
    type Error = EndpointShapeError;

    fn try_from(raw: RawEndpoint) -> Result<Self, Self::Error> {
        let section = match (
            raw.listen.is_empty(),
            raw.listen_address.is_empty(),
            raw.backend.is_empty(),
        ) {
            (false, false, true) => EndpointSection::Listen {
                address: raw.listen_address,
                config: raw.listen,
            },
            (true, true, false) => EndpointSection::Backend {
                config: raw.backend,
            },
            (true, false, false) => return Err(EndpointShapeError::BackendWithAddress(raw.name)),
            (false, _, false) => return Err(EndpointShapeError::Both(raw.name)),
            _ => return Err(EndpointShapeError::Neither(raw.name)),
        };

        Ok(Self {
            name: raw.name,
            section,
            per_server: raw.per_server,
            backend_servers: raw.backend_servers,
        })
    }
}

impl From<HAProxyEndpoint> for RawEndpoint {
    fn from(endpoint: HAProxyEndpoint) -> Self {
        let mut raw = RawEndpoint {
            name: endpoint.name,
            per_server: endpoint.per_server,
            backend_servers: endpoint.backend_servers,
            ..Default::default()
        };
        match endpoint.section {
            EndpointSection::Listen { address, config } => {
                raw.listen = config;
                raw.listen_address = address;
            }
            EndpointSection::Backend { config } => raw.backend = config,
        }
        raw
    }
}

/// Metadata stored with each live endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
}

/// Everything the poller learned in one cycle
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfiguration {
    pub machine_configuration: MachineConfiguration,

    /// `service -> address -> info` for every service in the cluster
    #[serde(default)]
    pub service_backends: BTreeMap<ServiceName, BackendServers>,

    /// The part of `service_backends` this machine's LB routes to
    #[serde(default)]
    pub locally_required_services: BTreeMap<ServiceName, BackendServers>,
}

deep_eq_via_partial_eq!(
    Revision,
    SourceControl,
    ServiceCheck,
    EndpointSection,
    EndpointInfo,
);

deep_eq_struct!(ServiceConfiguration {
    name,
    endpoint_port,
    checks,
    container,
    revision,
    source_control,
});
deep_eq_struct!(ContainerConfiguration { image, hostname, env, host_config, extra });
deep_eq_struct!(HostConfig { binds, network_mode, dns, extra });
deep_eq_struct!(BoundService { config, overrides });
deep_eq_struct!(MachineConfiguration { services, haproxy, authoritative_names });
deep_eq_struct!(HAProxyConfiguration { global_section, endpoints });
deep_eq_struct!(HAProxyEndpoint { name, section, per_server } skip { backend_servers });
deep_eq_struct!(
    RuntimeConfiguration { machine_configuration }
    skip { service_backends, locally_required_services }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_replaces_tag() {
        assert_eq!(apply_revision("repo/app:1.0", Some("2.0")), "repo/app:2.0");
        assert_eq!(apply_revision("repo/app:1.0", None), "repo/app:1.0");
        assert_eq!(apply_revision("repo/app", None), "repo/app:latest");
        assert_eq!(apply_revision("repo/app", Some("")), "repo/app:latest");
        assert_eq!(
            apply_revision("registry:5000/app:1.0", Some("abc")),
            "registry:5000/app:abc"
        );
        assert_eq!(image_repository("registry:5000/app"), "registry:5000/app");
    }

    #[test]
    fn test_parse_service_configuration() {
        let json = r#"{
            "name": "web",
            "endpoint_port": 8080,
            "checks": [
                {"type": "http", "url": "http://localhost:8080/check", "expect_http_status": "2"},
                {"type": "tcp", "host_port": "localhost:8080", "delay_ms": 500},
                {"type": "dummy", "dummy_result": true}
            ],
            "container": {
                "Image": "registry/web:1",
                "Env": ["A=1"],
                "Cmd": ["serve"],
                "HostConfig": {"NetworkMode": "host", "Privileged": true}
            }
        }"#;
        let config: ServiceConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.endpoint_port, 8080);
        assert_eq!(config.checks.len(), 3);
        assert_eq!(config.checks[0].type_name(), "http");
        assert_eq!(config.checks[0].connect_timeout(), DEFAULT_HTTP_TIMEOUT);
        assert_eq!(config.checks[1].connect_timeout(), DEFAULT_TCP_CONNECT_TIMEOUT);
        assert_eq!(config.checks[1].delay(), Some(Duration::from_millis(500)));
        assert_eq!(config.checks[2], ServiceCheck::dummy(true));

        let container = config.container.as_ref().unwrap();
        assert_eq!(container.host_config.network_mode, "host");
        assert_eq!(container.extra["Cmd"], serde_json::json!(["serve"]));
        assert_eq!(container.host_config.extra["Privileged"], Value::Bool(true));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["container"]["Cmd"], serde_json::json!(["serve"]));
    }

    #[test]
    fn test_overrides_keep_name() {
        let mut config = ServiceConfiguration {
            name: "web".into(),
            endpoint_port: 80,
            ..Default::default()
        };
        config.container = Some(ContainerConfiguration {
            image: "web:1".into(),
            ..Default::default()
        });
        let bound = BoundService {
            config,
            overrides: serde_json::json!({
                "name": "evil",
                "endpoint_port": 81,
                "container": {"Hostname": "edge"}
            }),
        };

        let effective = bound.get_config().unwrap();
        assert_eq!(effective.name, "web");
        assert_eq!(effective.endpoint_port, 81);
        let container = effective.container.unwrap();
        assert_eq!(container.image, "web:1");
        assert_eq!(container.hostname, "edge");
    }

    #[test]
    fn test_empty_overrides_are_identity() {
        let bound = BoundService {
            config: ServiceConfiguration {
                name: "web".into(),
                ..Default::default()
            },
            overrides: serde_json::json!({}),
        };
        assert_eq!(bound.get_config().unwrap(), bound.config);
    }

    #[test]
    fn test_endpoint_shapes() {
        let listen: HAProxyEndpoint = serde_json::from_str(
            r#"{"name": "web", "listen": "mode http", "listen_address": "0.0.0.0:80"}"#,
        )
        .unwrap();
        assert_eq!(
            listen.section,
            EndpointSection::Listen {
                address: "0.0.0.0:80".into(),
                config: "mode http".into()
            }
        );

        let backend: HAProxyEndpoint =
            serde_json::from_str(r#"{"name": "web", "backend": "balance roundrobin"}"#).unwrap();
        assert!(matches!(backend.section, EndpointSection::Backend { .. }));

        for bad in [
            r#"{"name": "web"}"#,
            r#"{"name": "web", "listen": "mode http"}"#,
            r#"{"name": "web", "backend": "b", "listen_address": "0.0.0.0:80"}"#,
            r#"{"name": "web", "backend": "b", "listen": "l", "listen_address": "0.0.0.0:80"}"#,
        ] {
            assert!(serde_json::from_str::<HAProxyEndpoint>(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_merge_later_tag_wins() {
        let mut base = MachineConfiguration {
            authoritative_names: vec!["repo/a".into()],
            haproxy: Some(HAProxyConfiguration {
                global_section: "global\n".into(),
                endpoints: BTreeMap::from([(
                    "a".to_string(),
                    HAProxyEndpoint::backend("a", "balance first"),
                )]),
            }),
            ..Default::default()
        };
        base.services.insert(
            "a".into(),
            BoundService::new(ServiceConfiguration {
                name: "a".into(),
                endpoint_port: 1,
                ..Default::default()
            }),
        );

        let mut later = MachineConfiguration {
            authoritative_names: vec!["repo/b".into(), "repo/a".into()],
            haproxy: Some(HAProxyConfiguration {
                global_section: String::new(),
                endpoints: BTreeMap::from([(
                    "a".to_string(),
                    HAProxyEndpoint::backend("a", "balance roundrobin"),
                )]),
            }),
            ..Default::default()
        };
        later.services.insert(
            "a".into(),
            BoundService::new(ServiceConfiguration {
                name: "a".into(),
                endpoint_port: 2,
                ..Default::default()
            }),
        );

        base.merge(later);
        assert_eq!(base.authoritative_names, vec!["repo/a", "repo/b"]);
        assert_eq!(base.services["a"].config.endpoint_port, 2);
        let haproxy = base.haproxy.unwrap();
        assert_eq!(haproxy.global_section, "global\n");
        assert_eq!(haproxy.endpoints["a"].section.config(), "balance roundrobin");
    }

    #[test]
    fn test_integrity_mismatch() {
        let mut machine = MachineConfiguration::default();
        machine.services.insert(
            "a".into(),
            BoundService::new(ServiceConfiguration {
                name: "b".into(),
                ..Default::default()
            }),
        );
        assert!(matches!(machine.validate(), Err(IntegrityError::ServiceName { .. })));
    }

    #[test]
    fn test_backend_servers_do_not_affect_deep_eq() {
        let mut endpoint = HAProxyEndpoint::listen("web", "0.0.0.0:80", "mode http");
        let before = RuntimeConfiguration {
            machine_configuration: MachineConfiguration {
                haproxy: Some(HAProxyConfiguration {
                    global_section: "global".into(),
                    endpoints: BTreeMap::from([("web".to_string(), endpoint.clone())]),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        endpoint
            .backend_servers
            .insert("10.0.0.1:80".into(), EndpointInfo::default());
        let mut after = before.clone();
        after.machine_configuration.haproxy = Some(HAProxyConfiguration {
            global_section: "global".into(),
            endpoints: BTreeMap::from([("web".to_string(), endpoint)]),
        });
        after
            .service_backends
            .insert("web".into(), BackendServers::new());

        assert!(before.deep_eq(&after));
        assert_ne!(before, after);

        after.machine_configuration.authoritative_names.push("x".into());
        assert!(!before.deep_eq(&after));
    }

    #[test]
    fn test_authoritative_scope_uses_repository() {
        let machine = MachineConfiguration {
            authoritative_names: vec!["registry/web".into()],
            ..Default::default()
        };
        assert!(machine.is_authoritative("registry/web:2"));
        assert!(machine.is_authoritative("registry/web"));
        assert!(!machine.is_authoritative("registry/db:2"));
    }
}
