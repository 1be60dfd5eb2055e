//! Config poller: assembles a [`RuntimeConfiguration`] from the KVS
//!
//! Keyspace, relative to the configured base path:
//!
//! ```text
//! /services/<name>/config                 ServiceConfiguration JSON
//! /services/<name>/revision               {"Revision": .., "DeploymentTime": ..}
//! /services/<name>/endpoints/<host:port>  EndpointInfo JSON, TTL 60s
//! /machineconfigurations/tags/<tag>/authoritative_names
//! /machineconfigurations/tags/<tag>/services/<name>            overrides
//! /machineconfigurations/tags/<tag>/haproxy_endpoints/<name>   HAProxyEndpoint
//! /machineconfigurations/tags/<tag>/haproxy_config             global section
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use orbit_core::deep_eq::DeepEq;
use orbit_core::kvs::{KeyValueStore, Keyspace, KvNode, KvsError};
use orbit_core::model::{
    BackendServers, BoundService, EndpointInfo, HAProxyConfiguration, HAProxyEndpoint,
    IntegrityError, MachineConfiguration, Revision, RuntimeConfiguration, ServiceConfiguration,
};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Kvs(#[from] KvsError),
    #[error("invalid content at {path}: {source}")]
    InvalidContent {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// How a freshly polled configuration relates to the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    /// Only fields ignored by deep equality moved, such as backend servers
    BackendsOnly,
    Changed,
}

pub fn classify(previous: Option<&RuntimeConfiguration>, new: &RuntimeConfiguration) -> Change {
    match previous {
        None => Change::Changed,
        Some(previous) if !previous.deep_eq(new) => Change::Changed,
        Some(previous) if previous != new => Change::BackendsOnly,
        Some(_) => Change::Unchanged,
    }
}

/// A tag directory under `/machineconfigurations/tags`
#[derive(Default)]
pub(crate) struct TagRecord {
    pub authoritative_names: Vec<String>,
    pub overrides: BTreeMap<String, Value>,
    pub endpoints: BTreeMap<String, HAProxyEndpoint>,
    pub global_section: Option<String>,
}

pub(crate) fn parse_json<T: DeserializeOwned>(node: &KvNode) -> Result<T, PollError> {
    let raw = node.value.as_deref().unwrap_or_default();
    serde_json::from_str(raw).map_err(|source| PollError::InvalidContent {
        path: node.key.clone(),
        source,
    })
}

/// Lists a directory, treating a missing key as empty
pub(crate) async fn get_tree(
    kvs: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<KvNode>, KvsError> {
    match kvs.get(key, true).await {
        Ok(node) => Ok(Some(node)),
        Err(e) if e.is_key_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// `None` when the directory has no `config` key
pub(crate) fn read_service(dir: &KvNode) -> Result<Option<ServiceConfiguration>, PollError> {
    let Some(config_node) = dir.child("config") else {
        return Ok(None);
    };
    let mut config: ServiceConfiguration = parse_json(config_node)?;
    if config.name != dir.name() {
        return Err(IntegrityError::ServiceName {
            key: dir.name().to_string(),
            name: config.name,
        }
        .into());
    }

    if let Some(revision) = dir.child("revision") {
        config.revision = Some(parse_json::<Revision>(revision)?);
    }

    Ok(Some(config))
}

/// Endpoint keys of a service directory; unreadable info falls back to the default
fn read_backends(dir: &KvNode) -> BackendServers {
    let mut backends = BackendServers::new();
    for endpoint in dir.child("endpoints").map(|e| e.nodes.as_slice()).unwrap_or_default() {
        let info = match endpoint.value.as_deref() {
            None | Some("") => EndpointInfo::default(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                debug!(key = %endpoint.key, error = %e, "unreadable endpoint info");
                EndpointInfo::default()
            }),
        };
        backends.insert(endpoint.name().to_string(), info);
    }
    backends
}

pub(crate) fn read_tag(dir: &KvNode) -> Result<TagRecord, PollError> {
    let mut tag = TagRecord::default();

    if let Some(names) = dir.child("authoritative_names") {
        tag.authoritative_names = parse_json(names)?;
    }

    for node in dir.child("services").map(|s| s.nodes.as_slice()).unwrap_or_default() {
        let overrides = match node.value.as_deref().map(str::trim) {
            None | Some("") => Value::Null,
            Some(_) => parse_json(node)?,
        };
        tag.overrides.insert(node.name().to_string(), overrides);
    }

    for node in dir
        .child("haproxy_endpoints")
        .map(|s| s.nodes.as_slice())
        .unwrap_or_default()
    {
        let endpoint: HAProxyEndpoint = parse_json(node)?;
        tag.endpoints.insert(node.name().to_string(), endpoint);
    }

    if let Some(global) = dir.child("haproxy_config") {
        tag.global_section = Some(global.value.clone().unwrap_or_default());
    }

    Ok(tag)
}

pub struct ConfigPoller {
    kvs: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    tags: Vec<String>,
}

impl ConfigPoller {
    pub fn new(kvs: Arc<dyn KeyValueStore>, keyspace: Keyspace, tags: Vec<String>) -> Self {
        Self {
            kvs,
            keyspace,
            tags,
        }
    }

    /// Only services referenced by one of this machine's tags must have a
    /// valid config; broken unrelated services are skipped with a warning.
    pub async fn fetch(&self) -> Result<RuntimeConfiguration, PollError> {
        let mut tags = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            match get_tree(self.kvs.as_ref(), &self.keyspace.tag(tag)).await? {
                Some(dir) => tags.push((tag, read_tag(&dir)?)),
                None => debug!(%tag, "tag has no configuration"),
            }
        }
        let referenced: BTreeSet<&str> = tags
            .iter()
            .flat_map(|(_, record)| record.overrides.keys().map(String::as_str))
            .collect();

        let mut services = BTreeMap::new();
        let mut service_backends = BTreeMap::new();
        if let Some(root) = get_tree(self.kvs.as_ref(), &self.keyspace.services()).await? {
            for dir in &root.nodes {
                if dir.child("config").is_some() {
                    service_backends.insert(dir.name().to_string(), read_backends(dir));
                }
                match read_service(dir) {
                    Ok(Some(config)) => {
                        services.insert(dir.name().to_string(), config);
                    }
                    Ok(None) => debug!(service = dir.name(), "service without config"),
                    Err(e) if referenced.contains(dir.name()) => return Err(e),
                    Err(e) => warn!(service = dir.name(), error = %e, "skipping unusable service"),
                }
            }
        }

        let mut machine = MachineConfiguration::default();
        for (tag, record) in tags {
            machine.merge(self.bind(tag, record, &services));
        }
        machine.validate()?;

        let mut locally_required_services = BTreeMap::new();
        if let Some(haproxy) = machine.haproxy.as_mut() {
            for endpoint in haproxy.endpoints.values_mut() {
                let backends = service_backends
                    .get(&endpoint.name)
                    .cloned()
                    .unwrap_or_default();
                locally_required_services.insert(endpoint.name.clone(), backends.clone());
                endpoint.backend_servers = backends;
            }
        }

        Ok(RuntimeConfiguration {
            machine_configuration: machine,
            service_backends,
            locally_required_services,
        })
    }

    fn bind(
        &self,
        tag: &str,
        record: TagRecord,
        services: &BTreeMap<String, ServiceConfiguration>,
    ) -> MachineConfiguration {
        let mut machine = MachineConfiguration {
            authoritative_names: record.authoritative_names,
            ..Default::default()
        };

        for (name, overrides) in record.overrides {
            match services.get(&name) {
                Some(config) => {
                    machine.services.insert(
                        name,
                        BoundService {
                            config: config.clone(),
                            overrides,
                        },
                    );
                }
                None => warn!(%tag, service = %name, "tag references unknown service"),
            }
        }

        if record.global_section.is_some() || !record.endpoints.is_empty() {
            machine.haproxy = Some(HAProxyConfiguration {
                global_section: record.global_section.unwrap_or_default(),
                endpoints: record.endpoints,
            });
        }
        machine
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use orbit_core::kvs::MemoryStore;

    /// One service `web` on tag `web`, with an LB endpoint and one backend
    pub fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert(
            "/orbit/services/web/config",
            r#"{"name": "web", "endpoint_port": 8080,
                "checks": [{"type": "dummy", "dummy_result": true}],
                "container": {"Image": "repo/web:1", "Env": ["A=1"]}}"#,
        );
        store.insert(
            "/orbit/services/web/revision",
            r#"{"Revision": "2", "DeploymentTime": "2024-01-01T00:00:00Z"}"#,
        );
        store.insert(
            "/orbit/services/web/endpoints/10.0.0.1:8080",
            r#"{"availability_zone": "az1"}"#,
        );
        store.insert(
            "/orbit/machineconfigurations/tags/web/authoritative_names",
            r#"["repo/web"]"#,
        );
        store.insert("/orbit/machineconfigurations/tags/web/services/web", "{}");
        store.insert(
            "/orbit/machineconfigurations/tags/web/haproxy_endpoints/web",
            r#"{"name": "web", "listen": "mode http", "listen_address": "0.0.0.0:80"}"#,
        );
        store.insert(
            "/orbit/machineconfigurations/tags/web/haproxy_config",
            "global\n\tdaemon",
        );
        store
    }
}

#[cfg(test)]
mod tests {
    use orbit_core::kvs::MemoryStore;

    use super::fixtures::seeded_store;
    use super::*;

    fn poller(store: Arc<MemoryStore>, tags: &[&str]) -> ConfigPoller {
        ConfigPoller::new(
            store,
            Keyspace::new("/orbit"),
            tags.iter().map(|t| t.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_fetch_assembles_runtime_configuration() {
        let store = Arc::new(seeded_store());
        let runtime = poller(store, &["web"]).fetch().await.unwrap();

        let machine = &runtime.machine_configuration;
        assert_eq!(machine.authoritative_names, vec!["repo/web"]);
        let web = machine.services["web"].get_config().unwrap();
        assert_eq!(web.effective_image().as_deref(), Some("repo/web:2"));

        let haproxy = machine.haproxy.as_ref().unwrap();
        assert_eq!(haproxy.global_section, "global\n\tdaemon");
        let endpoint = &haproxy.endpoints["web"];
        assert_eq!(
            endpoint.backend_servers["10.0.0.1:8080"].availability_zone,
            "az1"
        );
        assert_eq!(runtime.locally_required_services["web"].len(), 1);
        assert_eq!(runtime.service_backends["web"].len(), 1);
    }

    #[tokio::test]
    async fn test_later_tag_overrides_earlier() {
        let store = seeded_store();
        store.insert(
            "/orbit/machineconfigurations/tags/edge/services/web",
            r#"{"endpoint_port": 9090}"#,
        );
        store.insert(
            "/orbit/machineconfigurations/tags/edge/authoritative_names",
            r#"["repo/edge"]"#,
        );
        let runtime = poller(Arc::new(store), &["web", "edge"]).fetch().await.unwrap();

        let machine = runtime.machine_configuration;
        assert_eq!(machine.services["web"].get_config().unwrap().endpoint_port, 9090);
        assert_eq!(machine.authoritative_names, vec!["repo/web", "repo/edge"]);
        // the edge tag has no LB section, so the web tag's survives
        assert!(machine.haproxy.is_some());
    }

    #[tokio::test]
    async fn test_missing_keys_are_empty() {
        let store = Arc::new(MemoryStore::new());
        let runtime = poller(store, &["nothing"]).fetch().await.unwrap();
        assert_eq!(runtime, RuntimeConfiguration::default());
    }

    #[tokio::test]
    async fn test_name_mismatch_fails_the_cycle() {
        let store = seeded_store();
        store.insert("/orbit/services/web/config", r#"{"name": "api"}"#);
        let err = poller(Arc::new(store), &["web"]).fetch().await.unwrap_err();
        assert!(matches!(
            err,
            PollError::Integrity(IntegrityError::ServiceName { .. })
        ));
    }

    #[tokio::test]
    async fn test_broken_unreferenced_service_is_skipped() {
        let store = seeded_store();
        store.insert("/orbit/services/api/config", r#"{"name": "web"}"#);
        store.insert("/orbit/services/db/config", "not json");
        store.insert("/orbit/services/db/endpoints/10.0.0.5:5432", "{}");
        let runtime = poller(Arc::new(store), &["web"]).fetch().await.unwrap();

        let machine = &runtime.machine_configuration;
        assert_eq!(machine.services.keys().collect::<Vec<_>>(), vec!["web"]);
        assert_eq!(runtime.service_backends["db"].len(), 1);
    }

    #[tokio::test]
    async fn test_backend_changes_do_not_count_as_config_changes() {
        let store = Arc::new(seeded_store());
        let poller = poller(store.clone(), &["web"]);

        let first = poller.fetch().await.unwrap();
        assert_eq!(classify(None, &first), Change::Changed);

        let again = poller.fetch().await.unwrap();
        assert_eq!(classify(Some(&first), &again), Change::Unchanged);

        store.insert("/orbit/services/web/endpoints/10.0.0.2:8080", "{}");
        let moved = poller.fetch().await.unwrap();
        assert_eq!(classify(Some(&first), &moved), Change::BackendsOnly);

        store.insert(
            "/orbit/machineconfigurations/tags/web/haproxy_config",
            "global\n\tmaxconn 10",
        );
        let edited = poller.fetch().await.unwrap();
        assert_eq!(classify(Some(&moved), &edited), Change::Changed);
    }

    #[tokio::test]
    async fn test_bad_json_is_reported_with_path() {
        let store = seeded_store();
        store.insert(
            "/orbit/machineconfigurations/tags/web/haproxy_endpoints/web",
            r#"{"name": "web"}"#,
        );
        let err = poller(Arc::new(store), &["web"]).fetch().await.unwrap_err();
        match err {
            PollError::InvalidContent { path, .. } => assert_eq!(
                path,
                "/orbit/machineconfigurations/tags/web/haproxy_endpoints/web"
            ),
            other => panic!("unexpected error {other}"),
        }
    }
}
