//! `orbit-agent verify`: checks that the keyspace for this machine's tags
//! is complete and parseable, without touching containers or the LB.

use std::collections::BTreeSet;

use tracing::info;

use orbit_core::kvs::{KeyValueStore, Keyspace, KvNode, KvsError};
use orbit_core::model::IntegrityError;

use crate::poller::{PollError, get_tree, read_service, read_tag};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("missing path: {0}")]
    MissingPath(String),
    #[error("invalid content: {0}")]
    InvalidContent(String),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Kvs(KvsError),
}

impl From<PollError> for VerifyError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::InvalidContent { path, .. } => VerifyError::InvalidContent(path),
            PollError::Integrity(e) => VerifyError::Integrity(e),
            PollError::Kvs(e) => e.into(),
        }
    }
}

impl From<KvsError> for VerifyError {
    fn from(e: KvsError) -> Self {
        match e {
            KvsError::KeyNotFound(path) => VerifyError::MissingPath(path),
            other => VerifyError::Kvs(other),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub services: usize,
    pub tags: usize,
    pub haproxy_endpoints: usize,
}

async fn require_tree(kvs: &dyn KeyValueStore, key: &str) -> Result<KvNode, VerifyError> {
    get_tree(kvs, key)
        .await?
        .ok_or_else(|| VerifyError::MissingPath(key.to_string()))
}

pub async fn verify(
    kvs: &dyn KeyValueStore,
    keyspace: &Keyspace,
    tags: &[String],
) -> Result<VerifyReport, VerifyError> {
    let mut report = VerifyReport::default();

    let root = require_tree(kvs, &keyspace.services()).await?;
    let mut known = BTreeSet::new();
    for dir in &root.nodes {
        if read_service(dir)?.is_none() {
            return Err(VerifyError::MissingPath(keyspace.service_config(dir.name())));
        }
        known.insert(dir.name().to_string());
    }
    report.services = known.len();

    for tag in tags {
        let path = keyspace.tag(tag);
        let dir = require_tree(kvs, &path).await?;
        if dir.child("authoritative_names").is_none() {
            return Err(VerifyError::MissingPath(format!("{}/authoritative_names", path)));
        }

        let record = read_tag(&dir)?;
        if let Some(name) = record.overrides.keys().find(|name| !known.contains(*name)) {
            return Err(VerifyError::MissingPath(keyspace.service_config(name)));
        }
        for (key, endpoint) in &record.endpoints {
            if &endpoint.name != key {
                return Err(IntegrityError::EndpointName {
                    key: key.clone(),
                    name: endpoint.name.clone(),
                }
                .into());
            }
        }

        report.tags += 1;
        report.haproxy_endpoints += record.endpoints.len();
        info!(%tag, services = record.overrides.len(), "tag verified");
    }

    Ok(report)
}
