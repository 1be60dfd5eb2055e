//! Container reconciler
//!
//! Matches existing containers against the desired services, removes the
//! authoritative leftovers and launches whatever is missing. A container
//! matches a service when the name, the revisioned image, the hostname (if
//! one is configured) and the environment (as an ordered subsequence) agree.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use orbit_core::model::{ContainerConfiguration, MachineConfiguration, ServiceConfiguration};
use orbit_core::runtime::{ContainerDetails, ContainerRuntime, RuntimeError};

pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("failed to list containers: {0}")]
    Inventory(#[source] RuntimeError),
}

/// What one converge pass did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Services whose container was (re)launched
    pub launched: Vec<String>,
    /// Ids of removed containers
    pub removed: Vec<String>,
    /// Services with more than one matching container
    pub ambiguous: Vec<String>,
    /// `(service, error)` for launches that failed
    pub failed: Vec<(String, String)>,
    /// `(id, error)` for leftovers that could not be removed
    pub cleanup_failed: Vec<(String, String)>,
}

impl ConvergeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cleanup_failed.is_empty()
    }
}

/// `wanted` appears in `have` in the same relative order
fn is_ordered_subset(wanted: &[String], have: &[String]) -> bool {
    let mut have = have.iter();
    wanted.iter().all(|w| have.any(|h| h == w))
}

fn matches(
    service: &ServiceConfiguration,
    desired: &ContainerConfiguration,
    image: &str,
    existing: &ContainerDetails,
) -> bool {
    existing.name == service.name
        && existing.image == image
        && (desired.hostname.is_empty() || existing.hostname == desired.hostname)
        && is_ordered_subset(&desired.env, &existing.env)
}

struct Launch {
    service: String,
    config: ContainerConfiguration,
}

pub struct ContainerReconciler {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerReconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    async fn inventory(&self) -> Result<Vec<ContainerDetails>, ConvergeError> {
        let ids = self.runtime.list().await.map_err(ConvergeError::Inventory)?;
        let mut containers = Vec::with_capacity(ids.len());
        for id in ids {
            match self.runtime.inspect(&id).await {
                Ok(mut details) => {
                    details.name = details.name.trim_start_matches('/').to_string();
                    containers.push(details);
                }
                // removed between list and inspect
                Err(RuntimeError::NoSuchContainer(_)) => {}
                Err(e) => return Err(ConvergeError::Inventory(e)),
            }
        }
        Ok(containers)
    }

    pub async fn converge(
        &self,
        machine: &MachineConfiguration,
    ) -> Result<ConvergeReport, ConvergeError> {
        let existing = self.inventory().await?;
        let mut report = ConvergeReport::default();
        let mut claimed = BTreeSet::new();
        let mut launches = Vec::new();

        for (name, bound) in &machine.services {
            let service = match bound.get_config() {
                Ok(service) => service,
                Err(e) => {
                    report.failed.push((name.clone(), e.to_string()));
                    continue;
                }
            };
            let (Some(desired), Some(image)) = (&service.container, service.effective_image())
            else {
                continue;
            };

            let found: Vec<&ContainerDetails> = existing
                .iter()
                .filter(|c| matches(&service, desired, &image, c))
                .collect();
            claimed.extend(found.iter().map(|c| c.id.clone()));

            let mut config = desired.clone();
            config.image = image;
            match found.as_slice() {
                [] => launches.push(Launch {
                    service: service.name.clone(),
                    config,
                }),
                [stopped] if !stopped.running => {
                    info!(service = %service.name, id = %stopped.id, "replacing stopped container");
                    if let Err(e) = self.runtime.remove(&stopped.id, true).await {
                        report.failed.push((service.name.clone(), e.to_string()));
                        continue;
                    }
                    report.removed.push(stopped.id.clone());
                    launches.push(Launch {
                        service: service.name.clone(),
                        config,
                    });
                }
                [_] => debug!(service = %service.name, "container up to date"),
                many => {
                    warn!(service = %service.name, count = many.len(), "multiple matching containers, leaving them alone");
                    report.ambiguous.push(service.name.clone());
                }
            }
        }

        for container in existing.iter().filter(|c| c.running && !claimed.contains(&c.id)) {
            if !machine.is_authoritative(&container.image) {
                continue;
            }
            info!(id = %container.id, name = %container.name, image = %container.image, "removing unwanted container");
            let removed = match self.runtime.stop(&container.id, STOP_GRACE).await {
                Ok(()) => self.runtime.remove(&container.id, false).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => report.removed.push(container.id.clone()),
                Err(e) => {
                    warn!(id = %container.id, error = %e, "failed to remove unwanted container");
                    report.cleanup_failed.push((container.id.clone(), e.to_string()));
                }
            }
        }

        let results = join_all(launches.iter().map(|launch| self.launch(launch))).await;
        for (launch, result) in launches.iter().zip(results) {
            match result {
                Ok(id) => {
                    info!(service = %launch.service, %id, image = %launch.config.image, "launched container");
                    report.launched.push(launch.service.clone());
                }
                Err(e) => {
                    warn!(service = %launch.service, error = %e, "failed to launch container");
                    report.failed.push((launch.service.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn launch(&self, launch: &Launch) -> Result<String, RuntimeError> {
        let image = &launch.config.image;
        if !self.runtime.has_image(image).await? {
            info!(%image, "pulling image");
            self.runtime.pull(image).await?;
        }

        // a stale container would hold the name
        match self.runtime.inspect(&launch.service).await {
            Ok(old) => {
                if let Err(e) = self.runtime.stop(&old.id, STOP_GRACE).await {
                    debug!(id = %old.id, error = %e, "stopping old container");
                }
                if let Err(e) = self.runtime.remove(&old.id, true).await {
                    debug!(id = %old.id, error = %e, "removing old container");
                }
            }
            Err(RuntimeError::NoSuchContainer(_)) => {}
            Err(e) => debug!(service = %launch.service, error = %e, "inspecting old container"),
        }

        let id = match self.runtime.create(&launch.service, &launch.config).await {
            Err(RuntimeError::NoSuchImage(_)) => {
                self.runtime.pull(image).await?;
                self.runtime.create(&launch.service, &launch.config).await?
            }
            other => other?,
        };
        self.runtime.start(&id).await?;
        Ok(id)
    }
}
