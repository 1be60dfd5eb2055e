#![cfg(feature = "docker")]

use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use futures_util::StreamExt;
use tracing::debug;

use orbit_core::model::{ContainerConfiguration, image_repository, image_tag};
use orbit_core::runtime::{ContainerDetails, ContainerRuntime, RuntimeError};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connects over the local socket and pings the daemon
    pub async fn connect() -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::api("connect", e))?;

        client.ping().await.map_err(|e| RuntimeError::api("ping", e))?;

        Ok(Self { client })
    }
}

fn status_of(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn container_error(operation: &'static str, id: &str, err: DockerError) -> RuntimeError {
    match status_of(&err) {
        Some(404) => RuntimeError::NoSuchContainer(id.to_string()),
        Some(409) => RuntimeError::Conflict(id.to_string()),
        _ => RuntimeError::api(operation, err),
    }
}

/// Docker wants the container spec in its own PascalCase shape, which is
/// what [`ContainerConfiguration`] serializes to.
fn to_docker_config(
    config: &ContainerConfiguration,
) -> Result<Config<String>, RuntimeError> {
    let value = serde_json::to_value(config).map_err(|e| RuntimeError::api("create", e))?;
    serde_json::from_value(value).map_err(|e| RuntimeError::api("create", e))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::api("list", e))?;
        Ok(summaries.into_iter().filter_map(|s| s.id).collect())
    }

    async fn inspect(&self, id_or_name: &str) -> Result<ContainerDetails, RuntimeError> {
        let response = self
            .client
            .inspect_container(id_or_name, None)
            .await
            .map_err(|e| container_error("inspect", id_or_name, e))?;

        let config = response.config.unwrap_or_default();
        Ok(ContainerDetails {
            id: response.id.unwrap_or_else(|| id_or_name.to_string()),
            name: response.name.unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            hostname: config.hostname.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            running: response
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
        })
    }

    async fn has_image(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(404) => Ok(false),
            Err(e) => Err(RuntimeError::api("inspect image", e)),
        }
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: image_repository(image).to_string(),
            tag: image_tag(image).to_string(),
            ..Default::default()
        };

        let mut progress = self.client.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            match step {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status, "pull progress");
                    }
                }
                Err(e) if status_of(&e) == Some(404) => {
                    return Err(RuntimeError::NoSuchImage(image.to_string()));
                }
                Err(e) => return Err(RuntimeError::api("pull", e)),
            }
        }
        Ok(())
    }

    async fn create(
        &self,
        name: &str,
        config: &ContainerConfiguration,
    ) -> Result<String, RuntimeError> {
        let body = to_docker_config(config)?;
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        match self.client.create_container(Some(options), body).await {
            Ok(response) => Ok(response.id),
            Err(e) if status_of(&e) == Some(404) => {
                Err(RuntimeError::NoSuchImage(config.image.clone()))
            }
            Err(e) => Err(container_error("create", name, e)),
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| container_error("start", id, e))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // already stopped
            Err(e) if status_of(&e) == Some(304) => Ok(()),
            Err(e) => Err(container_error("stop", id, e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| container_error("remove", id, e))
    }
}
