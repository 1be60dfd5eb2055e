//! Container runtime seam
//!
//! The reconciler drives containers through this minimal API. The Docker
//! implementation lives in the agent crate; tests use the fake runtime.

use std::time::Duration;

use async_trait::async_trait;

use crate::model::ContainerConfiguration;

/// What the reconciler needs to know about an existing container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    /// Without the leading `/` the Docker API reports
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: Vec<String>,
    pub running: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("no such image: {0}")]
    NoSuchImage(String),
    #[error("container name already in use: {0}")]
    Conflict(String),
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl RuntimeError {
    pub fn api(operation: &'static str, err: impl std::fmt::Display) -> Self {
        RuntimeError::Api {
            operation,
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ids of all containers, running or not
    async fn list(&self) -> Result<Vec<String>, RuntimeError>;

    async fn inspect(&self, id_or_name: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn has_image(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates a container from `config`, including its host config.
    /// Returns the new container id.
    async fn create(
        &self,
        name: &str,
        config: &ContainerConfiguration,
    ) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
}
