use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use orbit_core::model::ContainerConfiguration;
use orbit_core::runtime::{ContainerDetails, ContainerRuntime, RuntimeError};

/// Mutating calls recorded by the fake runtime
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull(String),
    Create { name: String, image: String },
    Start(String),
    Stop(String),
    Remove(String),
}

impl RuntimeCall {
    #[cfg(test)]
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RuntimeCall::Pull(_))
    }
}

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, ContainerDetails>,
    images: BTreeSet<String>,
    registry: BTreeSet<String>,
    calls: Vec<RuntimeCall>,
    stuck: BTreeSet<String>,
    next_id: u64,
}

/// In-memory container runtime. Only registry images can be pulled; an
/// open registry serves every image.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Image available for pulling
    #[cfg(test)]
    pub fn with_registry_image(self, image: &str) -> Self {
        self.lock().registry.insert(image.to_string());
        self
    }

    /// Allows every image to be pulled
    pub fn with_open_registry(self) -> Self {
        self.lock().registry.insert("*".to_string());
        self
    }

    #[cfg(test)]
    pub fn add_container(&self, details: ContainerDetails) {
        let mut state = self.lock();
        state.images.insert(details.image.clone());
        state.containers.insert(details.id.clone(), details);
    }

    /// Makes every `stop` of this container fail
    #[cfg(test)]
    pub fn fail_stop(&self, id: &str) {
        self.lock().stuck.insert(id.to_string());
    }

    #[cfg(test)]
    pub fn containers(&self) -> Vec<ContainerDetails> {
        self.lock().containers.values().cloned().collect()
    }

    #[cfg(test)]
    pub fn running(&self) -> Vec<ContainerDetails> {
        self.containers().into_iter().filter(|c| c.running).collect()
    }

    #[cfg(test)]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    #[cfg(test)]
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn resolve(state: &FakeState, id_or_name: &str) -> Option<String> {
        let name = id_or_name.trim_start_matches('/');
        if state.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        state
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.id.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.lock().containers.keys().cloned().collect())
    }

    async fn inspect(&self, id_or_name: &str) -> Result<ContainerDetails, RuntimeError> {
        let state = self.lock();
        let id = Self::resolve(&state, id_or_name)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id_or_name.to_string()))?;
        let mut details = state.containers[&id].clone();
        // the Docker API reports names with a leading slash
        details.name = format!("/{}", details.name);
        Ok(details)
    }

    async fn has_image(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Pull(image.to_string()));
        if state.registry.contains(image) || state.registry.contains("*") {
            state.images.insert(image.to_string());
            Ok(())
        } else {
            Err(RuntimeError::NoSuchImage(image.to_string()))
        }
    }

    async fn create(
        &self,
        name: &str,
        config: &ContainerConfiguration,
    ) -> Result<String, RuntimeError> {
        let mut state = self.lock();
        if !state.images.contains(&config.image) {
            return Err(RuntimeError::NoSuchImage(config.image.clone()));
        }
        if state.containers.values().any(|c| c.name == name) {
            return Err(RuntimeError::Conflict(name.to_string()));
        }

        state.next_id += 1;
        let id = format!("fake-{:04}", state.next_id);
        state.calls.push(RuntimeCall::Create {
            name: name.to_string(),
            image: config.image.clone(),
        });
        state.containers.insert(
            id.clone(),
            ContainerDetails {
                id: id.clone(),
                name: name.to_string(),
                image: config.image.clone(),
                hostname: config.hostname.clone(),
                env: config.env.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        state.calls.push(RuntimeCall::Start(id.clone()));
        if let Some(container) = state.containers.get_mut(&id) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        state.calls.push(RuntimeCall::Stop(id.clone()));
        if state.stuck.contains(&id) {
            return Err(RuntimeError::api("stop", "daemon timeout"));
        }
        if let Some(container) = state.containers.get_mut(&id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        if state.containers[&id].running && !force {
            return Err(RuntimeError::Conflict(format!("{} is running", id)));
        }
        state.calls.push(RuntimeCall::Remove(id.clone()));
        state.containers.remove(&id);
        Ok(())
    }
}
