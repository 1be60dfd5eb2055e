//! Named background tasks with single-flight semantics
//!
//! Every long-running action the agent performs (polling, converging,
//! relaunching a service) is started through a [`CommandController`]. The
//! controller keeps a registry of live commands so callers can ask for
//! "run this unless one with the same name is already running".

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

pub type CommandId = u64;

#[derive(Debug, Default)]
struct Registry {
    next_id: CommandId,
    active: BTreeMap<CommandId, String>,
}

/// Process-wide registry of running commands. Cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct CommandController {
    registry: Arc<Mutex<Registry>>,
}

/// Handle to a spawned command
#[derive(Debug)]
pub struct Command {
    pub id: CommandId,
    pub name: String,
    done: oneshot::Receiver<anyhow::Result<()>>,
}

impl Command {
    /// Waits for the command to finish and returns its result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("command `{}` aborted", self.name)),
        }
    }
}

// Removes the registry entry when the task ends, including on panic.
struct Deregister {
    registry: Arc<Mutex<Registry>>,
    id: CommandId,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        lock(&self.registry).active.remove(&self.id);
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f(arg)`, naming the command after the function's type.
    pub fn invoke<F, Fut, A>(&self, f: F, arg: A) -> Command
    where
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        A: Send + 'static,
    {
        self.invoke_named(std::any::type_name::<F>(), f, arg)
    }

    /// Runs `f(arg)` under `name`, even if another command has that name.
    pub fn invoke_named<F, Fut, A>(&self, name: impl Into<String>, f: F, arg: A) -> Command
    where
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        A: Send + 'static,
    {
        let name = name.into();
        let id = {
            let mut registry = lock(&self.registry);
            Self::register(&mut registry, &name)
        };
        self.spawn(id, name, f(arg))
    }

    /// Runs `f(arg)` unless a command called `name` is live; returns `None`
    /// when the call was coalesced into the running one.
    pub fn invoke_if_not_already_running<F, Fut, A>(
        &self,
        name: impl Into<String>,
        f: F,
        arg: A,
    ) -> Option<Command>
    where
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        A: Send + 'static,
    {
        let name = name.into();
        let id = {
            let mut registry = lock(&self.registry);
            if registry.active.values().any(|active| active == &name) {
                debug!(command = %name, "already running, skipping");
                return None;
            }
            Self::register(&mut registry, &name)
        };
        Some(self.spawn(id, name, f(arg)))
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.registry).active.values().any(|active| active == name)
    }

    /// Names of live commands, in start order
    pub fn active_names(&self) -> Vec<String> {
        lock(&self.registry).active.values().cloned().collect()
    }

    fn register(registry: &mut Registry, name: &str) -> CommandId {
        registry.next_id += 1;
        let id = registry.next_id;
        registry.active.insert(id, name.to_string());
        id
    }

    fn spawn<Fut>(&self, id: CommandId, name: String, fut: Fut) -> Command
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let guard = Deregister {
            registry: self.registry.clone(),
            id,
        };

        tokio::spawn(async move {
            let result = fut.await;
            drop(guard);
            let _ = tx.send(result);
        });

        Command { id, name, done: rx }
    }
}
