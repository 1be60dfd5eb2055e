//! Key-value store seam
//!
//! The agent only needs hierarchical get/set/delete with TTLs, the subset
//! of etcd v2 semantics described by [`KeyValueStore`]. [`MemoryStore`]
//! implements the same semantics in-process for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum KvsError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("kvs request failed: {0}")]
    Transport(String),
    #[error("kvs returned {code} for {key}: {message}")]
    Server { code: u64, key: String, message: String },
}

impl KvsError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, KvsError::KeyNotFound(_))
    }
}

/// A key or directory returned by [`KeyValueStore::get`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvNode {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    pub nodes: Vec<KvNode>,
}

impl KvNode {
    /// Last path segment of the key
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn child(&self, name: &str) -> Option<&KvNode> {
        self.nodes.iter().find(|node| node.name() == name)
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a key, or a directory listing. Non-recursive listings return
    /// immediate children only, with their `nodes` left empty.
    async fn get(&self, key: &str, recursive: bool) -> Result<KvNode, KvsError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvsError>;

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvsError>;

    async fn mkdir(&self, key: &str) -> Result<(), KvsError>;
}

/// Paths of the agent's keyspace under a base prefix
#[derive(Clone, Debug)]
pub struct Keyspace {
    base: String,
}

impl Keyspace {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn services(&self) -> String {
        format!("{}/services", self.base)
    }

    pub fn service_config(&self, service: &str) -> String {
        format!("{}/services/{}/config", self.base, service)
    }

    pub fn service_revision(&self, service: &str) -> String {
        format!("{}/services/{}/revision", self.base, service)
    }

    pub fn service_endpoints(&self, service: &str) -> String {
        format!("{}/services/{}/endpoints", self.base, service)
    }

    pub fn service_endpoint(&self, service: &str, endpoint: &str) -> String {
        format!("{}/services/{}/endpoints/{}", self.base, service, endpoint)
    }

    pub fn tag(&self, tag: &str) -> String {
        format!("{}/machineconfigurations/tags/{}", self.base, tag)
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: BTreeMap<String, Entry>,
    dirs: BTreeSet<String>,
}

impl StoreState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
    }

    fn has_descendants(&self, key: &str) -> bool {
        let prefix = dir_prefix(key);
        self.entries.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }
}

/// In-process store with etcd-like directory and TTL semantics.
/// Expiry follows tokio's clock, so paused-time tests can advance it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn dir_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{}/", key)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of a key, if present and not expired
    pub fn value(&self, key: &str) -> Option<String> {
        let mut state = self.lock();
        state.purge_expired();
        state.entries.get(&normalize(key)).map(|e| e.value.clone())
    }

    /// TTL the key was last written with
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.lock();
        state.purge_expired();
        state.entries.get(&normalize(key)).and_then(|e| e.ttl)
    }

    /// Seeds a key without going through the async API
    pub fn insert(&self, key: &str, value: impl Into<String>) {
        self.lock().entries.insert(
            normalize(key),
            Entry {
                value: value.into(),
                ttl: None,
                expires_at: None,
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        let mut state = self.lock();
        state.purge_expired();
        state.entries.keys().cloned().collect()
    }
}

#[derive(Default)]
struct TreeBuilder {
    value: Option<String>,
    children: BTreeMap<String, TreeBuilder>,
}

impl TreeBuilder {
    fn insert(&mut self, parts: &[&str], value: Option<String>) {
        match parts.split_first() {
            None => {
                if value.is_some() {
                    self.value = value;
                }
            }
            Some((head, rest)) => self
                .children
                .entry(head.to_string())
                .or_default()
                .insert(rest, value),
        }
    }

    fn build(self, key: String, depth_left: Option<usize>) -> KvNode {
        let dir = self.value.is_none();
        let nodes = match depth_left {
            Some(0) => Vec::new(),
            _ => self
                .children
                .into_iter()
                .map(|(name, child)| {
                    let child_key = format!("{}/{}", key.trim_end_matches('/'), name);
                    child.build(child_key, depth_left.map(|d| d - 1))
                })
                .collect(),
        };
        KvNode {
            key,
            value: self.value,
            dir,
            nodes,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<KvNode, KvsError> {
        let key = normalize(key);
        let mut state = self.lock();
        state.purge_expired();

        if let Some(entry) = state.entries.get(&key) {
            return Ok(KvNode {
                key,
                value: Some(entry.value.clone()),
                dir: false,
                nodes: Vec::new(),
            });
        }

        if !state.dirs.contains(&key) && !state.has_descendants(&key) && key != "/" {
            return Err(KvsError::KeyNotFound(key));
        }

        let prefix = dir_prefix(&key);
        let mut root = TreeBuilder::default();
        for (k, entry) in state.entries.iter().filter(|(k, _)| k.starts_with(&prefix)) {
            let parts: Vec<&str> = k[prefix.len()..].split('/').collect();
            root.insert(&parts, Some(entry.value.clone()));
        }
        for d in state.dirs.iter().filter(|d| d.starts_with(&prefix)) {
            let parts: Vec<&str> = d[prefix.len()..].split('/').collect();
            root.insert(&parts, None);
        }

        let depth = if recursive { None } else { Some(1) };
        Ok(root.build(key, depth))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvsError> {
        let key = normalize(key);
        let mut state = self.lock();
        state.purge_expired();
        if state.dirs.contains(&key) || state.has_descendants(&key) {
            return Err(KvsError::NotAFile(key));
        }
        state.entries.insert(
            key,
            Entry {
                value: value.to_string(),
                ttl,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvsError> {
        let key = normalize(key);
        let mut state = self.lock();
        state.purge_expired();

        if state.entries.remove(&key).is_some() {
            return Ok(());
        }
        if !state.dirs.contains(&key) && !state.has_descendants(&key) {
            return Err(KvsError::KeyNotFound(key));
        }
        if !recursive {
            return Err(KvsError::NotAFile(key));
        }

        let prefix = dir_prefix(&key);
        state.entries.retain(|k, _| !k.starts_with(&prefix));
        state.dirs.retain(|d| d != &key && !d.starts_with(&prefix));
        Ok(())
    }

    async fn mkdir(&self, key: &str) -> Result<(), KvsError> {
        let key = normalize(key);
        let mut state = self.lock();
        if state.entries.contains_key(&key) {
            return Err(KvsError::NotAFile(key));
        }
        state.dirs.insert(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recursive_and_flat_listing() {
        let store = MemoryStore::new();
        store.insert("/orbit/services/web/config", "{}");
        store.insert("/orbit/services/web/endpoints/10.0.0.1:80", "{}");
        store.insert("/orbit/services/db/config", "{}");

        let flat = store.get("/orbit/services", false).await.unwrap();
        assert!(flat.dir);
        let names: Vec<&str> = flat.nodes.iter().map(KvNode::name).collect();
        assert_eq!(names, vec!["db", "web"]);
        assert!(flat.nodes.iter().all(|n| n.dir && n.nodes.is_empty()));

        let deep = store.get("/orbit/services/", true).await.unwrap();
        let web = deep.child("web").unwrap();
        let endpoint = web.child("endpoints").unwrap().child("10.0.0.1:80").unwrap();
        assert_eq!(endpoint.key, "/orbit/services/web/endpoints/10.0.0.1:80");
        assert_eq!(endpoint.value.as_deref(), Some("{}"));
        assert!(!endpoint.dir);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryStore::new();
        let err = store.get("/nothing", true).await.unwrap_err();
        assert!(err.is_key_not_found());
        assert!(store.delete("/nothing", false).await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_mkdir_lists_empty_directory() {
        let store = MemoryStore::new();
        store.mkdir("/orbit/services/web/endpoints").await.unwrap();
        let node = store.get("/orbit/services/web/endpoints", true).await.unwrap();
        assert!(node.dir);
        assert!(node.nodes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("/k", "{}", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.ttl("/k"), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.value("/k").as_deref(), Some("{}"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.value("/k"), None);
        assert!(store.get("/k", false).await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_delete_directory_requires_recursive() {
        let store = MemoryStore::new();
        store.insert("/a/b", "1");
        store.insert("/a/c", "2");
        assert!(matches!(
            store.delete("/a", false).await,
            Err(KvsError::NotAFile(_))
        ));
        store.delete("/a", true).await.unwrap();
        assert!(store.keys().is_empty());
    }
}
