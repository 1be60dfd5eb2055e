//! etcd v2 keys API over HTTP

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use orbit_core::kvs::{KeyValueStore, KvNode, KvsError};

const ERROR_KEY_NOT_FOUND: u64 = 100;
const ERROR_NOT_A_FILE: u64 = 102;
const ERROR_NODE_EXISTS: u64 = 105;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

impl From<EtcdNode> for KvNode {
    fn from(node: EtcdNode) -> Self {
        KvNode {
            key: node.key.unwrap_or_else(|| "/".to_string()),
            value: node.value,
            dir: node.dir,
            nodes: node.nodes.into_iter().map(KvNode::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

#[derive(Clone, Debug)]
pub struct EtcdStore {
    client: Client,
    endpoint: String,
}

impl EtcdStore {
    pub fn new(endpoint: &str) -> Result<Self, KvsError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KvsError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v2/keys/{}", self.endpoint, key.trim_start_matches('/'))
    }

    async fn decode(&self, key: &str, response: Response) -> Result<Option<EtcdNode>, KvsError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| KvsError::Transport(e.to_string()))?;

        if status.is_success() {
            let parsed: EtcdResponse = serde_json::from_slice(&body)
                .map_err(|e| KvsError::Transport(format!("malformed etcd response: {}", e)))?;
            return Ok(parsed.node);
        }

        match serde_json::from_slice::<EtcdErrorBody>(&body) {
            Ok(err) if err.error_code == ERROR_KEY_NOT_FOUND => {
                Err(KvsError::KeyNotFound(key.to_string()))
            }
            Ok(err) if err.error_code == ERROR_NOT_A_FILE => Err(KvsError::NotAFile(key.to_string())),
            Ok(err) => Err(KvsError::Server {
                code: err.error_code,
                key: key.to_string(),
                message: format!("{} {}", err.message, err.cause).trim().to_string(),
            }),
            Err(_) if status == StatusCode::NOT_FOUND => Err(KvsError::KeyNotFound(key.to_string())),
            Err(_) => Err(KvsError::Server {
                code: u64::from(status.as_u16()),
                key: key.to_string(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }
}

fn transport(err: reqwest::Error) -> KvsError {
    KvsError::Transport(err.to_string())
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<KvNode, KvsError> {
        let response = self
            .client
            .get(self.url(key))
            .query(&[("recursive", recursive.to_string())])
            .send()
            .await
            .map_err(transport)?;
        let node = self.decode(key, response).await?;
        node.map(KvNode::from)
            .ok_or_else(|| KvsError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvsError> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.as_secs().to_string()));
        }
        let response = self
            .client
            .put(self.url(key))
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        self.decode(key, response).await.map(|_| ())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvsError> {
        let response = self
            .client
            .delete(self.url(key))
            .query(&[("recursive", recursive.to_string())])
            .send()
            .await
            .map_err(transport)?;
        self.decode(key, response).await.map(|_| ())
    }

    async fn mkdir(&self, key: &str) -> Result<(), KvsError> {
        let response = self
            .client
            .put(self.url(key))
            .form(&[("dir", "true")])
            .send()
            .await
            .map_err(transport)?;
        match self.decode(key, response).await {
            Ok(_) => Ok(()),
            Err(KvsError::Server { code, .. }) if code == ERROR_NODE_EXISTS => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_nested_listing() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/orbit/services",
                "dir": true,
                "nodes": [
                    {"key": "/orbit/services/web", "dir": true, "nodes": [
                        {"key": "/orbit/services/web/config", "value": "{\"name\":\"web\"}"}
                    ]}
                ]
            }
        }"#;
        let parsed: EtcdResponse = serde_json::from_str(body).unwrap();
        let node = KvNode::from(parsed.node.unwrap());
        assert!(node.dir);
        let config = node.child("web").unwrap().child("config").unwrap();
        assert_eq!(config.value.as_deref(), Some(r#"{"name":"web"}"#));
    }

    #[test]
    fn test_url_joins_key() {
        let store = EtcdStore::new("http://127.0.0.1:2379/").unwrap();
        assert_eq!(
            store.url("/orbit/services"),
            "http://127.0.0.1:2379/v2/keys/orbit/services"
        );
    }
}
