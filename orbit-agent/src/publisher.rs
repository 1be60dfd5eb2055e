use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use orbit_core::event::ServiceStateEvent;
use orbit_core::kvs::{KeyValueStore, Keyspace, KvsError};
use orbit_core::model::EndpointInfo;

/// Lifetime of an endpoint key; checks refresh it far more often
pub const ENDPOINT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Kvs(#[from] KvsError),
    #[error("failed to encode endpoint info: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writes check results into the KVS endpoint directory
pub struct ResultPublisher {
    kvs: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    present: Mutex<HashSet<String>>,
}

impl ResultPublisher {
    pub fn new(kvs: Arc<dyn KeyValueStore>, keyspace: Keyspace) -> Self {
        Self {
            kvs,
            keyspace,
            present: Mutex::new(HashSet::new()),
        }
    }

    pub async fn publish(
        &self,
        service: &str,
        endpoint: &str,
        is_up: bool,
    ) -> Result<(), PublishError> {
        self.publish_with_info(service, endpoint, is_up, &EndpointInfo::default())
            .await
    }

    pub async fn publish_state(&self, event: &ServiceStateEvent) -> Result<(), PublishError> {
        self.publish_with_info(
            &event.service,
            &event.endpoint,
            event.is_up,
            &event.endpoint_info,
        )
        .await
    }

    async fn publish_with_info(
        &self,
        service: &str,
        endpoint: &str,
        is_up: bool,
        info: &EndpointInfo,
    ) -> Result<(), PublishError> {
        let key = self.keyspace.service_endpoint(service, endpoint);

        if is_up {
            let value = serde_json::to_string(info)?;
            self.kvs.set(&key, &value, Some(ENDPOINT_TTL)).await?;
            if self.mark(&key, true) {
                info!(service, endpoint, "endpoint up");
            }
        } else {
            match self.kvs.delete(&key, false).await {
                Ok(()) => {}
                Err(e) if e.is_key_not_found() => debug!(%key, "endpoint already absent"),
                Err(e) => return Err(e.into()),
            }
            if self.mark(&key, false) {
                info!(service, endpoint, "endpoint down");
            }
        }
        Ok(())
    }

    // true when the key changed presence
    fn mark(&self, key: &str, present: bool) -> bool {
        let mut set = self.present.lock().unwrap_or_else(PoisonError::into_inner);
        if present {
            set.insert(key.to_string())
        } else {
            set.remove(key)
        }
    }
}
