use async_trait::async_trait;
use diamondchain_types::{Attempt, AttemptId, Error, Result};
use etcd_client::{Client, GetOptions};
use tracing::{debug, info, warn};

use crate::AttemptStore;

const ATTEMPT_PREFIX: &str = "/attempts/";

/// Attempt store backed by etcd, one JSON value per attempt under `/attempts/{id}`
pub struct EtcdAttemptStore {
    client: Client,
}

impl EtcdAttemptStore {
    pub async fn new(endpoints: Vec<String>) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to connect to etcd: {}", e)))?;

        info!("etcd attempt store connected");

        Ok(Self { client })
    }

    fn key(id: AttemptId) -> String {
        format!("{}{}", ATTEMPT_PREFIX, id)
    }
}

#[async_trait]
impl AttemptStore for EtcdAttemptStore {
    async fn save(&self, attempt: &Attempt) -> Result<()> {
        let value = serde_json::to_vec(attempt)
            .map_err(|e| Error::SerializationError(format!("Failed to serialize attempt: {}", e)))?;

        let mut client = self.client.clone();
        client
            .put(Self::key(attempt.id).as_bytes(), value, None)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to store attempt: {}", e)))?;

        debug!("Stored attempt {} in state {}", attempt.id, attempt.state);

        Ok(())
    }

    async fn load(&self, id: AttemptId) -> Result<Option<Attempt>> {
        let mut client = self.client.clone();
        let resp = client
            .get(Self::key(id).as_bytes(), None)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to get attempt: {}", e)))?;

        match resp.kvs().first() {
            Some(kv) => {
                let attempt = serde_json::from_slice(kv.value()).map_err(|e| {
                    Error::SerializationError(format!("Failed to parse attempt: {}", e))
                })?;
                Ok(Some(attempt))
            }
            None => Ok(None),
        }
    }

    async fn list_incomplete(&self) -> Result<Vec<Attempt>> {
        let mut client = self.client.clone();
        let resp = client
            .get(ATTEMPT_PREFIX.as_bytes(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::StorageError(format!("Failed to list attempts: {}", e)))?;

        let mut attempts = Vec::new();
        for kv in resp.kvs() {
            match serde_json::from_slice::<Attempt>(kv.value()) {
                Ok(attempt) if !attempt.state.is_terminal() => attempts.push(attempt),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Skipping unreadable attempt at key={}: {}",
                        String::from_utf8_lossy(kv.key()),
                        e
                    );
                }
            }
        }
        attempts.sort_by_key(|a| a.created_at);

        Ok(attempts)
    }
}
