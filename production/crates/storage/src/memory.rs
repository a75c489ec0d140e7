use async_trait::async_trait;
use diamondchain_types::{
    AssetRecord, Attempt, AttemptId, FinalizedTransition, PartyName, RecordId, Result, StateAndRef,
    StateRef, TxId,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{AttemptStore, QueryGateway, VaultRecorder};

#[derive(Debug, Clone)]
struct StoredVersion {
    record: AssetRecord,
    consumed_by: Option<TxId>,
}

/// Process-local vault for tests and single-node runs
#[derive(Debug, Default)]
pub struct InMemoryVault {
    versions: RwLock<HashMap<StateRef, StoredVersion>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored versions, consumed ones included.
    pub async fn version_count(&self) -> usize {
        self.versions.read().await.len()
    }
}

#[async_trait]
impl QueryGateway for InMemoryVault {
    async fn find_current(
        &self,
        record_id: RecordId,
        held_by: &PartyName,
    ) -> Result<Vec<StateAndRef>> {
        let versions = self.versions.read().await;
        Ok(versions
            .iter()
            .filter(|(state_ref, v)| {
                state_ref.record_id == record_id
                    && v.consumed_by.is_none()
                    && v.record.participants().contains(held_by)
            })
            .map(|(state_ref, v)| StateAndRef {
                state_ref: state_ref.clone(),
                record: v.record.clone(),
            })
            .collect())
    }

    async fn list_current(&self, held_by: &PartyName) -> Result<Vec<StateAndRef>> {
        let versions = self.versions.read().await;
        let mut current: Vec<StateAndRef> = versions
            .iter()
            .filter(|(_, v)| v.consumed_by.is_none() && v.record.participants().contains(held_by))
            .map(|(state_ref, v)| StateAndRef {
                state_ref: state_ref.clone(),
                record: v.record.clone(),
            })
            .collect();
        current.sort_by_key(|s| s.record.date_issued);
        Ok(current)
    }
}

#[async_trait]
impl VaultRecorder for InMemoryVault {
    async fn record_transition(&self, finalized: &FinalizedTransition) -> Result<()> {
        let tx_id = &finalized.signed.tx_id;
        let mut versions = self.versions.write().await;

        for consumed in &finalized.signed.proposal.consumed {
            let entry = versions
                .entry(consumed.state_ref.clone())
                .or_insert_with(|| StoredVersion {
                    record: consumed.record.clone(),
                    consumed_by: None,
                });
            entry.consumed_by = Some(tx_id.clone());
        }

        for record in &finalized.signed.proposal.produced {
            let state_ref = StateRef {
                tx_id: tx_id.clone(),
                record_id: record.record_id,
            };
            versions.entry(state_ref).or_insert_with(|| StoredVersion {
                record: record.clone(),
                consumed_by: None,
            });
        }

        debug!(tx_id = %tx_id, "Recorded transition in memory vault");
        Ok(())
    }
}

/// Process-local attempt store
#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    attempts: RwLock<HashMap<AttemptId, Attempt>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn save(&self, attempt: &Attempt) -> Result<()> {
        self.attempts.write().await.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn load(&self, id: AttemptId) -> Result<Option<Attempt>> {
        Ok(self.attempts.read().await.get(&id).cloned())
    }

    async fn list_incomplete(&self) -> Result<Vec<Attempt>> {
        let attempts = self.attempts.read().await;
        let mut incomplete: Vec<Attempt> = attempts
            .values()
            .filter(|a| !a.state.is_terminal())
            .cloned()
            .collect();
        incomplete.sort_by_key(|a| a.created_at);
        Ok(incomplete)
    }
}
