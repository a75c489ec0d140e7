//! Ledger storage
//!
//! The vault holds every record version a node participates in and answers
//! "what is the current version of record X" for the orchestrator. The attempt
//! store keeps orchestration progress so attempts survive a restart.

pub mod etcd;
pub mod memory;
pub mod postgres;

pub use etcd::EtcdAttemptStore;
pub use memory::{InMemoryAttemptStore, InMemoryVault};
pub use postgres::PostgresVault;

use async_trait::async_trait;
use diamondchain_types::{
    Attempt, AttemptId, FinalizedTransition, PartyName, RecordId, Result, StateAndRef,
};

/// Read side of the vault.
#[async_trait]
pub trait QueryGateway: Send + Sync {
    /// Unconsumed versions of `record_id` that `held_by` participates in.
    ///
    /// More than one result is an integrity failure the caller must surface.
    async fn find_current(
        &self,
        record_id: RecordId,
        held_by: &PartyName,
    ) -> Result<Vec<StateAndRef>>;

    /// All unconsumed versions `held_by` participates in.
    async fn list_current(&self, held_by: &PartyName) -> Result<Vec<StateAndRef>>;
}

/// Write side of the vault.
#[async_trait]
pub trait VaultRecorder: Send + Sync {
    /// Mark the consumed versions as spent and store the produced ones.
    /// Recording the same transition twice is a no-op.
    async fn record_transition(&self, finalized: &FinalizedTransition) -> Result<()>;
}

pub trait Vault: QueryGateway + VaultRecorder {}

impl<T: QueryGateway + VaultRecorder> Vault for T {}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn save(&self, attempt: &Attempt) -> Result<()>;

    async fn load(&self, id: AttemptId) -> Result<Option<Attempt>>;

    /// Attempts that are neither committed nor rejected.
    async fn list_incomplete(&self) -> Result<Vec<Attempt>>;
}
