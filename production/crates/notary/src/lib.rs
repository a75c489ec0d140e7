//! Finality and ordering for ledger transitions
//!
//! A notary accepts at most one transition per consumed record version (and
//! per issued record id), which is what prevents two concurrently signed
//! transitions from both committing. It also registers the digest of every
//! output it accepts and refuses inputs that do not match a registered output.
//!
//! Backends:
//! - [`EtcdNotary`]: claims stored in etcd with compare-and-swap transactions
//! - [`InMemoryNotary`]: claims in process memory
//! - [`HttpNotaryClient`]: forwards to a node hosting a notary

pub mod client;
pub mod etcd;
pub mod memory;
pub mod notary;

pub use client::HttpNotaryClient;
pub use etcd::{EtcdClaims, EtcdNotary};
pub use memory::{InMemoryClaims, InMemoryNotary};
pub use notary::{claim_set, ClaimLedger, ClaimOutcome, ClaimSet, Notary};

use async_trait::async_trait;
use diamondchain_types::{FinalityReceipt, PartyName, SignedProposal, TxId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinalityError {
    #[error("{claim} already consumed by transaction {conflicting_tx}")]
    Conflict { claim: String, conflicting_tx: TxId },

    #[error("missing signatures from: {}", format_parties(parties))]
    MissingSignatures { parties: Vec<PartyName> },

    #[error("invalid transaction: {reason}")]
    Invalid { reason: String },

    #[error("{state} is not an output of an accepted transaction")]
    UnknownState { state: String },

    #[error("notary unavailable: {reason}")]
    Unavailable { reason: String },
}

fn format_parties(parties: &[PartyName]) -> String {
    parties
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ordering service accepting fully signed transitions
#[async_trait]
pub trait FinalityService: Send + Sync {
    fn identity(&self) -> &PartyName;

    /// Accept `signed` if none of its claims is held by another transaction.
    /// Submitting an already accepted transaction again returns a receipt for it.
    async fn notarise(&self, signed: &SignedProposal) -> Result<FinalityReceipt, FinalityError>;
}
