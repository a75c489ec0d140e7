use async_trait::async_trait;
use chrono::Utc;
use diamondchain_protocols::{
    record_digest, verify_proposal, verify_signatures, SignatureVerifier, Signer,
};
use diamondchain_types::{
    AssetRecord, FinalityReceipt, Intent, PartyName, Proposal, RecordId, SignedProposal, TxId,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{FinalityError, FinalityService};

/// Result of trying to claim every key of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimedBySelf,
    Conflict { claim: String, holder: TxId },
    /// A consumed version is not the output an accepted transaction registered.
    UnknownInput { output: String },
}

/// Ledger keys one transition touches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSet {
    /// Consumed versions and issued record ids; each is held by one transaction.
    pub claims: Vec<String>,
    /// Registered outputs this transition consumes, keyed to their digest.
    pub inputs: Vec<(String, String)>,
    /// Outputs registered on acceptance, keyed to their digest.
    pub outputs: Vec<(String, String)>,
}

/// Storage of claims: a key is held by at most one transaction id.
#[async_trait]
pub trait ClaimLedger: Send + Sync {
    /// Check every input is registered, then claim all keys for `tx_id` and
    /// register its outputs atomically, or change nothing.
    async fn claim_all(&self, set: &ClaimSet, tx_id: &TxId) -> Result<ClaimOutcome, FinalityError>;
}

fn output_key(record_id: &RecordId, tx_id: &TxId) -> String {
    format!("output/{}/{}", record_id, tx_id)
}

fn digest(record: &AssetRecord) -> Result<String, FinalityError> {
    record_digest(record).map_err(|e| FinalityError::Invalid {
        reason: e.to_string(),
    })
}

/// Claim set of a proposal: every consumed version, plus the issued record
/// ids of a create. Consumed versions must match the output registered under
/// their reference.
pub fn claim_set(proposal: &Proposal, tx_id: &TxId) -> Result<ClaimSet, FinalityError> {
    let mut set = ClaimSet::default();

    for input in &proposal.consumed {
        let state_ref = &input.state_ref;
        if state_ref.record_id != input.record.record_id {
            return Err(FinalityError::Invalid {
                reason: format!("{} does not reference its own record", state_ref),
            });
        }
        set.claims
            .push(format!("state/{}/{}", state_ref.record_id, state_ref.tx_id));
        set.inputs.push((
            output_key(&state_ref.record_id, &state_ref.tx_id),
            digest(&input.record)?,
        ));
    }

    if matches!(proposal.intent(), Ok(Intent::Create)) {
        set.claims.extend(
            proposal
                .produced
                .iter()
                .map(|r| format!("issue/{}", r.record_id)),
        );
    }

    for record in &proposal.produced {
        set.outputs
            .push((output_key(&record.record_id, tx_id), digest(record)?));
    }

    set.claims.sort();
    set.claims.dedup();
    set.inputs.sort();
    set.inputs.dedup();
    set.outputs.sort();
    set.outputs.dedup();
    Ok(set)
}

pub struct Notary<C> {
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn SignatureVerifier>,
    claims: C,
}

impl<C: ClaimLedger> Notary<C> {
    pub fn new(signer: Arc<dyn Signer>, verifier: Arc<dyn SignatureVerifier>, claims: C) -> Self {
        Self {
            signer,
            verifier,
            claims,
        }
    }

    fn check(&self, signed: &SignedProposal) -> Result<(), FinalityError> {
        verify_proposal(&signed.proposal).map_err(|e| FinalityError::Invalid {
            reason: e.to_string(),
        })?;

        let missing = signed.missing_signers();
        if !missing.is_empty() {
            return Err(FinalityError::MissingSignatures { parties: missing });
        }

        verify_signatures(signed, self.verifier.as_ref()).map_err(|e| FinalityError::Invalid {
            reason: e.to_string(),
        })
    }

    fn receipt(&self, tx_id: &TxId) -> FinalityReceipt {
        FinalityReceipt {
            tx_id: tx_id.clone(),
            notary: self.signer.identity().clone(),
            notarised_at: Utc::now(),
            signature: self.signer.sign(tx_id.0.as_bytes()),
        }
    }
}

#[async_trait]
impl<C: ClaimLedger> FinalityService for Notary<C> {
    fn identity(&self) -> &PartyName {
        self.signer.identity()
    }

    async fn notarise(&self, signed: &SignedProposal) -> Result<FinalityReceipt, FinalityError> {
        self.check(signed)?;

        let set = claim_set(&signed.proposal, &signed.tx_id)?;
        if set.claims.is_empty() {
            return Err(FinalityError::Invalid {
                reason: "transaction claims nothing".to_string(),
            });
        }

        match self.claims.claim_all(&set, &signed.tx_id).await? {
            ClaimOutcome::Claimed => {
                info!(tx_id = %signed.tx_id, claims = set.claims.len(), "Notarised transaction");
                Ok(self.receipt(&signed.tx_id))
            }
            ClaimOutcome::AlreadyClaimedBySelf => {
                info!(tx_id = %signed.tx_id, "Transaction already notarised, reissuing receipt");
                Ok(self.receipt(&signed.tx_id))
            }
            ClaimOutcome::Conflict { claim, holder } => {
                warn!(
                    tx_id = %signed.tx_id,
                    conflicting_tx = %holder,
                    claim = %claim,
                    "Rejected double spend"
                );
                Err(FinalityError::Conflict {
                    claim,
                    conflicting_tx: holder,
                })
            }
            ClaimOutcome::UnknownInput { output } => {
                warn!(tx_id = %signed.tx_id, output = %output, "Rejected unregistered input");
                Err(FinalityError::UnknownState { state: output })
            }
        }
    }
}
