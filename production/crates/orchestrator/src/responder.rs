//! Counterparty side of an orchestration attempt
//!
//! A responder never trusts the initiator: it recomputes the transaction id,
//! checks signatures, re-runs the validator and applies its own per-intent
//! checks before co-signing. Consumed versions must match what the local vault
//! holds as current. Finalized transitions are verified again before they are
//! recorded in the local vault.

use diamondchain_protocols::{
    compute_tx_id, verify_proposal, verify_signatures, SignatureVerifier, Signer,
};
use diamondchain_storage::Vault;
use diamondchain_types::{
    ApprovalStatus, FinalizedTransition, Intent, PartyName, Proposal, SessionRequest,
    SessionResponse, SignedProposal,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{OrchestrationError, Result};

pub struct ResponderService {
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn SignatureVerifier>,
    vault: Arc<dyn Vault>,
    notary: PartyName,
}

impl ResponderService {
    pub fn new(
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn SignatureVerifier>,
        vault: Arc<dyn Vault>,
        notary: PartyName,
    ) -> Self {
        Self {
            signer,
            verifier,
            vault,
            notary,
        }
    }

    pub fn identity(&self) -> &PartyName {
        self.signer.identity()
    }

    /// Co-sign the proposal or explain why not.
    pub async fn handle_sign(&self, request: &SessionRequest) -> SessionResponse {
        let signed = &request.signed;
        match self.check_proposal(signed).await {
            Ok(intent) => {
                info!(
                    session_id = %request.session_id,
                    tx_id = %signed.tx_id,
                    intent = %intent,
                    initiator = %signed.proposal.initiator,
                    "Co-signing transaction"
                );
                SessionResponse::Signed {
                    signature: self.signer.sign(signed.tx_id.0.as_bytes()),
                }
            }
            Err(reason) => {
                warn!(
                    session_id = %request.session_id,
                    tx_id = %signed.tx_id,
                    initiator = %signed.proposal.initiator,
                    reason = %reason,
                    "Refusing to sign transaction"
                );
                SessionResponse::Rejected { reason }
            }
        }
    }

    async fn check_proposal(&self, signed: &SignedProposal) -> std::result::Result<Intent, String> {
        let me = self.signer.identity();
        let proposal = &signed.proposal;

        let expected = compute_tx_id(proposal).map_err(|e| e.to_string())?;
        if expected != signed.tx_id {
            return Err("transaction id does not match proposal".to_string());
        }

        if !proposal.required_signers.contains(me) {
            return Err(format!("{} is not a required signer", me));
        }

        if !signed.signatures.contains_key(&proposal.initiator) {
            return Err("initiator signature is missing".to_string());
        }
        verify_signatures(signed, self.verifier.as_ref()).map_err(|e| e.to_string())?;

        let intent = verify_proposal(proposal).map_err(|e| e.to_string())?;
        check_protocol(intent, proposal)?;
        self.check_consumed_current(proposal).await?;
        Ok(intent)
    }

    /// A consumed version this party holds must be the one it holds as current.
    async fn check_consumed_current(&self, proposal: &Proposal) -> std::result::Result<(), String> {
        let me = self.signer.identity();
        for input in &proposal.consumed {
            let held = self
                .vault
                .find_current(input.state_ref.record_id, me)
                .await
                .map_err(|e| e.to_string())?;
            if !held.is_empty() && !held.contains(input) {
                return Err("consumed record is not the current version".to_string());
            }
        }
        Ok(())
    }

    /// Verify a committed transition and record it in the local vault.
    pub async fn handle_finalize(&self, finalized: &FinalizedTransition) -> Result<()> {
        let signed = &finalized.signed;
        let receipt = &finalized.receipt;
        let me = self.signer.identity();

        let involved = signed
            .proposal
            .produced
            .iter()
            .chain(signed.proposal.consumed.iter().map(|s| &s.record))
            .any(|r| r.participants().contains(me));
        if !involved {
            return Err(OrchestrationError::InvalidState(
                signed.tx_id.to_string(),
                format!("{} is not a participant", me),
            ));
        }

        verify_signatures(signed, self.verifier.as_ref())?;
        let missing = signed.missing_signers();
        if !missing.is_empty() {
            return Err(OrchestrationError::InvalidState(
                signed.tx_id.to_string(),
                format!("missing signatures from {:?}", missing),
            ));
        }

        if receipt.tx_id != signed.tx_id || receipt.notary != self.notary {
            return Err(OrchestrationError::InvalidState(
                signed.tx_id.to_string(),
                "receipt does not match transaction".to_string(),
            ));
        }
        self.verifier
            .verify(&receipt.notary, receipt.tx_id.0.as_bytes(), &receipt.signature)?;

        verify_proposal(&signed.proposal)?;

        self.vault.record_transition(finalized).await?;

        info!(
            tx_id = %signed.tx_id,
            record_id = ?signed.proposal.record_id(),
            "Recorded finalized transaction"
        );
        Ok(())
    }
}

/// Checks a responder applies on top of the validator.
fn check_protocol(intent: Intent, proposal: &Proposal) -> std::result::Result<(), String> {
    let initiator = &proposal.initiator;
    match intent {
        Intent::Create => {
            let output = proposal
                .produced
                .first()
                .ok_or_else(|| "a created record is required".to_string())?;
            if output.approval_status != ApprovalStatus::Pending {
                return Err("created record must be PENDING".to_string());
            }
            if &output.source != initiator {
                return Err("only the source may create a record".to_string());
            }
        }
        Intent::Approve | Intent::Decline => {
            let [input] = proposal.consumed.as_slice() else {
                return Err("exactly one record must be consumed".to_string());
            };
            if input.record.approval_status != ApprovalStatus::Pending {
                return Err("consumed record must be PENDING".to_string());
            }
            if input.record.approver.as_ref() != Some(initiator) {
                return Err("only the approver may decide".to_string());
            }
        }
        Intent::Transfer => {
            let [input] = proposal.consumed.as_slice() else {
                return Err("exactly one record must be consumed".to_string());
            };
            let approved = proposal
                .produced
                .first()
                .map(|r| r.approval_status == ApprovalStatus::Approved)
                .unwrap_or(false);
            if !approved {
                return Err("transferred record must be APPROVED".to_string());
            }
            if &input.record.owner != initiator {
                return Err("only the current owner may transfer".to_string());
            }
        }
        Intent::Update => {
            let [input] = proposal.consumed.as_slice() else {
                return Err("exactly one record must be consumed".to_string());
            };
            if &input.record.owner != initiator {
                return Err("only the current owner may update".to_string());
            }
        }
    }
    Ok(())
}
