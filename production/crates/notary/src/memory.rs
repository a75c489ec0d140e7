use async_trait::async_trait;
use diamondchain_protocols::{SignatureVerifier, Signer};
use diamondchain_types::TxId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::notary::{ClaimLedger, ClaimOutcome, ClaimSet, Notary};
use crate::FinalityError;

pub type InMemoryNotary = Notary<InMemoryClaims>;

#[derive(Debug, Default)]
struct Ledger {
    held: HashMap<String, TxId>,
    outputs: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct InMemoryClaims {
    ledger: Mutex<Ledger>,
}

impl InMemoryClaims {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimLedger for InMemoryClaims {
    async fn claim_all(&self, set: &ClaimSet, tx_id: &TxId) -> Result<ClaimOutcome, FinalityError> {
        let mut ledger = self.ledger.lock().await;

        for (output, digest) in &set.inputs {
            if ledger.outputs.get(output) != Some(digest) {
                return Ok(ClaimOutcome::UnknownInput {
                    output: output.clone(),
                });
            }
        }

        let mut ours = 0;
        for key in &set.claims {
            match ledger.held.get(key) {
                Some(holder) if holder == tx_id => ours += 1,
                Some(holder) => {
                    return Ok(ClaimOutcome::Conflict {
                        claim: key.clone(),
                        holder: holder.clone(),
                    });
                }
                None => {}
            }
        }
        if ours == set.claims.len() {
            return Ok(ClaimOutcome::AlreadyClaimedBySelf);
        }

        for key in &set.claims {
            ledger.held.insert(key.clone(), tx_id.clone());
        }
        for (output, digest) in &set.outputs {
            ledger.outputs.insert(output.clone(), digest.clone());
        }
        Ok(ClaimOutcome::Claimed)
    }
}

impl Notary<InMemoryClaims> {
    pub fn in_memory(signer: Arc<dyn Signer>, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Notary::new(signer, verifier, InMemoryClaims::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FinalityService;
    use chrono::Utc;
    use diamondchain_protocols::{
        create_proposal, decision_proposal, sign_proposal, transfer_proposal, Ed25519Signer,
        KeyRing,
    };
    use diamondchain_types::{NewAsset, PartyName, SignedProposal, StateAndRef, StateRef};
    use std::collections::BTreeSet;

    struct Parties {
        p1: Ed25519Signer,
        p2: Ed25519Signer,
        p3: Ed25519Signer,
        notary: InMemoryNotary,
        ring: Arc<KeyRing>,
    }

    fn parties() -> Parties {
        let p1 = Ed25519Signer::generate(PartyName::from("P1"));
        let p2 = Ed25519Signer::generate(PartyName::from("P2"));
        let p3 = Ed25519Signer::generate(PartyName::from("P3"));
        let notary_key = Ed25519Signer::generate(PartyName::from("Notary"));
        let mut ring = KeyRing::new();
        for s in [&p1, &p2, &p3, &notary_key] {
            ring.insert(s.identity().clone(), s.verifying_key());
        }
        let ring = Arc::new(ring);
        let notary = InMemoryNotary::in_memory(Arc::new(notary_key), ring.clone());
        Parties { p1, p2, p3, notary, ring }
    }

    fn created(parties: &Parties) -> SignedProposal {
        let proposal = create_proposal(
            PartyName::from("P1"),
            NewAsset {
                record_id: None,
                description: "2ct round".to_string(),
                carats: 2.0,
                cost: 10_000.0,
                percent_fee: 5.0,
                approver: PartyName::from("P2"),
            },
            Utc::now(),
        );
        let mut signed = sign_proposal(proposal, &parties.p1).unwrap();
        signed.add_signature(parties.p2.sign(signed.tx_id.0.as_bytes()));
        signed
    }

    fn output_of(signed: &SignedProposal) -> StateAndRef {
        let record = signed.proposal.produced[0].clone();
        StateAndRef {
            state_ref: StateRef {
                tx_id: signed.tx_id.clone(),
                record_id: record.record_id,
            },
            record,
        }
    }

    /// Create and approve a lot, notarising both steps.
    async fn approved(parties: &Parties) -> SignedProposal {
        let create = created(parties);
        parties.notary.notarise(&create).await.unwrap();

        let proposal =
            decision_proposal(PartyName::from("P2"), output_of(&create), true, Utc::now());
        let mut signed = sign_proposal(proposal, &parties.p2).unwrap();
        signed.add_signature(parties.p1.sign(signed.tx_id.0.as_bytes()));
        parties.notary.notarise(&signed).await.unwrap();
        signed
    }

    fn transfer_from(
        parties: &Parties,
        current: StateAndRef,
        to: &Ed25519Signer,
    ) -> SignedProposal {
        let proposal = transfer_proposal(
            PartyName::from("P1"),
            current,
            to.identity().clone(),
            Utc::now(),
        );
        let mut signed = sign_proposal(proposal, &parties.p1).unwrap();
        signed.add_signature(to.sign(signed.tx_id.0.as_bytes()));
        signed
    }

    #[tokio::test]
    async fn test_notarise_is_idempotent() {
        let parties = parties();
        let signed = created(&parties);

        let first = parties.notary.notarise(&signed).await.unwrap();
        let second = parties.notary.notarise(&signed).await.unwrap();
        assert_eq!(first.tx_id, second.tx_id);
        assert_eq!(first.notary, PartyName::from("Notary"));

        parties
            .ring
            .verify(&first.notary, first.tx_id.0.as_bytes(), &first.signature)
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_spend_of_same_state_conflicts() {
        let parties = parties();
        let approval = approved(&parties).await;

        let to_p3 = transfer_from(&parties, output_of(&approval), &parties.p3);
        let to_p2 = transfer_from(&parties, output_of(&approval), &parties.p2);

        parties.notary.notarise(&to_p3).await.unwrap();
        let err = parties.notary.notarise(&to_p2).await.unwrap_err();
        let record_id = approval.proposal.produced[0].record_id;
        assert_eq!(
            err,
            FinalityError::Conflict {
                claim: format!("state/{}/{}", record_id, approval.tx_id),
                conflicting_tx: to_p3.tx_id.clone(),
            }
        );
    }

    #[tokio::test]
    async fn test_fabricated_reference_cannot_respend() {
        let parties = parties();
        let approval = approved(&parties).await;
        let to_p3 = transfer_from(&parties, output_of(&approval), &parties.p3);
        parties.notary.notarise(&to_p3).await.unwrap();

        let mut fabricated = output_of(&approval);
        fabricated.state_ref.tx_id = "never-existed".into();
        let to_p2 = transfer_from(&parties, fabricated, &parties.p2);

        let record_id = approval.proposal.produced[0].record_id;
        assert_eq!(
            parties.notary.notarise(&to_p2).await.unwrap_err(),
            FinalityError::UnknownState {
                state: format!("output/{}/never-existed", record_id),
            }
        );
    }

    #[tokio::test]
    async fn test_altered_input_is_refused() {
        let parties = parties();
        let create = created(&parties);
        parties.notary.notarise(&create).await.unwrap();

        // The registered output is still PENDING; claiming it was approved
        // must not unlock a transfer.
        let mut forged = output_of(&create);
        forged.record = forged.record.with_approval_decision(true, Utc::now());
        let transfer = transfer_from(&parties, forged, &parties.p3);

        assert!(matches!(
            parties.notary.notarise(&transfer).await,
            Err(FinalityError::UnknownState { .. })
        ));
    }

    #[tokio::test]
    async fn test_signer_set_must_match_intent() {
        let parties = parties();
        let mut proposal = created(&parties).proposal;
        proposal.required_signers = BTreeSet::from([PartyName::from("P1")]);
        let signed = sign_proposal(proposal, &parties.p1).unwrap();

        match parties.notary.notarise(&signed).await {
            Err(FinalityError::Invalid { reason }) => {
                assert!(reason.contains("required signers"), "{}", reason)
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_transition_is_refused() {
        let parties = parties();
        let create = created(&parties);
        parties.notary.notarise(&create).await.unwrap();

        // Transferring a PENDING lot breaks the transition rules.
        let transfer = transfer_from(&parties, output_of(&create), &parties.p3);
        match parties.notary.notarise(&transfer).await {
            Err(FinalityError::Invalid { reason }) => {
                assert_eq!(reason, "approval status must be APPROVED")
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_signature_is_refused() {
        let parties = parties();
        let mut signed = created(&parties);
        signed.signatures.remove(&PartyName::from("P2"));
        let err = parties.notary.notarise(&signed).await.unwrap_err();
        assert_eq!(
            err,
            FinalityError::MissingSignatures { parties: vec![PartyName::from("P2")] }
        );
    }

    #[tokio::test]
    async fn test_tampered_transaction_is_invalid() {
        let parties = parties();
        let mut signed = created(&parties);
        signed.proposal.produced[0].cost = 1.0;
        assert!(matches!(
            parties.notary.notarise(&signed).await,
            Err(FinalityError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_reissuing_same_record_id_conflicts() {
        let parties = parties();
        let first = created(&parties);
        parties.notary.notarise(&first).await.unwrap();

        let mut again = first.proposal.clone();
        again.produced[0].description = "another lot".to_string();
        let mut signed = sign_proposal(again, &parties.p1).unwrap();
        signed.add_signature(parties.p2.sign(signed.tx_id.0.as_bytes()));

        assert!(matches!(
            parties.notary.notarise(&signed).await,
            Err(FinalityError::Conflict { .. })
        ));
    }
}
