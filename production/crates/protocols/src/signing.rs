//! Signing capability
//!
//! Parties sign the transition id (the proposal digest) with ed25519 keys.
//! Verification goes through a [`KeyRing`] holding every known party's
//! verifying key.

use diamondchain_types::{AssetRecord, PartyName, Proposal, Signature, SignedProposal, TxId};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("Unknown party: {0}")]
    UnknownParty(PartyName),

    #[error("Invalid signature from {0}")]
    InvalidSignature(PartyName),

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Transaction id mismatch: expected {expected}, got {actual}")]
    TxIdMismatch { expected: TxId, actual: TxId },
}

/// Holder of one party's private signing capability
pub trait Signer: Send + Sync {
    fn identity(&self) -> &PartyName;

    fn sign(&self, message: &[u8]) -> Signature;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        party: &PartyName,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), SigningError>;
}

pub struct Ed25519Signer {
    identity: PartyName,
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(identity: PartyName, seed: &[u8; 32]) -> Self {
        Self {
            identity,
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex_seed(identity: PartyName, seed_hex: &str) -> Result<Self, SigningError> {
        let seed = decode_key_bytes(seed_hex)?;
        Ok(Self::from_seed(identity, &seed))
    }

    pub fn generate(identity: PartyName) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(identity, &seed)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn identity(&self) -> &PartyName {
        &self.identity
    }

    fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            by: self.identity.clone(),
            bytes: self.key.sign(message).to_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("identity", &self.identity)
            .field("verifying_key", &self.verifying_key_hex())
            .finish()
    }
}

/// Verifying keys of known parties
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<PartyName, VerifyingKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, party: PartyName, key: VerifyingKey) {
        self.keys.insert(party, key);
    }

    pub fn insert_hex(&mut self, party: PartyName, key_hex: &str) -> Result<(), SigningError> {
        let bytes = decode_key_bytes(key_hex)?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SigningError::MalformedKey(format!("{}: {}", party, e)))?;
        self.keys.insert(party, key);
        Ok(())
    }

    pub fn contains(&self, party: &PartyName) -> bool {
        self.keys.contains_key(party)
    }
}

impl SignatureVerifier for KeyRing {
    fn verify(
        &self,
        party: &PartyName,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), SigningError> {
        let key = self
            .keys
            .get(party)
            .ok_or_else(|| SigningError::UnknownParty(party.clone()))?;

        if &signature.by != party {
            return Err(SigningError::InvalidSignature(party.clone()));
        }

        let sig = ed25519_dalek::Signature::from_slice(&signature.bytes)
            .map_err(|_| SigningError::InvalidSignature(party.clone()))?;

        key.verify(message, &sig).map_err(|_| {
            warn!(party = %party, "Signature verification failed");
            SigningError::InvalidSignature(party.clone())
        })
    }
}

fn decode_key_bytes(key_hex: &str) -> Result<[u8; 32], SigningError> {
    let bytes = hex::decode(key_hex.trim())
        .map_err(|e| SigningError::MalformedKey(format!("invalid hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| SigningError::MalformedKey("expected 32 bytes".to_string()))
}

/// Transition id: lowercase hex SHA-256 of the canonical JSON encoding.
pub fn compute_tx_id(proposal: &Proposal) -> Result<TxId, SigningError> {
    let encoded =
        serde_json::to_vec(proposal).map_err(|e| SigningError::Encoding(e.to_string()))?;
    Ok(TxId(hex::encode(Sha256::digest(&encoded))))
}

/// Digest of one record version, encoded the same way as [`compute_tx_id`].
pub fn record_digest(record: &AssetRecord) -> Result<String, SigningError> {
    let encoded = serde_json::to_vec(record).map_err(|e| SigningError::Encoding(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Digest the proposal and attach the signer's signature.
pub fn sign_proposal(
    proposal: Proposal,
    signer: &dyn Signer,
) -> Result<SignedProposal, SigningError> {
    let tx_id = compute_tx_id(&proposal)?;
    let signature = signer.sign(tx_id.0.as_bytes());
    let mut signatures = BTreeMap::new();
    signatures.insert(signature.by.clone(), signature);
    Ok(SignedProposal {
        tx_id,
        proposal,
        signatures,
    })
}

/// Check the id matches the proposal and every attached signature is valid.
pub fn verify_signatures(
    signed: &SignedProposal,
    verifier: &dyn SignatureVerifier,
) -> Result<(), SigningError> {
    let expected = compute_tx_id(&signed.proposal)?;
    if expected != signed.tx_id {
        return Err(SigningError::TxIdMismatch {
            expected,
            actual: signed.tx_id.clone(),
        });
    }
    for (party, signature) in &signed.signatures {
        verifier.verify(party, signed.tx_id.0.as_bytes(), signature)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use diamondchain_types::{Intent, NewAsset};

    fn proposal() -> Proposal {
        let record = AssetRecord::issue(
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
        Proposal {
            intent: Intent::Create.into(),
            initiator: PartyName::from("P1"),
            consumed: vec![],
            produced: vec![record],
            required_signers: ["P1", "P2"].into_iter().map(PartyName::from).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_digest_tracks_content() {
        let record = proposal().produced.remove(0);
        let digest = record_digest(&record).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(record_digest(&record.clone()).unwrap(), digest);

        let approved = record.with_approval_decision(true, Utc::now());
        assert_ne!(record_digest(&approved).unwrap(), digest);
    }

    #[test]
    fn test_tx_id_is_stable() {
        let p = proposal();
        let a = compute_tx_id(&p).unwrap();
        let b = compute_tx_id(&p.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 64);
    }

    #[test]
    fn test_sign_and_verify() {
        let p1 = Ed25519Signer::generate(PartyName::from("P1"));
        let p2 = Ed25519Signer::generate(PartyName::from("P2"));
        let mut ring = KeyRing::new();
        ring.insert(PartyName::from("P1"), p1.verifying_key());
        ring.insert_hex(PartyName::from("P2"), &p2.verifying_key_hex()).unwrap();

        let mut signed = sign_proposal(proposal(), &p1).unwrap();
        signed.add_signature(p2.sign(signed.tx_id.0.as_bytes()));
        assert!(verify_signatures(&signed, &ring).is_ok());
        assert!(signed.is_fully_signed());
    }

    #[test]
    fn test_tampered_proposal_is_detected() {
        let p1 = Ed25519Signer::generate(PartyName::from("P1"));
        let mut ring = KeyRing::new();
        ring.insert(PartyName::from("P1"), p1.verifying_key());

        let mut signed = sign_proposal(proposal(), &p1).unwrap();
        signed.proposal.produced[0].cost = 1.0;
        assert!(matches!(
            verify_signatures(&signed, &ring),
            Err(SigningError::TxIdMismatch { .. })
        ));
    }

    #[test]
    fn test_signature_from_wrong_key() {
        let p1 = Ed25519Signer::generate(PartyName::from("P1"));
        let impostor = Ed25519Signer::generate(PartyName::from("P1"));
        let mut ring = KeyRing::new();
        ring.insert(PartyName::from("P1"), p1.verifying_key());

        let signed = sign_proposal(proposal(), &impostor).unwrap();
        assert_eq!(
            verify_signatures(&signed, &ring),
            Err(SigningError::InvalidSignature(PartyName::from("P1")))
        );
    }

    #[test]
    fn test_unknown_party() {
        let p3 = Ed25519Signer::generate(PartyName::from("P3"));
        let ring = KeyRing::new();
        let signed = sign_proposal(proposal(), &p3).unwrap();
        assert_eq!(
            verify_signatures(&signed, &ring),
            Err(SigningError::UnknownParty(PartyName::from("P3")))
        );
    }

    #[test]
    fn test_hex_seed() {
        let seed = hex::encode([7u8; 32]);
        let a = Ed25519Signer::from_hex_seed(PartyName::from("P1"), &seed).unwrap();
        let b = Ed25519Signer::from_seed(PartyName::from("P1"), &[7u8; 32]);
        assert_eq!(a.verifying_key_hex(), b.verifying_key_hex());
        assert!(Ed25519Signer::from_hex_seed(PartyName::from("P1"), "abcd").is_err());
    }
}
