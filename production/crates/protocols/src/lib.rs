//! Ledger protocols for diamond lots
//!
//! - [`contract`]: the transition validator every party runs independently
//! - [`transitions`]: proposal builders for each intent
//! - [`signing`]: ed25519 signing capability and proposal digest

pub mod contract;
pub mod signing;
pub mod transitions;

pub use contract::{
    check_required_signers, validate, verify_proposal, ContractError, ValidationError, Violation,
};
pub use diamondchain_types::UnsupportedIntentError;
pub use signing::{
    compute_tx_id, record_digest, sign_proposal, verify_signatures, Ed25519Signer, KeyRing,
    SignatureVerifier, Signer, SigningError,
};
pub use transitions::{
    create_proposal, decision_proposal, required_signers, transfer_proposal, update_proposal,
};
