use async_trait::async_trait;
use diamondchain_protocols::{SignatureVerifier, Signer};
use diamondchain_types::TxId;
use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp, TxnOpResponse};
use std::sync::Arc;
use tracing::info;

use crate::notary::{ClaimLedger, ClaimOutcome, ClaimSet, Notary};
use crate::FinalityError;

const NOTARY_PREFIX: &str = "/notary/";

pub type EtcdNotary = Notary<EtcdClaims>;

/// Claims and registered outputs held in etcd; keys exist once their
/// transaction was accepted
pub struct EtcdClaims {
    client: Client,
}

impl EtcdClaims {
    pub async fn connect(endpoints: Vec<String>) -> Result<Self, FinalityError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| FinalityError::Unavailable {
                reason: format!("Failed to connect to etcd: {}", e),
            })?;

        info!("etcd notary claims connected");

        Ok(Self { client })
    }
}

fn full_key(key: &str) -> String {
    format!("{}{}", NOTARY_PREFIX, key)
}

fn stored_value(op: Option<&TxnOpResponse>) -> Option<String> {
    match op {
        Some(TxnOpResponse::Get(get)) => get
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()),
        _ => None,
    }
}

#[async_trait]
impl ClaimLedger for EtcdClaims {
    async fn claim_all(&self, set: &ClaimSet, tx_id: &TxId) -> Result<ClaimOutcome, FinalityError> {
        let mut compares: Vec<Compare> = set
            .claims
            .iter()
            .map(|k| Compare::create_revision(full_key(k), CompareOp::Equal, 0))
            .collect();
        compares.extend(set.inputs.iter().map(|(output, digest)| {
            Compare::value(full_key(output), CompareOp::Equal, digest.as_bytes())
        }));

        let mut puts: Vec<TxnOp> = set
            .claims
            .iter()
            .map(|k| TxnOp::put(full_key(k), tx_id.0.as_bytes(), None))
            .collect();
        puts.extend(
            set.outputs
                .iter()
                .map(|(output, digest)| TxnOp::put(full_key(output), digest.as_bytes(), None)),
        );

        let gets: Vec<TxnOp> = set
            .claims
            .iter()
            .chain(set.inputs.iter().map(|(output, _)| output))
            .map(|k| TxnOp::get(full_key(k), None))
            .collect();

        let txn = Txn::new().when(compares).and_then(puts).or_else(gets);

        let mut client = self.client.clone();
        let txn_resp = client.txn(txn).await.map_err(|e| FinalityError::Unavailable {
            reason: format!("Failed to claim states: {}", e),
        })?;

        if txn_resp.succeeded() {
            return Ok(ClaimOutcome::Claimed);
        }

        let responses = txn_resp.op_responses();
        let (claimed, inputs) = responses.split_at(set.claims.len().min(responses.len()));

        // Every claim of one transaction is written in a single txn, so either
        // all keys are ours or none are.
        let mut ours = 0;
        for (i, key) in set.claims.iter().enumerate() {
            match stored_value(claimed.get(i)).map(TxId) {
                Some(holder) if &holder == tx_id => ours += 1,
                Some(holder) => {
                    return Ok(ClaimOutcome::Conflict {
                        claim: key.clone(),
                        holder,
                    });
                }
                None => {}
            }
        }

        for (i, (output, digest)) in set.inputs.iter().enumerate() {
            if stored_value(inputs.get(i)).as_ref() != Some(digest) {
                return Ok(ClaimOutcome::UnknownInput {
                    output: output.clone(),
                });
            }
        }

        if ours == set.claims.len() {
            return Ok(ClaimOutcome::AlreadyClaimedBySelf);
        }
        Err(FinalityError::Unavailable {
            reason: format!("claims of {} changed concurrently, retry", tx_id),
        })
    }
}

impl Notary<EtcdClaims> {
    pub async fn connect(
        endpoints: Vec<String>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, FinalityError> {
        let claims = EtcdClaims::connect(endpoints).await?;
        Ok(Notary::new(signer, verifier, claims))
    }
}
