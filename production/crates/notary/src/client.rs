//! HTTP client for a notary hosted by another node.

use async_trait::async_trait;
use diamondchain_types::{FinalityReceipt, PartyName, SignedProposal};
use std::time::Duration;
use tracing::debug;

use crate::{FinalityError, FinalityService};

pub const NOTARISE_PATH: &str = "/internal/notary/notarise";

pub struct HttpNotaryClient {
    identity: PartyName,
    api_base: String,
    client: reqwest::Client,
}

impl HttpNotaryClient {
    pub fn new(
        identity: PartyName,
        api_base: String,
        timeout: Duration,
    ) -> Result<Self, FinalityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FinalityError::Unavailable {
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            identity,
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl FinalityService for HttpNotaryClient {
    fn identity(&self) -> &PartyName {
        &self.identity
    }

    async fn notarise(&self, signed: &SignedProposal) -> Result<FinalityReceipt, FinalityError> {
        let url = format!("{}{}", self.api_base, NOTARISE_PATH);
        debug!(tx_id = %signed.tx_id, url = %url, "Submitting transaction to notary");

        let response = self
            .client
            .post(&url)
            .json(signed)
            .send()
            .await
            .map_err(|e| FinalityError::Unavailable { reason: e.to_string() })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            // The notary reports its refusal as a serialized FinalityError.
            return Err(serde_json::from_str::<FinalityError>(&body).unwrap_or(
                FinalityError::Unavailable {
                    reason: format!("notary returned {}: {}", status, body),
                },
            ));
        }

        response
            .json()
            .await
            .map_err(|e| FinalityError::Unavailable {
                reason: format!("Failed to parse receipt: {}", e),
            })
    }
}
