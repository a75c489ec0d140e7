//! Transport to counterparty nodes
//!
//! [`HttpCounterpartyClient`] talks to remote nodes over their internal
//! routes. [`LocalCounterpartyNetwork`] routes to responders registered in the
//! same process and is what the multi-node tests run on.

use async_trait::async_trait;
use diamondchain_types::{FinalizedTransition, PartyName, SessionRequest, SessionResponse};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::directory::PartyDirectory;
use crate::error::{OrchestrationError, Result};
use crate::responder::ResponderService;

pub const SIGN_PATH: &str = "/internal/sessions/sign";
pub const FINALIZE_PATH: &str = "/internal/sessions/finalize";

#[async_trait]
pub trait CounterpartyClient: Send + Sync {
    /// Ask `party` to co-sign. A refusal is a normal response, not an error.
    async fn request_signature(
        &self,
        party: &PartyName,
        request: &SessionRequest,
    ) -> Result<SessionResponse>;

    /// Hand a committed transition to `party` for its vault.
    async fn deliver_finalized(
        &self,
        party: &PartyName,
        finalized: &FinalizedTransition,
    ) -> Result<()>;
}

pub struct HttpCounterpartyClient {
    directory: Arc<PartyDirectory>,
    http_client: reqwest::Client,
}

impl HttpCounterpartyClient {
    pub fn new(directory: Arc<PartyDirectory>) -> Self {
        Self {
            directory,
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, party: &PartyName, path: &str) -> Result<String> {
        let endpoint = self.directory.endpoint(party)?;
        Ok(format!("{}{}", endpoint.trim_end_matches('/'), path))
    }
}

#[async_trait]
impl CounterpartyClient for HttpCounterpartyClient {
    async fn request_signature(
        &self,
        party: &PartyName,
        request: &SessionRequest,
    ) -> Result<SessionResponse> {
        let url = self.url(party, SIGN_PATH)?;
        debug!(party = %party, session_id = %request.session_id, "Requesting countersignature");

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::NetworkError(format!("Failed to reach {}: {}", party, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Signing session with {} failed: status={} body={}", party, status, body);
            return Err(OrchestrationError::NetworkError(format!(
                "{} answered {}: {}",
                party, status, body
            )));
        }

        response.json().await.map_err(|e| {
            OrchestrationError::NetworkError(format!(
                "Invalid session response from {}: {}",
                party, e
            ))
        })
    }

    async fn deliver_finalized(
        &self,
        party: &PartyName,
        finalized: &FinalizedTransition,
    ) -> Result<()> {
        let url = self.url(party, FINALIZE_PATH)?;

        let response = self
            .http_client
            .post(&url)
            .json(finalized)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::NetworkError(format!("Failed to reach {}: {}", party, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::NetworkError(format!(
                "{} refused finalized transaction: {} {}",
                party, status, body
            )));
        }

        Ok(())
    }
}

/// In-process counterparty routing
#[derive(Default)]
pub struct LocalCounterpartyNetwork {
    responders: RwLock<HashMap<PartyName, Arc<ResponderService>>>,
    unresponsive: RwLock<HashSet<PartyName>>,
}

impl LocalCounterpartyNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a responder under its own identity. A party can only be
    /// registered once.
    pub async fn register(&self, responder: Arc<ResponderService>) -> Result<()> {
        let party = responder.identity().clone();
        let mut responders = self.responders.write().await;
        if responders.contains_key(&party) {
            warn!("Attempted to register duplicate responder {}, rejecting", party);
            return Err(OrchestrationError::InvalidState(
                party.to_string(),
                "responder already registered".to_string(),
            ));
        }
        responders.insert(party.clone(), responder);
        info!("Registered local responder {}", party);
        Ok(())
    }

    pub async fn unregister(&self, party: &PartyName) {
        if self.responders.write().await.remove(party).is_some() {
            info!("Unregistered local responder {}", party);
        }
    }

    /// Stop answering signing sessions for `party` without failing them.
    pub async fn set_unresponsive(&self, party: &PartyName, unresponsive: bool) {
        let mut set = self.unresponsive.write().await;
        if unresponsive {
            set.insert(party.clone());
        } else {
            set.remove(party);
        }
    }

    async fn responder(&self, party: &PartyName) -> Result<Arc<ResponderService>> {
        self.responders
            .read()
            .await
            .get(party)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownParty(party.clone()))
    }
}

#[async_trait]
impl CounterpartyClient for LocalCounterpartyNetwork {
    async fn request_signature(
        &self,
        party: &PartyName,
        request: &SessionRequest,
    ) -> Result<SessionResponse> {
        if self.unresponsive.read().await.contains(party) {
            debug!("Local responder {} is unresponsive, holding session open", party);
            std::future::pending::<()>().await;
        }
        let responder = self.responder(party).await?;
        Ok(responder.handle_sign(request).await)
    }

    async fn deliver_finalized(
        &self,
        party: &PartyName,
        finalized: &FinalizedTransition,
    ) -> Result<()> {
        let responder = self.responder(party).await?;
        responder.handle_finalize(finalized).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diamondchain_protocols::{Ed25519Signer, KeyRing};
    use diamondchain_storage::InMemoryVault;

    fn responder(name: &str) -> Arc<ResponderService> {
        Arc::new(ResponderService::new(
            Arc::new(Ed25519Signer::generate(PartyName::from(name))),
            Arc::new(KeyRing::new()),
            Arc::new(InMemoryVault::new()),
            PartyName::from("Notary"),
        ))
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let network = LocalCounterpartyNetwork::new();
        network.register(responder("P2")).await.unwrap();
        assert!(matches!(
            network.register(responder("P2")).await,
            Err(OrchestrationError::InvalidState(_, _))
        ));

        network.unregister(&PartyName::from("P2")).await;
        network.register(responder("P2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_party() {
        let network = LocalCounterpartyNetwork::new();
        assert!(matches!(
            network.responder(&PartyName::from("P9")).await,
            Err(OrchestrationError::UnknownParty(_))
        ));
    }

    #[test]
    fn test_http_url_uses_directory() {
        let directory = PartyDirectory::new(PartyName::from("P1"), PartyName::from("Notary"))
            .with_party(crate::directory::PartyEntry {
                name: PartyName::from("P2"),
                endpoint: Some("http://p2:8080/".to_string()),
                verifying_key: String::new(),
            });
        let client = HttpCounterpartyClient::new(Arc::new(directory));
        assert_eq!(
            client.url(&PartyName::from("P2"), SIGN_PATH).unwrap(),
            "http://p2:8080/internal/sessions/sign"
        );
        assert!(client.url(&PartyName::from("P3"), SIGN_PATH).is_err());
    }
}
