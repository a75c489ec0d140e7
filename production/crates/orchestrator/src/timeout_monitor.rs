//! Timeout monitoring for signing sessions.
//!
//! Rejects attempts that sit in AWAITING_COUNTERSIGNATURES longer than the
//! countersignature timeout while no task in this process is driving them.

use crate::config::OrchestrationConfig;
use crate::error::{OrchestrationError, Result};
use crate::service::FlowService;
use chrono::Utc;
use diamondchain_types::{Attempt, AttemptState};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Timeout monitoring service.
pub struct TimeoutMonitor {
    config: OrchestrationConfig,
    flow: Arc<FlowService>,
    shutdown: Arc<RwLock<bool>>,
}

impl TimeoutMonitor {
    /// Start the timeout monitor in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            info!(
                "Timeout monitor started (interval: {:?}, countersignature timeout: {:?})",
                self.config.timeout_check_interval, self.config.countersignature_timeout
            );

            match self.run().await {
                Ok(()) => {
                    info!("Timeout monitor stopped normally");
                    Ok(())
                }
                Err(e) => {
                    error!("Timeout monitor error: {}", e);
                    Err(e)
                }
            }
        })
    }

    /// Main monitoring loop
    async fn run(&self) -> Result<()> {
        let mut interval = interval(self.config.timeout_check_interval);

        loop {
            if *self.shutdown.read().await {
                info!("Shutdown signal received, stopping timeout monitor");
                return Ok(());
            }

            interval.tick().await;

            if let Err(e) = self.check_countersignature_timeouts().await {
                error!("Error checking countersignature timeouts: {}", e);
            }
        }
    }

    /// Reject every stale signing session. Returns how many were rejected.
    pub async fn check_countersignature_timeouts(&self) -> Result<usize> {
        let limit = chrono::Duration::from_std(self.config.countersignature_timeout)
            .map_err(|e| OrchestrationError::Config(format!("invalid timeout: {}", e)))?;
        let now = Utc::now();

        let incomplete = self.flow.attempt_store().list_incomplete().await?;
        let mut rejected = 0;

        for attempt in incomplete {
            if attempt.initiator != *self.flow.identity()
                || attempt.state != AttemptState::AwaitingCountersignatures
            {
                continue;
            }
            let elapsed = now - attempt.updated_at;
            if elapsed <= limit || self.flow.is_live(attempt.id).await {
                continue;
            }
            let Some(err) = self.timeout_error(&attempt) else {
                debug!(attempt_id = %attempt.id, "No signer outstanding, leaving attempt");
                continue;
            };

            warn!(
                attempt_id = %attempt.id,
                elapsed_secs = elapsed.num_seconds(),
                "Countersignature timeout"
            );
            if self
                .flow
                .reject_detached(attempt.id, AttemptState::AwaitingCountersignatures, &err)
                .await?
            {
                rejected += 1;
            }
        }

        Ok(rejected)
    }

    fn timeout_error(&self, attempt: &Attempt) -> Option<OrchestrationError> {
        let signed = attempt.signed.as_ref()?;
        let party = signed
            .missing_signers()
            .into_iter()
            .find(|p| p != self.flow.identity())?;
        Some(OrchestrationError::CounterpartyTimeout {
            party,
            after: self.config.countersignature_timeout,
        })
    }

    /// Initiate graceful shutdown
    pub async fn shutdown(&self) {
        info!("Initiating timeout monitor shutdown");
        *self.shutdown.write().await = true;
    }
}

/// Builder for TimeoutMonitor
pub struct TimeoutMonitorBuilder {
    config: Option<OrchestrationConfig>,
    flow: Option<Arc<FlowService>>,
}

impl TimeoutMonitorBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            flow: None,
        }
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_flow_service(mut self, flow: Arc<FlowService>) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn build(self) -> Result<Arc<TimeoutMonitor>> {
        let flow = self
            .flow
            .ok_or_else(|| OrchestrationError::Config("FlowService is required".to_string()))?;
        let config = self.config.unwrap_or_else(|| flow.config().clone());

        Ok(Arc::new(TimeoutMonitor {
            config,
            flow,
            shutdown: Arc::new(RwLock::new(false)),
        }))
    }
}

impl Default for TimeoutMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counterparty::LocalCounterpartyNetwork;
    use crate::directory::{PartyDirectory, PartyEntry};
    use crate::service::FlowServiceBuilder;
    use async_trait::async_trait;
    use diamondchain_notary::InMemoryNotary;
    use diamondchain_protocols::{
        create_proposal, sign_proposal, Ed25519Signer, KeyRing, Signer,
    };
    use diamondchain_storage::{AttemptStore, InMemoryAttemptStore, InMemoryVault};
    use diamondchain_types::{AttemptId, FlowRequest, NewAsset, PartyName, RejectionKind};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        flow: Arc<FlowService>,
        attempts: Arc<InMemoryAttemptStore>,
        p1: Arc<Ed25519Signer>,
    }

    fn flow_over(p1: Arc<Ed25519Signer>, attempts: Arc<dyn AttemptStore>) -> Arc<FlowService> {
        let p2 = Ed25519Signer::generate(PartyName::from("P2"));
        let notary = Arc::new(Ed25519Signer::generate(PartyName::from("Notary")));

        let mut ring = KeyRing::new();
        let mut directory = PartyDirectory::new(PartyName::from("P1"), PartyName::from("Notary"));
        for signer in [p1.as_ref(), &p2, notary.as_ref()] {
            ring.insert(signer.identity().clone(), signer.verifying_key());
            directory.insert(PartyEntry {
                name: signer.identity().clone(),
                endpoint: None,
                verifying_key: signer.verifying_key_hex(),
            });
        }
        let ring = Arc::new(ring);

        let config = OrchestrationConfig {
            countersignature_timeout: Duration::from_secs(60),
            ..OrchestrationConfig::default()
        };
        FlowServiceBuilder::new()
            .with_config(config)
            .with_signer(p1)
            .with_verifier(ring.clone())
            .with_vault(Arc::new(InMemoryVault::new()))
            .with_attempt_store(attempts)
            .with_finality(Arc::new(InMemoryNotary::in_memory(notary, ring)))
            .with_counterparties(Arc::new(LocalCounterpartyNetwork::new()))
            .with_directory(Arc::new(directory))
            .build()
            .unwrap()
    }

    fn harness() -> Harness {
        let p1 = Arc::new(Ed25519Signer::generate(PartyName::from("P1")));
        let attempts = Arc::new(InMemoryAttemptStore::new());
        let flow = flow_over(p1.clone(), attempts.clone());
        Harness { flow, attempts, p1 }
    }

    /// Attempt store whose `load` waits until the test lets it through.
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryAttemptStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl AttemptStore for GatedStore {
        async fn save(&self, attempt: &Attempt) -> diamondchain_types::Result<()> {
            self.inner.save(attempt).await
        }

        async fn load(&self, id: AttemptId) -> diamondchain_types::Result<Option<Attempt>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.load(id).await
        }

        async fn list_incomplete(&self) -> diamondchain_types::Result<Vec<Attempt>> {
            self.inner.list_incomplete().await
        }
    }

    fn awaiting(p1: &Ed25519Signer, age: chrono::Duration) -> Attempt {
        let asset = NewAsset {
            record_id: None,
            description: "2.1ct round".to_string(),
            carats: 2.1,
            cost: 1000.0,
            percent_fee: 10.0,
            approver: PartyName::from("P2"),
        };
        let proposal = create_proposal(PartyName::from("P1"), asset.clone(), Utc::now());
        let mut attempt = Attempt::new(PartyName::from("P1"), FlowRequest::Create { asset });
        attempt.signed = Some(sign_proposal(proposal, p1).unwrap());
        attempt.state = AttemptState::AwaitingCountersignatures;
        attempt.updated_at = Utc::now() - age;
        attempt
    }

    #[tokio::test]
    async fn test_stale_session_is_rejected() {
        let h = harness();
        let stale = awaiting(&h.p1, chrono::Duration::seconds(120));
        let fresh = awaiting(&h.p1, chrono::Duration::seconds(5));
        h.attempts.save(&stale).await.unwrap();
        h.attempts.save(&fresh).await.unwrap();

        let monitor = TimeoutMonitorBuilder::new()
            .with_flow_service(h.flow.clone())
            .build()
            .unwrap();
        assert_eq!(monitor.check_countersignature_timeouts().await.unwrap(), 1);

        let stale = h.flow.attempt(stale.id).await.unwrap();
        assert_eq!(stale.state, AttemptState::Rejected);
        let rejection = stale.rejection.unwrap();
        assert_eq!(rejection.kind, RejectionKind::CounterpartyTimeout);
        assert!(rejection.reason.contains("P2"));

        let fresh = h.flow.attempt(fresh.id).await.unwrap();
        assert_eq!(fresh.state, AttemptState::AwaitingCountersignatures);

        // A second scan finds nothing new.
        assert_eq!(monitor.check_countersignature_timeouts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_detached_rejection_reserves_without_blocking() {
        let p1 = Arc::new(Ed25519Signer::generate(PartyName::from("P1")));
        let store = Arc::new(GatedStore::default());
        let flow = flow_over(p1.clone(), store.clone());
        let attempt = awaiting(&p1, chrono::Duration::seconds(120));
        store.inner.save(&attempt).await.unwrap();
        let id = attempt.id;

        let timeout = || OrchestrationError::CounterpartyTimeout {
            party: PartyName::from("P2"),
            after: Duration::from_secs(60),
        };
        let rejecting = {
            let flow = flow.clone();
            let err = timeout();
            tokio::spawn(async move {
                flow.reject_detached(id, AttemptState::AwaitingCountersignatures, &err)
                    .await
            })
        };
        store.entered.notified().await;

        // While the store is read the id is reserved but readers are not held up.
        let live = tokio::time::timeout(Duration::from_secs(1), flow.is_live(id))
            .await
            .expect("live set stayed locked during store I/O");
        assert!(live);
        assert!(!flow
            .reject_detached(id, AttemptState::AwaitingCountersignatures, &timeout())
            .await
            .unwrap());

        store.release.notify_one();
        assert!(rejecting.await.unwrap().unwrap());
        assert!(!flow.is_live(id).await);
        let stored = store.inner.load(id).await.unwrap().unwrap();
        assert_eq!(stored.state, AttemptState::Rejected);
    }

    #[test]
    fn test_builder_requires_flow_service() {
        assert!(matches!(
            TimeoutMonitorBuilder::new().build(),
            Err(OrchestrationError::Config(_))
        ));
    }
}
