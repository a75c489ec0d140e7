//! Background health checker for counterparty nodes
//!
//! Periodically pings every remote party's `/health` endpoint and keeps the
//! latest latency and consecutive failure count per party.

use crate::error::{OrchestrationError, Result};
use diamondchain_types::PartyName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between health check runs (seconds)
const HEALTH_CHECK_INTERVAL_SECS: u64 = 15;

/// Timeout for health check requests (seconds)
const HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Maximum number of consecutive failures before marking a party unhealthy
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyHealth {
    pub party: PartyName,
    pub endpoint: String,
    pub is_healthy: bool,
    pub latency_ms: Option<u64>,
    pub last_check: chrono::DateTime<chrono::Utc>,
    pub consecutive_failures: u32,
}

pub struct HealthChecker {
    parties: Vec<(PartyName, String)>,
    interval: Duration,
    health_state: Arc<RwLock<HashMap<PartyName, PartyHealth>>>,
    shutdown: Arc<RwLock<bool>>,
}

impl HealthChecker {
    pub fn new(parties: Vec<(PartyName, String)>) -> Self {
        Self {
            parties,
            interval: Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS),
            health_state: Arc::new(RwLock::new(HashMap::new())),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn get_health_status(&self) -> HashMap<PartyName, PartyHealth> {
        self.health_state.read().await.clone()
    }

    pub async fn is_party_healthy(&self, party: &PartyName) -> bool {
        self.health_state
            .read()
            .await
            .get(party)
            .map(|h| h.is_healthy)
            .unwrap_or(false)
    }

    /// Start the health checker in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        info!(
            "Starting health checker for {} parties (interval: {:?})",
            self.parties.len(),
            self.interval
        );

        tokio::spawn(async move {
            match self.run().await {
                Ok(()) => {
                    info!("Health checker stopped normally");
                    Ok(())
                }
                Err(e) => {
                    warn!("Health checker error: {}", e);
                    Err(e)
                }
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                OrchestrationError::Internal(format!("Failed to create HTTP client: {}", e))
            })?;

        let mut interval = tokio::time::interval(self.interval);

        loop {
            if *self.shutdown.read().await {
                info!("Shutdown signal received, stopping health checker");
                return Ok(());
            }

            interval.tick().await;

            if self.parties.is_empty() {
                debug!("No remote parties configured, skipping health check");
                continue;
            }

            self.check_all(&client).await;
        }
    }

    async fn check_all(&self, client: &reqwest::Client) {
        let checks: Vec<_> = self
            .parties
            .iter()
            .map(|(party, endpoint)| {
                let client = client.clone();
                let party = party.clone();
                let endpoint = endpoint.clone();
                async move {
                    let start = Instant::now();
                    let health_url = format!("{}/health", endpoint.trim_end_matches('/'));

                    let outcome = match client.get(&health_url).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            Some(start.elapsed().as_millis() as u64)
                        }
                        Ok(resp) => {
                            warn!("Party {} health check failed: HTTP {}", party, resp.status());
                            None
                        }
                        Err(e) => {
                            warn!("Party {} health check failed: {}", party, e);
                            None
                        }
                    };
                    (party, endpoint, outcome)
                }
            })
            .collect();

        let results = futures::future::join_all(checks).await;

        let mut health_state = self.health_state.write().await;
        for (party, endpoint, latency_ms) in results {
            let previous_failures = health_state
                .get(&party)
                .map(|h| h.consecutive_failures)
                .unwrap_or(0);
            let consecutive_failures = if latency_ms.is_some() {
                0
            } else {
                previous_failures + 1
            };

            let health = PartyHealth {
                party: party.clone(),
                endpoint,
                is_healthy: latency_ms.is_some(),
                latency_ms,
                last_check: chrono::Utc::now(),
                consecutive_failures,
            };

            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                warn!(
                    "Party {} unreachable after {} consecutive failures",
                    party, consecutive_failures
                );
            } else if let Some(latency) = latency_ms {
                debug!("Party {} healthy (latency: {}ms)", party, latency);
            }

            health_state.insert(party, health);
        }
    }

    pub async fn shutdown(&self) {
        info!("Initiating health checker shutdown");
        *self.shutdown.write().await = true;
    }
}

/// Builder for HealthChecker
pub struct HealthCheckerBuilder {
    parties: Vec<(PartyName, String)>,
    interval: Option<Duration>,
}

impl HealthCheckerBuilder {
    pub fn new() -> Self {
        Self {
            parties: Vec::new(),
            interval: None,
        }
    }

    pub fn add_party(mut self, party: PartyName, endpoint: String) -> Self {
        self.parties.push((party, endpoint));
        self
    }

    pub fn with_directory(mut self, directory: &crate::directory::PartyDirectory) -> Self {
        self.parties = directory.endpoints();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<Arc<HealthChecker>> {
        let mut checker = HealthChecker::new(self.parties);
        if let Some(interval) = self.interval {
            checker.interval = interval;
        }
        Ok(Arc::new(checker))
    }
}

impl Default for HealthCheckerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
