//! Diamond-lot ledger node
//!
//! Serves the ledger API for one party, answers signing sessions from other
//! nodes and optionally hosts the notary.

use anyhow::Result;
use diamondchain_api::{start_server, AppState};
use diamondchain_notary::{EtcdNotary, FinalityService, HttpNotaryClient, InMemoryNotary};
use diamondchain_orchestrator::{
    FlowServiceBuilder, HealthCheckerBuilder, HttpCounterpartyClient, OrchestrationConfig,
    PartyDirectory, PartyEntry, ResponderService, TimeoutMonitorBuilder,
};
use diamondchain_protocols::{Ed25519Signer, SignatureVerifier, Signer};
use diamondchain_storage::{
    AttemptStore, EtcdAttemptStore, InMemoryAttemptStore, InMemoryVault, PostgresVault, Vault,
};
use diamondchain_types::{PartyName, PostgresConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting diamond ledger node");

    let config = load_config()?;
    let signer = Arc::new(Ed25519Signer::from_hex_seed(
        config.node_name.clone(),
        &config.signing_seed,
    )?);

    let mut directory = PartyDirectory::new(config.node_name.clone(), config.notary_name.clone());
    directory.insert(PartyEntry {
        name: config.node_name.clone(),
        endpoint: None,
        verifying_key: signer.verifying_key_hex(),
    });
    for entry in config.parties.iter().cloned() {
        directory.insert(entry);
    }
    let directory = Arc::new(directory);
    let verifier: Arc<dyn SignatureVerifier> = Arc::new(directory.key_ring()?);
    info!(
        "Party directory loaded: {} known parties, notary {}",
        directory.known_parties().len(),
        directory.notary()
    );

    let vault: Arc<dyn Vault> = match &config.postgres_config {
        Some(pg) => {
            info!("Connecting to PostgreSQL at {}", mask_password(&pg.url));
            Arc::new(PostgresVault::new(pg).await?)
        }
        None => {
            warn!("POSTGRES_URL not set, vault is held in memory only");
            Arc::new(InMemoryVault::new())
        }
    };

    let attempts: Arc<dyn AttemptStore> = match &config.etcd_endpoints {
        Some(endpoints) => {
            info!("Connecting to etcd cluster: {:?}", endpoints);
            Arc::new(EtcdAttemptStore::new(endpoints.clone()).await?)
        }
        None => {
            warn!("ETCD_ENDPOINTS not set, attempts will not survive a restart");
            Arc::new(InMemoryAttemptStore::new())
        }
    };

    let hosted_notary: Option<Arc<dyn FinalityService>> = match &config.notary_seed {
        Some(seed) if config.host_notary => {
            let notary_signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::from_hex_seed(
                config.notary_name.clone(),
                seed,
            )?);
            let notary: Arc<dyn FinalityService> = match &config.etcd_endpoints {
                Some(endpoints) => {
                    let notary =
                        EtcdNotary::connect(endpoints.clone(), notary_signer, verifier.clone())
                            .await?;
                    Arc::new(notary)
                }
                None => {
                    Arc::new(InMemoryNotary::in_memory(notary_signer, verifier.clone()))
                }
            };
            info!("Hosting notary {}", config.notary_name);
            Some(notary)
        }
        None if config.host_notary => {
            anyhow::bail!("HOST_NOTARY requires NOTARY_SEED");
        }
        _ => None,
    };

    let finality: Arc<dyn FinalityService> = match (&hosted_notary, &config.notary_url) {
        (Some(notary), _) => notary.clone(),
        (None, Some(url)) => Arc::new(HttpNotaryClient::new(
            config.notary_name.clone(),
            url.clone(),
            config.orchestration.finality_timeout,
        )?),
        (None, None) => anyhow::bail!("NOTARY_URL is required unless HOST_NOTARY is set"),
    };

    let flow = FlowServiceBuilder::new()
        .with_config(config.orchestration.clone())
        .with_signer(signer.clone())
        .with_verifier(verifier.clone())
        .with_vault(vault.clone())
        .with_attempt_store(attempts)
        .with_finality(finality)
        .with_counterparties(Arc::new(HttpCounterpartyClient::new(directory.clone())))
        .with_directory(directory.clone())
        .build()?;
    let flow_handle = Arc::clone(&flow).start();

    let responder = Arc::new(ResponderService::new(
        signer,
        verifier,
        vault,
        config.notary_name.clone(),
    ));

    let health_checker = HealthCheckerBuilder::new()
        .with_directory(&directory)
        .build()?;
    let health_handle = Arc::clone(&health_checker).start();
    info!("Health checker started");

    let timeout_monitor = TimeoutMonitorBuilder::new()
        .with_config(config.orchestration.clone())
        .with_flow_service(Arc::clone(&flow))
        .build()?;
    let timeout_handle = Arc::clone(&timeout_monitor).start();
    info!("Timeout monitor started");

    let mut state = AppState::new(Arc::clone(&flow), responder)
        .with_health_checker(Arc::clone(&health_checker));
    if let Some(notary) = hosted_notary {
        state = state.with_hosted_notary(notary);
    }

    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("Server configuration:");
    info!("  Party: {}", config.node_name);
    info!("  Listen Address: {}", addr);
    info!("  Notary: {} (hosted: {})", config.notary_name, config.host_notary);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(state, addr).await {
            error!("Server error: {}", e);
        }
    });

    info!("Node running. Press Ctrl+C to shutdown.");
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    flow.shutdown().await;
    timeout_monitor.shutdown().await;
    health_checker.shutdown().await;

    let shutdown_timeout = Duration::from_secs(10);
    tokio::select! {
        _ = flow_handle => info!("Flow service stopped"),
        _ = tokio::time::sleep(shutdown_timeout) => warn!("Flow service shutdown timed out"),
    }
    tokio::select! {
        _ = timeout_handle => info!("Timeout monitor stopped"),
        _ = tokio::time::sleep(shutdown_timeout) => warn!("Timeout monitor shutdown timed out"),
    }
    tokio::select! {
        _ = health_handle => info!("Health checker stopped"),
        _ = tokio::time::sleep(shutdown_timeout) => warn!("Health checker shutdown timed out"),
    }

    server_handle.abort();
    info!("Shutdown complete");
    Ok(())
}

#[derive(Debug)]
struct Config {
    node_name: PartyName,
    listen_addr: String,
    signing_seed: String,
    parties: Vec<PartyEntry>,
    postgres_config: Option<PostgresConfig>,
    etcd_endpoints: Option<Vec<String>>,
    notary_name: PartyName,
    notary_url: Option<String>,
    notary_seed: Option<String>,
    host_notary: bool,
    orchestration: OrchestrationConfig,
}

fn load_config() -> Result<Config> {
    let node_name = std::env::var("NODE_NAME")
        .map_err(|_| anyhow::anyhow!("NODE_NAME environment variable is required"))?;

    let listen_addr =
        std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let signing_seed = std::env::var("SIGNING_SEED")
        .map_err(|_| anyhow::anyhow!("SIGNING_SEED environment variable is required"))?;

    let mut parties = parse_parties(&std::env::var("PARTIES").unwrap_or_default())?;

    let postgres_config = std::env::var("POSTGRES_URL").ok().map(|url| PostgresConfig {
        url,
        max_connections: 10,
        connect_timeout_secs: 30,
    });

    let etcd_endpoints = std::env::var("ETCD_ENDPOINTS").ok().map(|s| {
        s.split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>()
    });

    let notary_name =
        PartyName::from(std::env::var("NOTARY_NAME").unwrap_or_else(|_| "Notary".to_string()));

    let host_notary = std::env::var("HOST_NOTARY")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if let Ok(key) = std::env::var("NOTARY_KEY") {
        parties.push(PartyEntry {
            name: notary_name.clone(),
            endpoint: std::env::var("NOTARY_URL").ok(),
            verifying_key: key,
        });
    }

    let notary_seed = std::env::var("NOTARY_SEED").ok();
    if host_notary && !parties.iter().any(|p| p.name == notary_name) {
        // The hosted notary's key is derived from its seed.
        if let Some(seed) = &notary_seed {
            let notary = Ed25519Signer::from_hex_seed(notary_name.clone(), seed)?;
            parties.push(PartyEntry {
                name: notary_name.clone(),
                endpoint: None,
                verifying_key: notary.verifying_key_hex(),
            });
        }
    }

    let countersignature_timeout = std::env::var("COUNTERSIGNATURE_TIMEOUT_SECS")
        .ok()
        .map(|s| s.parse::<u64>())
        .transpose()?
        .map(Duration::from_secs);
    let mut orchestration = OrchestrationConfig::default();
    if let Some(timeout) = countersignature_timeout {
        orchestration.countersignature_timeout = timeout;
    }

    Ok(Config {
        node_name: PartyName::from(node_name),
        listen_addr,
        signing_seed,
        parties,
        postgres_config,
        etcd_endpoints,
        notary_name,
        notary_url: std::env::var("NOTARY_URL").ok(),
        notary_seed,
        host_notary,
        orchestration,
    })
}

/// `PARTIES` holds `name|endpoint|verifying_key_hex` entries separated by `;`.
/// Names may contain `=` and `,` (X.500 style).
fn parse_parties(raw: &str) -> Result<Vec<PartyEntry>> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split('|').map(str::trim).collect();
            match parts.as_slice() {
                [name, endpoint, key] if !name.is_empty() && !key.is_empty() => Ok(PartyEntry {
                    name: PartyName::from(*name),
                    endpoint: (!endpoint.is_empty()).then(|| endpoint.to_string()),
                    verifying_key: key.to_string(),
                }),
                _ => Err(anyhow::anyhow!("Invalid PARTIES entry: {}", entry)),
            }
        })
        .collect()
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "****");
            return masked;
        }
    }
    url.to_string()
}
