//! HTTP request layer for a diamond-lot ledger node
//!
//! - `/api/idt/*`: caller-facing ledger operations
//! - `/internal/*`: signing sessions, finalized deliveries and the hosted notary
//! - `/health`: liveness and peer health

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use state::AppState;

use axum::Router;
use std::net::SocketAddr;
use tracing::info;

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/idt", routes::ledger::routes())
        .nest("/internal", routes::internal::routes())
        .merge(routes::internal::health_routes())
        .with_state(state)
}

/// Serve the API until the task is aborted.
pub async fn start_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use diamondchain_notary::{FinalityService, InMemoryNotary};
    use diamondchain_orchestrator::{
        FlowServiceBuilder, LocalCounterpartyNetwork, OrchestrationConfig, PartyDirectory,
        PartyEntry, ResponderService,
    };
    use diamondchain_protocols::{Ed25519Signer, KeyRing, Signer};
    use diamondchain_storage::{InMemoryAttemptStore, InMemoryVault};
    use diamondchain_types::{PartyName, SessionRequest, SessionResponse, StateAndRef};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// One router per party over a shared in-process network. P1 hosts the notary.
    async fn nodes() -> HashMap<&'static str, Router> {
        let names = ["P1", "P2", "P3"];
        let signers: Vec<Arc<Ed25519Signer>> = names
            .iter()
            .map(|n| Arc::new(Ed25519Signer::generate(PartyName::from(*n))))
            .collect();
        let notary_signer = Arc::new(Ed25519Signer::generate(PartyName::from("Notary")));

        let mut ring = KeyRing::new();
        let mut entries = Vec::new();
        for signer in signers.iter().chain(std::iter::once(&notary_signer)) {
            ring.insert(signer.identity().clone(), signer.verifying_key());
            entries.push(PartyEntry {
                name: signer.identity().clone(),
                endpoint: None,
                verifying_key: signer.verifying_key_hex(),
            });
        }
        let ring = Arc::new(ring);
        let notary: Arc<dyn FinalityService> =
            Arc::new(InMemoryNotary::in_memory(notary_signer, ring.clone()));
        let transport = Arc::new(LocalCounterpartyNetwork::new());

        let mut routers = HashMap::new();
        for (name, signer) in names.iter().zip(signers) {
            let vault = Arc::new(InMemoryVault::new());
            let mut directory =
                PartyDirectory::new(PartyName::from(*name), PartyName::from("Notary"));
            for entry in &entries {
                directory.insert(entry.clone());
            }

            let responder = Arc::new(ResponderService::new(
                signer.clone(),
                ring.clone(),
                vault.clone(),
                PartyName::from("Notary"),
            ));
            transport.register(responder.clone()).await.unwrap();

            let flow = FlowServiceBuilder::new()
                .with_config(OrchestrationConfig::default())
                .with_signer(signer)
                .with_verifier(ring.clone())
                .with_vault(vault)
                .with_attempt_store(Arc::new(InMemoryAttemptStore::new()))
                .with_finality(notary.clone())
                .with_counterparties(transport.clone())
                .with_directory(Arc::new(directory))
                .build()
                .unwrap();

            let mut state = AppState::new(flow, responder);
            if *name == "P1" {
                state = state.with_hosted_notary(notary.clone());
            }
            routers.insert(*name, router(state));
        }
        routers
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).to_string()
    }

    #[tokio::test]
    async fn test_me_and_peers() {
        let nodes = nodes().await;
        let (status, body) = send(&nodes["P1"], "GET", "/api/idt/me").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["me"], "P1");

        let (_, body) = send(&nodes["P1"], "GET", "/api/idt/peers").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["peers"], serde_json::json!(["P2", "P3"]));
    }

    #[tokio::test]
    async fn test_create_input_checks() {
        let nodes = nodes().await;
        let p1 = &nodes["P1"];

        let (status, body) = send(
            p1,
            "PUT",
            "/api/idt/create?description=x&carats=1&cost=0&percent=1&approver=P2",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&body), "Query parameter 'cost' must be greater than zero.");

        let (status, body) =
            send(p1, "PUT", "/api/idt/create?description=x&carats=1&cost=5&percent=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text(&body).contains("'approver' missing"));

        let (status, body) = send(
            p1,
            "PUT",
            "/api/idt/create?description=x&carats=1&cost=5&percent=1&approver=P9",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&body), "Party named P9 cannot be found.");

        let (status, _) = send(
            p1,
            "PUT",
            "/api/idt/create?externalId=not-a-uuid&carats=1&cost=5&percent=1&approver=P2",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_rejects_non_finite_amounts() {
        let nodes = nodes().await;
        let p1 = &nodes["P1"];

        for (query, field) in [
            ("carats=1&cost=NaN&percent=1", "cost"),
            ("carats=1&cost=5&percent=inf", "percent"),
            ("carats=-inf&cost=5&percent=1", "carats"),
        ] {
            let uri = format!("/api/idt/create?description=x&{}&approver=P2", query);
            let (status, body) = send(p1, "PUT", &uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(
                text(&body),
                format!("Query parameter '{}' must be greater than zero.", field)
            );
        }
    }

    #[tokio::test]
    async fn test_create_approve_transfer_over_http() {
        let nodes = nodes().await;
        let id = uuid::Uuid::new_v4();

        let (status, body) = send(
            &nodes["P1"],
            "PUT",
            &format!(
                "/api/idt/create?externalId={}&description=2ct%20round\
                 &carats=2&cost=10000&percent=5&approver=P2",
                id
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", text(&body));
        let msg = text(&body);
        assert!(msg.starts_with("Transaction id "));
        assert!(msg.ends_with(" committed to ledger.\n"));

        let (status, body) = send(&nodes["P2"], "GET", "/api/idt/diamonds").await;
        assert_eq!(status, StatusCode::OK);
        let states: Vec<StateAndRef> = serde_json::from_slice(&body).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].record.record_id.0, id);
        assert_eq!(states[0].record.box_value, 10005.0);

        let (status, _) = send(&nodes["P2"], "GET", &format!("/api/idt/approve/{}", id)).await;
        assert_eq!(status, StatusCode::CREATED);

        // A second decision is refused by the validator.
        let (status, body) = send(&nodes["P2"], "GET", &format!("/api/idt/decline/{}", id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&body), "previous approval status must be PENDING");

        let (status, _) = send(
            &nodes["P1"],
            "PUT",
            &format!("/api/idt/transfer?externalId={}&newOwnerName=P3", id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&nodes["P3"], "GET", "/api/idt/diamonds").await;
        let states: Vec<StateAndRef> = serde_json::from_slice(&body).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].record.owner, PartyName::from("P3"));
    }

    #[tokio::test]
    async fn test_invalid_record_id() {
        let nodes = nodes().await;
        let (status, body) = send(&nodes["P2"], "GET", "/api/idt/approve/42").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text(&body).contains("not a valid UUID"));
    }

    fn initiator_signed() -> diamondchain_types::SignedProposal {
        let p1 = Ed25519Signer::generate(PartyName::from("P1"));
        let asset = diamondchain_types::NewAsset {
            record_id: None,
            description: "x".to_string(),
            carats: 1.0,
            cost: 1.0,
            percent_fee: 1.0,
            approver: PartyName::from("P2"),
        };
        let proposal = diamondchain_protocols::create_proposal(
            PartyName::from("P1"),
            asset,
            chrono::Utc::now(),
        );
        diamondchain_protocols::sign_proposal(proposal, &p1).unwrap()
    }

    async fn post_json(app: &Router, uri: &str, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_notary_route_only_on_hosting_node() {
        let nodes = nodes().await;
        let body = serde_json::to_vec(&initiator_signed()).unwrap();

        let (status, _) = post_json(&nodes["P2"], "/internal/notary/notarise", body.clone()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // The approver has not signed yet.
        let (status, body) = post_json(&nodes["P1"], "/internal/notary/notarise", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: diamondchain_notary::FinalityError = serde_json::from_slice(&body).unwrap();
        assert!(matches!(
            err,
            diamondchain_notary::FinalityError::MissingSignatures { .. }
        ));
    }

    #[tokio::test]
    async fn test_sign_route_refuses_tampered_proposal() {
        let nodes = nodes().await;
        let mut signed = initiator_signed();
        signed.proposal.produced[0].cost = 2.0;
        let request = SessionRequest {
            session_id: uuid::Uuid::new_v4(),
            signed,
        };

        let (status, body) = post_json(
            &nodes["P2"],
            "/internal/sessions/sign",
            serde_json::to_vec(&request).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: SessionResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            response,
            SessionResponse::Rejected {
                reason: "transaction id does not match proposal".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_health() {
        let nodes = nodes().await;
        let (status, body) = send(&nodes["P3"], "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["party"], "P3");
        assert_eq!(json["status"], "healthy");
    }
}
