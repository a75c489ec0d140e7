//! Internal API routes for node-to-node communication

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use diamondchain_orchestrator::PartyHealth;
use diamondchain_types::{
    FinalityReceipt, FinalizedTransition, PartyName, SessionRequest, SessionResponse,
    SignedProposal,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{handlers::internal, state::AppState, ApiResult};

/// Node health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub party: PartyName,
    /// Last known state of each remote party, when health checking is on
    #[serde(default)]
    pub peers: HashMap<PartyName, PartyHealth>,
}

/// Create internal routes, mounted under `/internal`
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/sign", post(sign))
        .route("/sessions/finalize", post(finalize))
        .route("/notary/notarise", post(notarise))
}

/// Liveness route served at the root
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// POST /internal/sessions/sign
async fn sign(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Json<SessionResponse> {
    Json(internal::sign(&state.responder, &request).await)
}

/// POST /internal/sessions/finalize
async fn finalize(
    State(state): State<AppState>,
    Json(finalized): Json<FinalizedTransition>,
) -> ApiResult<Json<&'static str>> {
    internal::finalize(&state.responder, &finalized).await?;
    Ok(Json("Finalized transaction recorded"))
}

/// POST /internal/notary/notarise
async fn notarise(
    State(state): State<AppState>,
    Json(signed): Json<SignedProposal>,
) -> ApiResult<Json<FinalityReceipt>> {
    let receipt = internal::notarise(state.hosted_notary.as_deref(), &signed).await?;
    Ok(Json(receipt))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let peers = match &state.health {
        Some(checker) => checker.get_health_status().await,
        None => HashMap::new(),
    };
    Json(HealthResponse {
        status: "healthy".to_string(),
        party: state.flow.identity().clone(),
        peers,
    })
}
