//! Ledger endpoints, mounted under `/api/idt`

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use diamondchain_types::{AttemptId, PartyName, StateAndRef};
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiError,
    handlers::ledger::{self, CreateAssetInput},
    state::AppState,
    ApiResult,
};

/// Query parameters of `PUT create`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuery {
    pub external_id: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub carats: f64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub percent: f64,
    pub approver: Option<String>,
}

/// Query parameters of `PUT transfer`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferQuery {
    pub external_id: String,
    pub new_owner_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    pub me: PartyName,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PartyName>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(whoami))
        .route("/diamonds", get(diamonds))
        .route("/peers", get(peers))
        .route("/create", put(create))
        .route("/approve/:id", get(approve))
        .route("/decline/:id", get(decline))
        .route("/transfer", put(transfer))
        .route("/attempts/:id", get(attempt))
}

/// GET /api/idt/me
async fn whoami(State(state): State<AppState>) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse {
        me: state.flow.identity().clone(),
    })
}

/// GET /api/idt/diamonds - current versions this node participates in
async fn diamonds(State(state): State<AppState>) -> ApiResult<Json<Vec<StateAndRef>>> {
    Ok(Json(state.flow.list_current_assets().await?))
}

/// GET /api/idt/peers
async fn peers(State(state): State<AppState>) -> Json<PeersResponse> {
    Json(PeersResponse {
        peers: state.flow.list_known_parties(),
    })
}

/// PUT /api/idt/create
async fn create(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
) -> ApiResult<(StatusCode, String)> {
    let asset = ledger::validate_create(
        &state.flow,
        CreateAssetInput {
            external_id: query.external_id,
            description: query.description,
            carats: query.carats,
            cost: query.cost,
            percent: query.percent,
            approver: query.approver,
        },
    )?;
    let msg = ledger::create_asset(&state.flow, asset).await?;
    Ok((StatusCode::CREATED, msg))
}

/// GET /api/idt/approve/:id
async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, String)> {
    let record_id = ledger::parse_record_id(&id)?;
    let msg = ledger::decide_approval(&state.flow, record_id, true).await?;
    Ok((StatusCode::CREATED, msg))
}

/// GET /api/idt/decline/:id
async fn decline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, String)> {
    let record_id = ledger::parse_record_id(&id)?;
    let msg = ledger::decide_approval(&state.flow, record_id, false).await?;
    Ok((StatusCode::CREATED, msg))
}

/// PUT /api/idt/transfer
async fn transfer(
    State(state): State<AppState>,
    Query(query): Query<TransferQuery>,
) -> ApiResult<(StatusCode, String)> {
    let record_id = ledger::parse_record_id(&query.external_id)?;
    let msg = ledger::transfer_ownership(&state.flow, record_id, &query.new_owner_name).await?;
    Ok((StatusCode::OK, msg))
}

/// GET /api/idt/attempts/:id - durable state of one attempt
async fn attempt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<diamondchain_types::Attempt>> {
    let id = uuid::Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("Attempt id '{}' is not a valid UUID.", id)))?;
    Ok(Json(state.flow.attempt(AttemptId(id)).await?))
}
