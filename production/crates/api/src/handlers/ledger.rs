//! Ledger business logic: input checks and flow invocation

use diamondchain_orchestrator::{Committed, FlowService};
use diamondchain_types::{NewAsset, PartyName, RecordId};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::ApiError;

/// Caller input for a new lot, before validation
#[derive(Debug, Default, Clone)]
pub struct CreateAssetInput {
    pub external_id: Option<String>,
    pub description: Option<String>,
    pub carats: f64,
    pub cost: f64,
    pub percent: f64,
    pub approver: Option<String>,
}

pub fn parse_record_id(id: &str) -> Result<RecordId, ApiError> {
    RecordId::parse(id)
        .map_err(|_| ApiError::BadRequest(format!("Record id '{}' is not a valid UUID.", id)))
}

/// The party must be a known counterparty of this node.
fn known_party(flow: &FlowService, name: &str) -> Result<PartyName, ApiError> {
    let party = PartyName::from(name);
    if flow.list_known_parties().contains(&party) {
        Ok(party)
    } else {
        Err(ApiError::BadRequest(format!("Party named {} cannot be found.", name)))
    }
}

/// NaN and infinities parse as floats but are never valid amounts.
fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

pub fn validate_create(flow: &FlowService, input: CreateAssetInput) -> Result<NewAsset, ApiError> {
    if !positive(input.cost) {
        return Err(ApiError::BadRequest(
            "Query parameter 'cost' must be greater than zero.".to_string(),
        ));
    }
    if !positive(input.percent) {
        return Err(ApiError::BadRequest(
            "Query parameter 'percent' must be greater than zero.".to_string(),
        ));
    }
    if !positive(input.carats) {
        return Err(ApiError::BadRequest(
            "Query parameter 'carats' must be greater than zero.".to_string(),
        ));
    }
    let approver = input.approver.filter(|a| !a.trim().is_empty()).ok_or_else(|| {
        ApiError::BadRequest("Query parameter 'approver' missing or has wrong format.".to_string())
    })?;
    let approver = known_party(flow, &approver)?;

    let record_id = match input.external_id.as_deref() {
        Some(id) if !id.is_empty() => Some(parse_record_id(id)?),
        _ => None,
    };

    Ok(NewAsset {
        record_id,
        description: input.description.unwrap_or_default(),
        carats: input.carats,
        cost: input.cost,
        percent_fee: input.percent,
        approver,
    })
}

fn committed_message(committed: &Committed) -> String {
    format!("Transaction id {} committed to ledger.\n", committed.tx_id)
}

fn log_failure(action: &str, err: &ApiError) {
    error!("{} failed: {}", action, err);
}

pub async fn create_asset(flow: &Arc<FlowService>, asset: NewAsset) -> Result<String, ApiError> {
    info!(
        "Creating asset: approver={} carats={} cost={}",
        asset.approver, asset.carats, asset.cost
    );
    let outcome = async {
        let committed = flow.create_asset(asset).await?.wait().await?;
        Ok::<_, ApiError>(committed_message(&committed))
    }
    .await;
    outcome.inspect_err(|e| log_failure("Create", e))
}

pub async fn decide_approval(
    flow: &Arc<FlowService>,
    record_id: RecordId,
    approve: bool,
) -> Result<String, ApiError> {
    info!(record_id = %record_id, approve, "Deciding approval");
    let outcome = async {
        let committed = flow
            .decide_approval(record_id, approve)
            .await?
            .wait()
            .await?;
        Ok::<_, ApiError>(committed_message(&committed))
    }
    .await;
    outcome.inspect_err(|e| log_failure("Approval decision", e))
}

pub async fn transfer_ownership(
    flow: &Arc<FlowService>,
    record_id: RecordId,
    new_owner: &str,
) -> Result<String, ApiError> {
    // Handing a lot to its current owner is left to the validator to refuse.
    let new_owner = if new_owner == flow.identity().as_str() {
        flow.identity().clone()
    } else {
        known_party(flow, new_owner)?
    };
    info!(record_id = %record_id, new_owner = %new_owner, "Transferring ownership");
    let outcome = async {
        let committed = flow
            .transfer_ownership(record_id, new_owner)
            .await?
            .wait()
            .await?;
        Ok::<_, ApiError>(committed_message(&committed))
    }
    .await;
    outcome.inspect_err(|e| log_failure("Transfer", e))
}
