//! Internal handlers for node-to-node communication

use diamondchain_notary::FinalityService;
use diamondchain_orchestrator::ResponderService;
use diamondchain_types::{
    FinalityReceipt, FinalizedTransition, SessionRequest, SessionResponse, SignedProposal,
};
use tracing::{info, warn};

use crate::error::ApiError;

pub async fn sign(responder: &ResponderService, request: &SessionRequest) -> SessionResponse {
    info!(
        "Received signing session {} from {}",
        request.session_id, request.signed.proposal.initiator
    );
    responder.handle_sign(request).await
}

pub async fn finalize(
    responder: &ResponderService,
    finalized: &FinalizedTransition,
) -> Result<(), ApiError> {
    info!("Received finalized transaction {}", finalized.signed.tx_id);
    responder.handle_finalize(finalized).await.map_err(|e| {
        warn!("Refused finalized transaction {}: {}", finalized.signed.tx_id, e);
        ApiError::BadRequest(e.to_string())
    })
}

pub async fn notarise(
    notary: Option<&dyn FinalityService>,
    signed: &SignedProposal,
) -> Result<FinalityReceipt, ApiError> {
    let notary = notary
        .ok_or_else(|| ApiError::NotFound("This node does not host a notary".to_string()))?;
    info!(
        "Notarisation requested for {} by {}",
        signed.tx_id, signed.proposal.initiator
    );
    Ok(notary.notarise(signed).await?)
}
