//! Shared application state for the API server

use diamondchain_notary::FinalityService;
use diamondchain_orchestrator::{FlowService, HealthChecker, ResponderService};
use std::sync::Arc;

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    /// Initiator side of every flow started through this node
    pub flow: Arc<FlowService>,
    /// Counterparty side for signing sessions and finalized deliveries
    pub responder: Arc<ResponderService>,
    /// Notary served to other nodes when this node hosts one
    pub hosted_notary: Option<Arc<dyn FinalityService>>,
    pub health: Option<Arc<HealthChecker>>,
}

impl AppState {
    pub fn new(flow: Arc<FlowService>, responder: Arc<ResponderService>) -> Self {
        Self {
            flow,
            responder,
            hosted_notary: None,
            health: None,
        }
    }

    pub fn with_hosted_notary(mut self, notary: Arc<dyn FinalityService>) -> Self {
        self.hosted_notary = Some(notary);
        self
    }

    pub fn with_health_checker(mut self, health: Arc<HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }
}
