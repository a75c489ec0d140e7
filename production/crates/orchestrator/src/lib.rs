//! Transaction orchestration for the diamond-lot ledger
//!
//! Coordinates each transition from proposal to commitment: local
//! validation and signing, parallel counterparty signing sessions, finality
//! through the notary and delivery to every participant's vault. The
//! responder side of the same protocol lives in [`responder`].

pub mod config;
pub mod counterparty;
pub mod directory;
pub mod error;
pub mod health_checker;
pub mod progress;
pub mod responder;
pub mod service;
pub mod timeout_monitor;

pub use config::{OrchestrationConfig, OrchestrationConfigBuilder};
pub use counterparty::{CounterpartyClient, HttpCounterpartyClient, LocalCounterpartyNetwork};
pub use directory::{PartyDirectory, PartyEntry};
pub use error::{OrchestrationError, Result};
pub use health_checker::{HealthChecker, HealthCheckerBuilder, PartyHealth};
pub use progress::{AttemptHandle, Committed, ProgressEvent};
pub use responder::ResponderService;
pub use service::{FlowService, FlowServiceBuilder};
pub use timeout_monitor::{TimeoutMonitor, TimeoutMonitorBuilder};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::OrchestrationConfig;
    pub use crate::directory::PartyDirectory;
    pub use crate::error::{OrchestrationError, Result};
    pub use crate::progress::{AttemptHandle, Committed};
    pub use crate::responder::ResponderService;
    pub use crate::service::FlowService;
    pub use crate::timeout_monitor::TimeoutMonitor;
}
