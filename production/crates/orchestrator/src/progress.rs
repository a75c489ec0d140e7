//! Attempt progress: state change events and completion handles.

use chrono::{DateTime, Utc};
use diamondchain_types::{
    AssetRecord, Attempt, AttemptId, AttemptState, FinalityReceipt, Intent, RecordId, TxId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{OrchestrationError, Result};

/// Published on every state change of an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub attempt_id: AttemptId,
    pub intent: Intent,
    pub record_id: Option<RecordId>,
    pub state: AttemptState,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn of(attempt: &Attempt) -> Self {
        let record_id = attempt
            .signed
            .as_ref()
            .and_then(|s| s.proposal.record_id())
            .or_else(|| attempt.request.record_id());
        Self {
            attempt_id: attempt.id,
            intent: attempt.intent(),
            record_id,
            state: attempt.state,
            at: attempt.updated_at,
        }
    }
}

/// Successful end of an attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub attempt_id: AttemptId,
    pub tx_id: TxId,
    /// New current version of the record
    pub record: AssetRecord,
    pub receipt: FinalityReceipt,
}

/// Caller's view of a running attempt
#[derive(Debug)]
pub struct AttemptHandle {
    id: AttemptId,
    outcome: oneshot::Receiver<Result<Committed>>,
}

impl AttemptHandle {
    pub(crate) fn new(id: AttemptId, outcome: oneshot::Receiver<Result<Committed>>) -> Self {
        Self { id, outcome }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    /// Wait until the attempt is committed or rejected.
    pub async fn wait(self) -> Result<Committed> {
        self.outcome.await.map_err(|_| {
            OrchestrationError::Internal(format!("attempt {} ended without an outcome", self.id))
        })?
    }
}
