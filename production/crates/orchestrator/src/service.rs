//! Flow service
//!
//! Drives every attempt through BUILDING → LOCAL_VALIDATION → LOCALLY_SIGNED
//! → AWAITING_COUNTERSIGNATURES → FINALITY_SUBMITTED → COMMITTED, persisting
//! each state change before continuing so incomplete attempts can resume
//! after a restart. Any failure before finality submission ends the attempt
//! in REJECTED with a structured reason.

use chrono::Utc;
use diamondchain_notary::FinalityService;
use diamondchain_protocols::{
    create_proposal, decision_proposal, sign_proposal, transfer_proposal, verify_proposal,
    SignatureVerifier, Signer, ValidationError, Violation,
};
use diamondchain_storage::{AttemptStore, Vault};
use diamondchain_types::{
    Attempt, AttemptId, AttemptState, FinalityReceipt, FinalizedTransition, FlowRequest, Intent,
    NewAsset, PartyName, Proposal, RecordId, SessionRequest, SessionResponse, Signature,
    SignedProposal, StateAndRef,
};
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestrationConfig;
use crate::counterparty::CounterpartyClient;
use crate::directory::PartyDirectory;
use crate::error::{OrchestrationError, Result};
use crate::progress::{AttemptHandle, Committed, ProgressEvent};

pub struct FlowService {
    config: OrchestrationConfig,

    /// Local party's signing capability
    signer: Arc<dyn Signer>,

    /// Verifying keys of every known party, notary included
    verifier: Arc<dyn SignatureVerifier>,

    vault: Arc<dyn Vault>,

    attempts: Arc<dyn AttemptStore>,

    finality: Arc<dyn FinalityService>,

    counterparties: Arc<dyn CounterpartyClient>,

    directory: Arc<PartyDirectory>,

    progress: broadcast::Sender<ProgressEvent>,

    /// Attempts currently driven by a task in this process
    live: Arc<RwLock<HashSet<AttemptId>>>,

    shutdown: Arc<RwLock<bool>>,
}

impl FlowService {
    pub fn identity(&self) -> &PartyName {
        self.signer.identity()
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Issue a new lot with the local party as source and owner.
    pub async fn create_asset(self: &Arc<Self>, mut asset: NewAsset) -> Result<AttemptHandle> {
        // A non-finite amount cannot be persisted as JSON.
        if ![asset.carats, asset.cost, asset.percent_fee].iter().all(|v| v.is_finite()) {
            return Err(OrchestrationError::Validation(ValidationError {
                intent: Intent::Create,
                violation: Violation::AmountNotFinite,
            }));
        }
        // Pin the id so a resumed attempt rebuilds the same record.
        asset.record_id.get_or_insert_with(RecordId::new);
        self.start_attempt(FlowRequest::Create { asset }).await
    }

    /// Approve or decline a pending lot the local party is approver of.
    pub async fn decide_approval(
        self: &Arc<Self>,
        record_id: RecordId,
        approve: bool,
    ) -> Result<AttemptHandle> {
        self.start_attempt(FlowRequest::Decide { record_id, approve })
            .await
    }

    /// Hand an approved lot owned by the local party to `new_owner`.
    pub async fn transfer_ownership(
        self: &Arc<Self>,
        record_id: RecordId,
        new_owner: PartyName,
    ) -> Result<AttemptHandle> {
        if !self.directory.contains(&new_owner) && new_owner != *self.identity() {
            return Err(OrchestrationError::UnknownParty(new_owner));
        }
        self.start_attempt(FlowRequest::Transfer {
            record_id,
            new_owner,
        })
        .await
    }

    /// Current versions the local party participates in.
    pub async fn list_current_assets(&self) -> Result<Vec<StateAndRef>> {
        Ok(self.vault.list_current(self.identity()).await?)
    }

    /// Every counterparty in the directory, excluding self and the notary.
    pub fn list_known_parties(&self) -> Vec<PartyName> {
        self.directory.known_parties()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub async fn attempt(&self, id: AttemptId) -> Result<Attempt> {
        self.attempts
            .load(id)
            .await?
            .ok_or(OrchestrationError::AttemptNotFound(id))
    }

    pub async fn is_live(&self, id: AttemptId) -> bool {
        self.live.read().await.contains(&id)
    }

    /// Pick up every non-terminal attempt this party initiated that no task
    /// is currently driving.
    pub async fn resume_incomplete(self: &Arc<Self>) -> Result<Vec<AttemptHandle>> {
        let incomplete = self.attempts.list_incomplete().await?;
        let mut handles = Vec::new();

        for attempt in incomplete {
            if attempt.initiator != *self.identity() {
                continue;
            }
            let (id, state) = (attempt.id, attempt.state);
            match self.spawn(attempt).await {
                Some(handle) => {
                    info!(attempt_id = %id, state = %state, "Resuming incomplete attempt");
                    handles.push(handle);
                }
                None => debug!(attempt_id = %id, "Attempt already running, not resuming"),
            }
        }

        Ok(handles)
    }

    /// Resume incomplete attempts if configured and report readiness.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        info!(
            party = %self.identity(),
            resume_on_start = self.config.resume_on_start,
            "Starting flow service"
        );

        tokio::spawn(async move {
            if !self.config.resume_on_start {
                return Ok(());
            }
            match self.resume_incomplete().await {
                Ok(handles) => {
                    info!("Flow service resumed {} incomplete attempts", handles.len());
                    Ok(())
                }
                Err(e) => {
                    error!("Failed to resume incomplete attempts: {}", e);
                    Err(e)
                }
            }
        })
    }

    /// Refuse new attempts. Running attempts continue to their next
    /// persisted state.
    pub async fn shutdown(&self) {
        info!("Initiating flow service shutdown");
        *self.shutdown.write().await = true;
    }

    /// Reject an attempt that no task is driving, provided it is still in
    /// `expected` state.
    ///
    /// Returns `false` when the attempt is live or has moved on.
    pub async fn reject_detached(
        &self,
        id: AttemptId,
        expected: AttemptState,
        err: &OrchestrationError,
    ) -> Result<bool> {
        // Reserving the id keeps `spawn` off it while the store is read.
        if !self.live.write().await.insert(id) {
            return Ok(false);
        }
        let outcome = self.reject_if_still(id, expected, err).await;
        self.live.write().await.remove(&id);
        outcome
    }

    async fn reject_if_still(
        &self,
        id: AttemptId,
        expected: AttemptState,
        err: &OrchestrationError,
    ) -> Result<bool> {
        let mut attempt = match self.attempts.load(id).await? {
            Some(attempt) if attempt.state == expected && !expected.is_terminal() => attempt,
            _ => return Ok(false),
        };
        self.reject(&mut attempt, err).await?;
        Ok(true)
    }

    pub(crate) fn attempt_store(&self) -> &Arc<dyn AttemptStore> {
        &self.attempts
    }

    async fn start_attempt(self: &Arc<Self>, request: FlowRequest) -> Result<AttemptHandle> {
        if *self.shutdown.read().await {
            return Err(OrchestrationError::Shutdown);
        }

        let attempt = Attempt::new(self.identity().clone(), request);
        self.attempts.save(&attempt).await?;
        info!(
            attempt_id = %attempt.id,
            intent = %attempt.intent(),
            "Started orchestration attempt"
        );
        self.publish(&attempt);

        let id = attempt.id;
        self.spawn(attempt).await.ok_or_else(|| {
            OrchestrationError::Internal(format!("attempt {} was already running", id))
        })
    }

    async fn spawn(self: &Arc<Self>, attempt: Attempt) -> Option<AttemptHandle> {
        let id = attempt.id;
        if !self.live.write().await.insert(id) {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.drive(attempt).await;
            this.live.write().await.remove(&id);
            // The caller may have dropped its handle.
            let _ = tx.send(outcome);
        });

        Some(AttemptHandle::new(id, rx))
    }

    async fn drive(&self, mut attempt: Attempt) -> Result<Committed> {
        match self.advance(&mut attempt).await {
            Ok(committed) => Ok(committed),
            Err(err)
                if attempt.state == AttemptState::FinalitySubmitted
                    && err.leaves_attempt_open() =>
            {
                warn!(
                    attempt_id = %attempt.id,
                    error = %err,
                    "Finality outcome unknown, attempt left open for resubmission"
                );
                Err(err)
            }
            Err(err) => {
                if let Err(e) = self.reject(&mut attempt, &err).await {
                    error!(attempt_id = %attempt.id, "Failed to persist rejection: {}", e);
                }
                Err(err)
            }
        }
    }

    async fn advance(&self, attempt: &mut Attempt) -> Result<Committed> {
        if attempt.state == AttemptState::LocalValidation {
            self.transition(attempt, AttemptState::Building).await?;
        }
        if attempt.state == AttemptState::Building {
            self.build_and_sign(attempt).await?;
        }

        if matches!(
            attempt.state,
            AttemptState::LocallySigned | AttemptState::AwaitingCountersignatures
        ) {
            if attempt.state == AttemptState::LocallySigned {
                self.transition(attempt, AttemptState::AwaitingCountersignatures)
                    .await?;
            }
            self.collect_signatures(attempt).await?;
            self.transition(attempt, AttemptState::FinalitySubmitted)
                .await?;
        }

        match attempt.state {
            AttemptState::FinalitySubmitted => self.finalise(attempt).await,
            AttemptState::Committed => committed(attempt),
            state => Err(OrchestrationError::InvalidState(
                attempt.id.to_string(),
                format!("cannot advance from {}", state),
            )),
        }
    }

    async fn build_and_sign(&self, attempt: &mut Attempt) -> Result<()> {
        let proposal = self.build_proposal(&attempt.request).await?;
        self.transition(attempt, AttemptState::LocalValidation)
            .await?;

        verify_proposal(&proposal)?;
        if !proposal.required_signers.contains(self.identity()) {
            return Err(OrchestrationError::InvalidState(
                attempt.id.to_string(),
                format!("{} is not a required signer", self.identity()),
            ));
        }

        let signed = sign_proposal(proposal, self.signer.as_ref())?;
        debug!(attempt_id = %attempt.id, tx_id = %signed.tx_id, "Signed proposal locally");
        attempt.signed = Some(signed);
        self.transition(attempt, AttemptState::LocallySigned).await
    }

    async fn build_proposal(&self, request: &FlowRequest) -> Result<Proposal> {
        let me = self.identity().clone();
        let now = Utc::now();
        match request {
            FlowRequest::Create { asset } => Ok(create_proposal(me, asset.clone(), now)),
            FlowRequest::Decide { record_id, approve } => {
                let current = self.resolve_current(*record_id).await?;
                Ok(decision_proposal(me, current, *approve, now))
            }
            FlowRequest::Transfer {
                record_id,
                new_owner,
            } => {
                let current = self.resolve_current(*record_id).await?;
                Ok(transfer_proposal(me, current, new_owner.clone(), now))
            }
        }
    }

    /// Exactly one current version must exist in the local vault.
    async fn resolve_current(&self, record_id: RecordId) -> Result<StateAndRef> {
        let mut found = self.vault.find_current(record_id, self.identity()).await?;
        match found.len() {
            0 => Err(OrchestrationError::RecordNotFound(record_id)),
            1 => Ok(found.remove(0)),
            count => {
                error!(record_id = %record_id, count, "More than one current version in vault");
                Err(OrchestrationError::AmbiguousRecord { record_id, count })
            }
        }
    }

    /// Ask every missing signer in parallel. Valid signatures are kept on
    /// the attempt even when another party fails.
    async fn collect_signatures(&self, attempt: &mut Attempt) -> Result<()> {
        let mut signed = signed_of(attempt)?.clone();
        let missing: Vec<PartyName> = signed
            .missing_signers()
            .into_iter()
            .filter(|party| party != self.identity())
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let request = SessionRequest {
            session_id: Uuid::new_v4(),
            signed: signed.clone(),
        };
        let after = self.config.countersignature_timeout;
        info!(
            attempt_id = %attempt.id,
            session_id = %request.session_id,
            parties = ?missing,
            "Collecting countersignatures"
        );

        let sessions = missing.iter().map(|party| {
            let request = &request;
            async move {
                let outcome = tokio::time::timeout(
                    after,
                    self.counterparties.request_signature(party, request),
                )
                .await;
                (party.clone(), outcome)
            }
        });

        let mut failure = None;
        for (party, outcome) in join_all(sessions).await {
            let err = match outcome {
                Ok(Ok(SessionResponse::Signed { signature })) => {
                    match self.check_countersignature(&party, &signed, &signature) {
                        Ok(()) => {
                            debug!(party = %party, "Countersignature received");
                            signed.add_signature(signature);
                            continue;
                        }
                        Err(e) => e,
                    }
                }
                Ok(Ok(SessionResponse::Rejected { reason })) => {
                    OrchestrationError::CounterpartyRejection { party, reason }
                }
                Ok(Err(e)) => e,
                Err(_) => OrchestrationError::CounterpartyTimeout { party, after },
            };
            warn!(attempt_id = %attempt.id, error = %err, "Signing session failed");
            if failure.is_none() {
                failure = Some(err);
            }
        }

        attempt.signed = Some(signed);
        attempt.updated_at = Utc::now();
        self.attempts.save(attempt).await?;

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_countersignature(
        &self,
        party: &PartyName,
        signed: &SignedProposal,
        signature: &Signature,
    ) -> Result<()> {
        let valid = signature.by == *party
            && self
                .verifier
                .verify(party, signed.tx_id.0.as_bytes(), signature)
                .is_ok();
        if valid {
            Ok(())
        } else {
            Err(OrchestrationError::CounterpartyRejection {
                party: party.clone(),
                reason: "countersignature does not verify".to_string(),
            })
        }
    }

    async fn finalise(&self, attempt: &mut Attempt) -> Result<Committed> {
        let signed = signed_of(attempt)?.clone();

        let after = self.config.finality_timeout;
        let receipt = match tokio::time::timeout(after, self.finality.notarise(&signed)).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(OrchestrationError::Finality(format!(
                    "no answer from {} within {:?}",
                    self.finality.identity(),
                    after
                )))
            }
        };
        if let Err(err) = self.check_receipt(&signed, &receipt) {
            // The notary may hold the claims, so the attempt must stay open.
            error!(
                attempt_id = %attempt.id,
                tx_id = %signed.tx_id,
                error = %err,
                "Notary accepted transaction but its receipt does not verify"
            );
            return Err(err);
        }
        info!(attempt_id = %attempt.id, tx_id = %signed.tx_id, "Transaction notarised");

        let finalized = FinalizedTransition { signed, receipt };
        self.vault.record_transition(&finalized).await?;
        self.broadcast_finalized(&finalized).await;

        attempt.receipt = Some(finalized.receipt);
        self.transition(attempt, AttemptState::Committed).await?;
        committed(attempt)
    }

    fn check_receipt(&self, signed: &SignedProposal, receipt: &FinalityReceipt) -> Result<()> {
        if receipt.tx_id != signed.tx_id || receipt.notary != *self.directory.notary() {
            return Err(OrchestrationError::Finality(format!(
                "receipt for {} from {} does not match {}",
                receipt.tx_id, receipt.notary, signed.tx_id
            )));
        }
        self.verifier
            .verify(&receipt.notary, receipt.tx_id.0.as_bytes(), &receipt.signature)
            .map_err(|e| OrchestrationError::Finality(format!("invalid notary receipt: {}", e)))
    }

    /// Deliver to every other participant of the consumed and produced
    /// records. Failures are logged; receivers catch up on redelivery.
    async fn broadcast_finalized(&self, finalized: &FinalizedTransition) {
        let proposal = &finalized.signed.proposal;
        let observers: BTreeSet<PartyName> = proposal
            .consumed
            .iter()
            .map(|s| &s.record)
            .chain(proposal.produced.iter())
            .flat_map(|record| record.participants())
            .filter(|party| party != self.identity())
            .collect();

        let deliveries = observers.iter().map(|party| async move {
            let outcome = tokio::time::timeout(
                self.config.broadcast_timeout,
                self.counterparties.deliver_finalized(party, finalized),
            )
            .await;
            (party, outcome)
        });

        for (party, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(Ok(())) => debug!(party = %party, "Delivered finalized transaction"),
                Ok(Err(e)) => warn!(
                    party = %party,
                    tx_id = %finalized.signed.tx_id,
                    "Failed to deliver finalized transaction: {}", e
                ),
                Err(_) => warn!(
                    party = %party,
                    tx_id = %finalized.signed.tx_id,
                    "Timed out delivering finalized transaction"
                ),
            }
        }
    }

    async fn transition(&self, attempt: &mut Attempt, state: AttemptState) -> Result<()> {
        let from = attempt.state;
        attempt.state = state;
        attempt.updated_at = Utc::now();
        self.attempts.save(attempt).await?;

        info!(attempt_id = %attempt.id, from = %from, to = %state, "Attempt state changed");
        self.publish(attempt);
        Ok(())
    }

    async fn reject(&self, attempt: &mut Attempt, err: &OrchestrationError) -> Result<()> {
        let rejection = err.rejection();
        warn!(
            attempt_id = %attempt.id,
            kind = ?rejection.kind,
            reason = %rejection.reason,
            "Attempt rejected"
        );
        attempt.state = AttemptState::Rejected;
        attempt.rejection = Some(rejection);
        attempt.updated_at = Utc::now();
        self.attempts.save(attempt).await?;
        self.publish(attempt);
        Ok(())
    }

    fn publish(&self, attempt: &Attempt) {
        // No subscribers is not an error.
        let _ = self.progress.send(ProgressEvent::of(attempt));
    }
}

fn signed_of(attempt: &Attempt) -> Result<&SignedProposal> {
    attempt.signed.as_ref().ok_or_else(|| {
        OrchestrationError::InvalidState(
            attempt.id.to_string(),
            "no signed proposal".to_string(),
        )
    })
}

fn committed(attempt: &Attempt) -> Result<Committed> {
    let signed = signed_of(attempt)?;
    let receipt = attempt.receipt.clone().ok_or_else(|| {
        OrchestrationError::InvalidState(attempt.id.to_string(), "no receipt".to_string())
    })?;
    let record = signed.proposal.produced.first().cloned().ok_or_else(|| {
        OrchestrationError::Internal(format!("transaction {} produced nothing", signed.tx_id))
    })?;
    Ok(Committed {
        attempt_id: attempt.id,
        tx_id: signed.tx_id.clone(),
        record,
        receipt,
    })
}

/// Builder for FlowService
pub struct FlowServiceBuilder {
    config: OrchestrationConfig,
    signer: Option<Arc<dyn Signer>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    vault: Option<Arc<dyn Vault>>,
    attempts: Option<Arc<dyn AttemptStore>>,
    finality: Option<Arc<dyn FinalityService>>,
    counterparties: Option<Arc<dyn CounterpartyClient>>,
    directory: Option<Arc<PartyDirectory>>,
}

impl FlowServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestrationConfig::default(),
            signer: None,
            verifier: None,
            vault: None,
            attempts: None,
            finality: None,
            counterparties: None,
            directory: None,
        }
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn Vault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_attempt_store(mut self, attempts: Arc<dyn AttemptStore>) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_finality(mut self, finality: Arc<dyn FinalityService>) -> Self {
        self.finality = Some(finality);
        self
    }

    pub fn with_counterparties(mut self, counterparties: Arc<dyn CounterpartyClient>) -> Self {
        self.counterparties = Some(counterparties);
        self
    }

    pub fn with_directory(mut self, directory: Arc<PartyDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn build(self) -> Result<Arc<FlowService>> {
        let signer = self
            .signer
            .ok_or_else(|| OrchestrationError::Config("signer required".to_string()))?;
        let directory = self
            .directory
            .ok_or_else(|| OrchestrationError::Config("directory required".to_string()))?;

        if directory.local() != signer.identity() {
            return Err(OrchestrationError::Config(format!(
                "signer {} does not match directory identity {}",
                signer.identity(),
                directory.local()
            )));
        }

        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(directory.key_ring()?),
        };

        let (progress, _) = broadcast::channel(self.config.progress_channel_capacity.max(1));

        Ok(Arc::new(FlowService {
            config: self.config,
            signer,
            verifier,
            vault: self
                .vault
                .ok_or_else(|| OrchestrationError::Config("vault required".to_string()))?,
            attempts: self
                .attempts
                .ok_or_else(|| OrchestrationError::Config("attempt store required".to_string()))?,
            finality: self.finality.ok_or_else(|| {
                OrchestrationError::Config("finality service required".to_string())
            })?,
            counterparties: self.counterparties.ok_or_else(|| {
                OrchestrationError::Config("counterparty client required".to_string())
            })?,
            directory,
            progress,
            live: Arc::new(RwLock::new(HashSet::new())),
            shutdown: Arc::new(RwLock::new(false)),
        }))
    }
}

impl Default for FlowServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
