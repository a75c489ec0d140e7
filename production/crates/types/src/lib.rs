use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Legal identity of a party on the network (X.500-style name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartyName(pub String);

impl PartyName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PartyName {
    fn from(s: String) -> Self {
        PartyName(s)
    }
}

impl From<&str> for PartyName {
    fn from(s: &str) -> Self {
        PartyName(s.to_string())
    }
}

/// Stable identifier shared by every version of one logical asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        RecordId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(RecordId)
            .map_err(|e| Error::InvalidInput(format!("Invalid record id {}: {}", s, e)))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a transition (hex digest of its proposal)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TxId {
    fn from(s: String) -> Self {
        TxId(s)
    }
}

impl From<&str> for TxId {
    fn from(s: &str) -> Self {
        TxId(s.to_string())
    }
}

/// Pointer to one stored record version: the transition that produced it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateRef {
    pub tx_id: TxId,
    pub record_id: RecordId,
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.record_id, self.tx_id)
    }
}

/// Classification of a lot, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetKind {
    Sight,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Sight => write!(f, "SIGHT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Declined,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "PENDING"),
            ApprovalStatus::Approved => write!(f, "APPROVED"),
            ApprovalStatus::Declined => write!(f, "DECLINED"),
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ApprovalStatus::Pending),
            "APPROVED" => Ok(ApprovalStatus::Approved),
            "DECLINED" => Ok(ApprovalStatus::Declined),
            _ => Err(Error::StorageError(format!("Invalid approval status: {}", s))),
        }
    }
}

/// Caller-supplied fields of a new lot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAsset {
    pub record_id: Option<RecordId>,
    pub description: String,
    pub carats: f64,
    pub cost: f64,
    pub percent_fee: f64,
    pub approver: PartyName,
}

/// One immutable version of a diamond lot.
///
/// Versions are never edited; transitions derive a new value with the
/// `with_*` functions and leave the consumed version untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub record_id: RecordId,
    pub asset_kind: AssetKind,
    pub source: PartyName,
    pub owner: PartyName,
    #[serde(default)]
    pub approver: Option<PartyName>,
    pub approval_status: ApprovalStatus,
    pub description: String,
    pub carats: f64,
    pub cost: f64,
    pub percent_fee: f64,
    pub box_value: f64,
    pub amount: f64,
    pub credit_duration: i32,
    pub date_issued: DateTime<Utc>,
    pub date_sold: Option<DateTime<Utc>>,
    pub last_purchase_date: Option<DateTime<Utc>>,
    pub approval_date: Option<DateTime<Utc>>,
}

impl AssetRecord {
    /// Build the first version of a lot; the issuing party starts as owner.
    pub fn issue(source: PartyName, asset: NewAsset, at: DateTime<Utc>) -> Self {
        let box_value = asset.cost + asset.percent_fee;
        Self {
            record_id: asset.record_id.unwrap_or_default(),
            asset_kind: AssetKind::Sight,
            owner: source.clone(),
            source,
            approver: Some(asset.approver),
            approval_status: ApprovalStatus::Pending,
            description: asset.description,
            carats: asset.carats,
            cost: asset.cost,
            percent_fee: asset.percent_fee,
            box_value,
            amount: box_value,
            credit_duration: 0,
            date_issued: at,
            date_sold: None,
            last_purchase_date: None,
            approval_date: None,
        }
    }

    /// Next version carrying the approver's decision.
    pub fn with_approval_decision(&self, approve: bool, at: DateTime<Utc>) -> Self {
        let approval_status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Declined
        };
        Self {
            approval_status,
            approval_date: Some(at),
            ..self.clone()
        }
    }

    /// Next version held by `new_owner`.
    pub fn with_owner(&self, new_owner: PartyName) -> Self {
        Self {
            owner: new_owner,
            ..self.clone()
        }
    }

    /// Parties that keep a copy of this version.
    pub fn participants(&self) -> BTreeSet<PartyName> {
        let mut parties = BTreeSet::new();
        parties.insert(self.source.clone());
        parties.insert(self.owner.clone());
        if let Some(approver) = &self.approver {
            parties.insert(approver.clone());
        }
        parties
    }
}

/// A consumed record version as carried inside a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateAndRef {
    pub state_ref: StateRef,
    pub record: AssetRecord,
}

/// Declared kind of transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Create,
    Approve,
    Decline,
    Transfer,
    Update,
}

impl Intent {
    pub fn tag(&self) -> &'static str {
        match self {
            Intent::Create => "create",
            Intent::Approve => "approve",
            Intent::Decline => "decline",
            Intent::Transfer => "transfer",
            Intent::Update => "update",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Intent {
    type Err = UnsupportedIntentError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Intent::Create),
            "approve" => Ok(Intent::Approve),
            "decline" => Ok(Intent::Decline),
            "transfer" => Ok(Intent::Transfer),
            "update" => Ok(Intent::Update),
            other => Err(UnsupportedIntentError {
                tag: other.to_string(),
            }),
        }
    }
}

/// Proposal tagged with an intent this node does not know
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported intent: {tag}")]
pub struct UnsupportedIntentError {
    pub tag: String,
}

/// Intent as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentTag(pub String);

impl From<Intent> for IntentTag {
    fn from(intent: Intent) -> Self {
        IntentTag(intent.tag().to_string())
    }
}

impl fmt::Display for IntentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A proposed transition: what it consumes, what it produces, who must sign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub intent: IntentTag,
    pub initiator: PartyName,
    pub consumed: Vec<StateAndRef>,
    pub produced: Vec<AssetRecord>,
    pub required_signers: BTreeSet<PartyName>,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn intent(&self) -> std::result::Result<Intent, UnsupportedIntentError> {
        self.intent.0.parse()
    }

    /// Record id this proposal acts upon (first produced record).
    pub fn record_id(&self) -> Option<RecordId> {
        self.produced
            .first()
            .map(|r| r.record_id)
            .or_else(|| self.consumed.first().map(|s| s.record_id()))
    }
}

impl StateAndRef {
    pub fn record_id(&self) -> RecordId {
        self.state_ref.record_id
    }
}

/// Opaque signature over a transition id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub by: PartyName,
    pub bytes: Vec<u8>,
}

/// Proposal plus the signatures gathered so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub tx_id: TxId,
    pub proposal: Proposal,
    pub signatures: BTreeMap<PartyName, Signature>,
}

impl SignedProposal {
    /// Required signers whose signature is still missing.
    pub fn missing_signers(&self) -> Vec<PartyName> {
        self.proposal
            .required_signers
            .iter()
            .filter(|p| !self.signatures.contains_key(*p))
            .cloned()
            .collect()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.missing_signers().is_empty()
    }

    pub fn add_signature(&mut self, signature: Signature) {
        self.signatures.insert(signature.by.clone(), signature);
    }
}

/// Proof from the ordering service that a transition was accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityReceipt {
    pub tx_id: TxId,
    pub notary: PartyName,
    pub notarised_at: DateTime<Utc>,
    pub signature: Signature,
}

/// Committed transition sent to every participant after finality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedTransition {
    pub signed: SignedProposal,
    pub receipt: FinalityReceipt,
}

/// Counterparty signing session request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: Uuid,
    pub signed: SignedProposal,
}

/// Counterparty answer to a signing session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionResponse {
    Signed { signature: Signature },
    Rejected { reason: String },
}

/// Orchestration attempt identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        AttemptId(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attempt state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Building,
    LocalValidation,
    LocallySigned,
    AwaitingCountersignatures,
    FinalitySubmitted,
    Committed,
    Rejected,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Committed | AttemptState::Rejected)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Building => write!(f, "building"),
            AttemptState::LocalValidation => write!(f, "local_validation"),
            AttemptState::LocallySigned => write!(f, "locally_signed"),
            AttemptState::AwaitingCountersignatures => write!(f, "awaiting_countersignatures"),
            AttemptState::FinalitySubmitted => write!(f, "finality_submitted"),
            AttemptState::Committed => write!(f, "committed"),
            AttemptState::Rejected => write!(f, "rejected"),
        }
    }
}

/// Caller request an attempt was started from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum FlowRequest {
    Create { asset: NewAsset },
    Decide { record_id: RecordId, approve: bool },
    Transfer { record_id: RecordId, new_owner: PartyName },
}

impl FlowRequest {
    pub fn intent(&self) -> Intent {
        match self {
            FlowRequest::Create { .. } => Intent::Create,
            FlowRequest::Decide { approve: true, .. } => Intent::Approve,
            FlowRequest::Decide { approve: false, .. } => Intent::Decline,
            FlowRequest::Transfer { .. } => Intent::Transfer,
        }
    }

    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            FlowRequest::Create { asset } => asset.record_id,
            FlowRequest::Decide { record_id, .. } => Some(*record_id),
            FlowRequest::Transfer { record_id, .. } => Some(*record_id),
        }
    }
}

/// Category of a terminal rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Validation,
    UnsupportedIntent,
    RecordNotFound,
    AmbiguousRecord,
    CounterpartyRejection,
    FinalityConflict,
    CounterpartyTimeout,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

/// Durable progress of one orchestration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub initiator: PartyName,
    pub request: FlowRequest,
    pub state: AttemptState,
    pub signed: Option<SignedProposal>,
    pub receipt: Option<FinalityReceipt>,
    pub rejection: Option<Rejection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(initiator: PartyName, request: FlowRequest) -> Self {
        let now = Utc::now();
        Self {
            id: AttemptId::new(),
            initiator,
            request,
            state: AttemptState::Building,
            signed: None,
            receipt: None,
            rejection: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn intent(&self) -> Intent {
        self.request.intent()
    }
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Result type for operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("Attempt not found: {0}")]
    AttemptNotFound(AttemptId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
