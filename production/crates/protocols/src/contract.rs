//! Transition Validator
//!
//! Decides whether a proposed transition is legal given the records it
//! consumes, the records it produces and the declared intent. The checks are
//! pure: every party holding a copy of a proposal runs them independently and
//! must reach the same verdict.

use crate::transitions::required_signers;
use diamondchain_types::{
    ApprovalStatus, AssetRecord, Intent, Proposal, UnsupportedIntentError,
};
use std::fmt;

/// The specific transition rule a proposal broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Violation {
    InputsNotEmpty,
    InputCount,
    OutputCount,
    SourceIsApprover,
    ApproverMissing,
    PreviousNotPending,
    StatusNotPending,
    StatusNotApproved,
    StatusNotDeclined,
    SameOwner,
    RecordIdChanged,
    AmountNotFinite,
    SignersMismatch,
}

impl Violation {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Violation::InputsNotEmpty => "inputs_not_empty",
            Violation::InputCount => "input_count",
            Violation::OutputCount => "output_count",
            Violation::SourceIsApprover => "source_is_approver",
            Violation::ApproverMissing => "approver_missing",
            Violation::PreviousNotPending => "previous_not_pending",
            Violation::StatusNotPending => "status_not_pending",
            Violation::StatusNotApproved => "status_not_approved",
            Violation::StatusNotDeclined => "status_not_declined",
            Violation::SameOwner => "same_owner",
            Violation::RecordIdChanged => "record_id_changed",
            Violation::AmountNotFinite => "amount_not_finite",
            Violation::SignersMismatch => "signers_mismatch",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Violation::InputsNotEmpty => "no records may be consumed when creating an asset",
            Violation::InputCount => "exactly one record must be consumed",
            Violation::OutputCount => "exactly one record must be produced",
            Violation::SourceIsApprover => "source must differ from approver",
            Violation::ApproverMissing => "approver must be set",
            Violation::PreviousNotPending => "previous approval status must be PENDING",
            Violation::StatusNotPending => "approval status must be PENDING",
            Violation::StatusNotApproved => "approval status must be APPROVED",
            Violation::StatusNotDeclined => "approval status must be DECLINED",
            Violation::SameOwner => "new owner must differ from previous owner",
            Violation::RecordIdChanged => "produced record must keep the consumed record id",
            Violation::AmountNotFinite => "amounts must be finite numbers",
            Violation::SignersMismatch => "required signers do not match the transition",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// A proposal broke a transition rule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{violation}")]
pub struct ValidationError {
    pub intent: Intent,
    pub violation: Violation,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        self.violation.code()
    }

    pub fn reason(&self) -> &'static str {
        self.violation.reason()
    }
}

/// Failure of [`verify_proposal`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error(transparent)]
    UnsupportedIntent(#[from] UnsupportedIntentError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Check one transition against the rules for `intent`.
pub fn validate(
    intent: Intent,
    consumed: &[&AssetRecord],
    produced: &[&AssetRecord],
) -> Result<(), ValidationError> {
    let fail = |violation| Err(ValidationError { intent, violation });

    if !produced.iter().all(|record| has_finite_amounts(record)) {
        return fail(Violation::AmountNotFinite);
    }

    match intent {
        Intent::Create => {
            if !consumed.is_empty() {
                return fail(Violation::InputsNotEmpty);
            }
            let [output] = produced else {
                return fail(Violation::OutputCount);
            };
            if output.approver.as_ref() == Some(&output.source) {
                return fail(Violation::SourceIsApprover);
            }
            if output.approval_status != ApprovalStatus::Pending {
                return fail(Violation::StatusNotPending);
            }
            Ok(())
        }
        Intent::Approve | Intent::Decline => {
            let (input, output) = single_pair(intent, consumed, produced)?;
            if input.approval_status != ApprovalStatus::Pending {
                return fail(Violation::PreviousNotPending);
            }
            let (expected, violation) = if intent == Intent::Approve {
                (ApprovalStatus::Approved, Violation::StatusNotApproved)
            } else {
                (ApprovalStatus::Declined, Violation::StatusNotDeclined)
            };
            if output.approval_status != expected {
                return fail(violation);
            }
            if output.approver.as_ref() == Some(&output.source) {
                return fail(Violation::SourceIsApprover);
            }
            if output.approver.is_none() {
                return fail(Violation::ApproverMissing);
            }
            keeps_record_id(intent, input, output)
        }
        Intent::Transfer => {
            let (input, output) = single_pair(intent, consumed, produced)?;
            if output.approval_status != ApprovalStatus::Approved {
                return fail(Violation::StatusNotApproved);
            }
            if output.owner == input.owner {
                return fail(Violation::SameOwner);
            }
            keeps_record_id(intent, input, output)
        }
        Intent::Update => {
            let (input, output) = single_pair(intent, consumed, produced)?;
            if output.approval_status != ApprovalStatus::Approved {
                return fail(Violation::StatusNotApproved);
            }
            keeps_record_id(intent, input, output)
        }
    }
}

/// Parse the proposal's intent tag, validate its records and check that it
/// names exactly the signers its intent requires.
pub fn verify_proposal(proposal: &Proposal) -> Result<Intent, ContractError> {
    let intent = proposal.intent()?;
    let consumed: Vec<&AssetRecord> = proposal.consumed.iter().map(|s| &s.record).collect();
    let produced: Vec<&AssetRecord> = proposal.produced.iter().collect();
    validate(intent, &consumed, &produced)?;
    check_required_signers(intent, proposal)?;
    Ok(intent)
}

/// A proposal's declared signer set must be the one derived from its records,
/// otherwise a party could be written out of its own transition.
pub fn check_required_signers(intent: Intent, proposal: &Proposal) -> Result<(), ValidationError> {
    let Some(produced) = proposal.produced.first() else {
        return Err(ValidationError { intent, violation: Violation::OutputCount });
    };
    let consumed = proposal.consumed.first().map(|input| &input.record);
    if required_signers(intent, consumed, produced) != proposal.required_signers {
        return Err(ValidationError { intent, violation: Violation::SignersMismatch });
    }
    Ok(())
}

fn has_finite_amounts(record: &AssetRecord) -> bool {
    [
        record.carats,
        record.cost,
        record.percent_fee,
        record.box_value,
        record.amount,
    ]
    .iter()
    .all(|value| value.is_finite())
}

fn single_pair<'a>(
    intent: Intent,
    consumed: &[&'a AssetRecord],
    produced: &[&'a AssetRecord],
) -> Result<(&'a AssetRecord, &'a AssetRecord), ValidationError> {
    let [input] = consumed else {
        return Err(ValidationError { intent, violation: Violation::InputCount });
    };
    let [output] = produced else {
        return Err(ValidationError { intent, violation: Violation::OutputCount });
    };
    Ok((*input, *output))
}

fn keeps_record_id(
    intent: Intent,
    input: &AssetRecord,
    output: &AssetRecord,
) -> Result<(), ValidationError> {
    if input.record_id != output.record_id {
        return Err(ValidationError { intent, violation: Violation::RecordIdChanged });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transitions::{
        create_proposal, decision_proposal, transfer_proposal, update_proposal,
    };
    use chrono::Utc;
    use diamondchain_types::{NewAsset, PartyName, StateAndRef, StateRef, TxId};
    use proptest::prelude::*;

    fn issued() -> AssetRecord {
        AssetRecord::issue(
            PartyName::from("P1"),
            NewAsset {
                record_id: None,
                description: "2ct round".to_string(),
                carats: 2.0,
                cost: 10_000.0,
                percent_fee: 5.0,
                approver: PartyName::from("P2"),
            },
            Utc::now(),
        )
    }

    fn violation(result: Result<(), ValidationError>) -> Violation {
        result.unwrap_err().violation
    }

    #[test]
    fn test_create_accepts_pending_issue() {
        let record = issued();
        assert!(validate(Intent::Create, &[], &[&record]).is_ok());
    }

    #[test]
    fn test_create_rejects_inputs_and_bad_outputs() {
        let record = issued();
        assert_eq!(
            violation(validate(Intent::Create, &[&record], &[&record])),
            Violation::InputsNotEmpty
        );
        assert_eq!(
            violation(validate(Intent::Create, &[], &[])),
            Violation::OutputCount
        );
        assert_eq!(
            violation(validate(Intent::Create, &[], &[&record, &record])),
            Violation::OutputCount
        );

        let mut self_approved = record.clone();
        self_approved.approver = Some(self_approved.source.clone());
        assert_eq!(
            violation(validate(Intent::Create, &[], &[&self_approved])),
            Violation::SourceIsApprover
        );

        let approved = record.with_approval_decision(true, Utc::now());
        assert_eq!(
            violation(validate(Intent::Create, &[], &[&approved])),
            Violation::StatusNotPending
        );
    }

    #[test]
    fn test_approve_and_decline() {
        let record = issued();
        let approved = record.with_approval_decision(true, Utc::now());
        let declined = record.with_approval_decision(false, Utc::now());

        assert!(validate(Intent::Approve, &[&record], &[&approved]).is_ok());
        assert!(validate(Intent::Decline, &[&record], &[&declined]).is_ok());

        assert_eq!(
            violation(validate(Intent::Approve, &[&record], &[&declined])),
            Violation::StatusNotApproved
        );
        assert_eq!(
            violation(validate(Intent::Decline, &[&record], &[&approved])),
            Violation::StatusNotDeclined
        );
        assert_eq!(
            violation(validate(Intent::Approve, &[], &[&approved])),
            Violation::InputCount
        );
    }

    #[test]
    fn test_decision_on_decided_record_is_rejected() {
        let approved = issued().with_approval_decision(true, Utc::now());
        let again = approved.with_approval_decision(true, Utc::now());
        let err = validate(Intent::Approve, &[&approved], &[&again]).unwrap_err();
        assert_eq!(err.to_string(), "previous approval status must be PENDING");
        assert_eq!(err.code(), "previous_not_pending");
    }

    #[test]
    fn test_decision_requires_approver() {
        let mut record = issued();
        record.approver = None;
        let approved = record.with_approval_decision(true, Utc::now());
        assert_eq!(
            violation(validate(Intent::Approve, &[&record], &[&approved])),
            Violation::ApproverMissing
        );
    }

    #[test]
    fn test_transfer_rules() {
        let approved = issued().with_approval_decision(true, Utc::now());
        let moved = approved.with_owner(PartyName::from("P3"));
        assert!(validate(Intent::Transfer, &[&approved], &[&moved]).is_ok());

        let same = approved.with_owner(PartyName::from("P1"));
        let err = validate(Intent::Transfer, &[&approved], &[&same]).unwrap_err();
        assert_eq!(err.to_string(), "new owner must differ from previous owner");

        let pending = issued();
        let moved_pending = pending.with_owner(PartyName::from("P3"));
        assert_eq!(
            violation(validate(Intent::Transfer, &[&pending], &[&moved_pending])),
            Violation::StatusNotApproved
        );
    }

    #[test]
    fn test_update_requires_approved() {
        let approved = issued().with_approval_decision(true, Utc::now());
        let mut updated = approved.clone();
        updated.description = "2ct round, recut".to_string();
        assert!(validate(Intent::Update, &[&approved], &[&updated]).is_ok());

        let pending = issued();
        assert_eq!(
            violation(validate(Intent::Update, &[&pending], &[&pending])),
            Violation::StatusNotApproved
        );
    }

    #[test]
    fn test_record_id_must_be_kept() {
        let approved = issued().with_approval_decision(true, Utc::now());
        let mut other = approved.with_owner(PartyName::from("P3"));
        other.record_id = diamondchain_types::RecordId::new();
        assert_eq!(
            violation(validate(Intent::Transfer, &[&approved], &[&other])),
            Violation::RecordIdChanged
        );
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let record = issued();
        let proposal = Proposal {
            intent: diamondchain_types::IntentTag("merge".to_string()),
            initiator: PartyName::from("P1"),
            consumed: vec![],
            produced: vec![record],
            required_signers: Default::default(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            verify_proposal(&proposal),
            Err(ContractError::UnsupportedIntent(_))
        ));
    }

    #[test]
    fn test_non_finite_amounts_are_rejected() {
        for poison in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut record = issued();
            record.cost = poison;
            assert_eq!(
                violation(validate(Intent::Create, &[], &[&record])),
                Violation::AmountNotFinite
            );

            let input = issued().with_approval_decision(true, Utc::now());
            let mut updated = input.clone();
            updated.carats = poison;
            assert_eq!(
                violation(validate(Intent::Update, &[&input], &[&updated])),
                Violation::AmountNotFinite
            );
        }
    }

    fn held(record: AssetRecord) -> StateAndRef {
        StateAndRef {
            state_ref: StateRef {
                tx_id: TxId::from("t1"),
                record_id: record.record_id,
            },
            record,
        }
    }

    fn signers_violation(proposal: &Proposal) -> Violation {
        match verify_proposal(proposal) {
            Err(ContractError::Validation(err)) => err.violation,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_built_proposals_name_their_signers() {
        let now = Utc::now();
        let pending = held(issued());
        let approved = held(issued().with_approval_decision(true, now));
        let mut recut = approved.record.clone();
        recut.carats = 2.1;
        let asset = NewAsset {
            record_id: None,
            description: "2ct round".to_string(),
            carats: 2.0,
            cost: 10_000.0,
            percent_fee: 5.0,
            approver: PartyName::from("P2"),
        };

        let proposals = [
            create_proposal(PartyName::from("P1"), asset, now),
            decision_proposal(PartyName::from("P2"), pending.clone(), true, now),
            decision_proposal(PartyName::from("P2"), pending, false, now),
            transfer_proposal(PartyName::from("P1"), approved.clone(), PartyName::from("P3"), now),
            update_proposal(PartyName::from("P1"), approved, recut.clone(), now),
        ];
        for proposal in &proposals {
            assert!(verify_proposal(proposal).is_ok(), "{}", proposal.intent.0);
        }
    }

    #[test]
    fn test_dropped_or_added_signer_is_rejected() {
        let now = Utc::now();
        let pending = held(issued());
        let approved = held(issued().with_approval_decision(true, now));
        let mut recut = approved.record.clone();
        recut.carats = 2.1;
        let asset = NewAsset {
            record_id: None,
            description: "2ct round".to_string(),
            carats: 2.0,
            cost: 10_000.0,
            percent_fee: 5.0,
            approver: PartyName::from("P2"),
        };

        let proposals = [
            (create_proposal(PartyName::from("P1"), asset, now), "P2"),
            (decision_proposal(PartyName::from("P2"), pending.clone(), true, now), "P1"),
            (decision_proposal(PartyName::from("P2"), pending, false, now), "P1"),
            (
                transfer_proposal(
                    PartyName::from("P1"),
                    approved.clone(),
                    PartyName::from("P3"),
                    now,
                ),
                "P3",
            ),
            (update_proposal(PartyName::from("P1"), approved, recut, now), "P2"),
        ];
        for (proposal, counterparty) in proposals {
            let mut dropped = proposal.clone();
            dropped.required_signers.remove(&PartyName::from(counterparty));
            assert_eq!(signers_violation(&dropped), Violation::SignersMismatch);

            let mut padded = proposal;
            padded.required_signers.insert(PartyName::from("P4"));
            assert_eq!(signers_violation(&padded), Violation::SignersMismatch);
        }
    }

    fn arb_status() -> impl Strategy<Value = ApprovalStatus> {
        prop_oneof![
            Just(ApprovalStatus::Pending),
            Just(ApprovalStatus::Approved),
            Just(ApprovalStatus::Declined),
        ]
    }

    fn arb_intent() -> impl Strategy<Value = Intent> {
        prop_oneof![
            Just(Intent::Create),
            Just(Intent::Approve),
            Just(Intent::Decline),
            Just(Intent::Transfer),
            Just(Intent::Update),
        ]
    }

    fn arb_party() -> impl Strategy<Value = PartyName> {
        prop_oneof![Just("P1"), Just("P2"), Just("P3")].prop_map(PartyName::from)
    }

    prop_compose! {
        fn arb_record()(
            owner in arb_party(),
            approver in proptest::option::of(arb_party()),
            status in arb_status(),
            cost in 0.0f64..100_000.0,
        ) -> AssetRecord {
            let mut record = issued();
            record.owner = owner;
            record.approver = approver;
            record.approval_status = status;
            record.cost = cost;
            record
        }
    }

    proptest! {
        #[test]
        fn prop_verdict_is_deterministic(
            intent in arb_intent(),
            consumed in proptest::collection::vec(arb_record(), 0..3),
            produced in proptest::collection::vec(arb_record(), 0..3),
        ) {
            let consumed: Vec<&AssetRecord> = consumed.iter().collect();
            let produced: Vec<&AssetRecord> = produced.iter().collect();
            let first = validate(intent, &consumed, &produced);
            let second = validate(intent, &consumed, &produced);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_decided_record_never_returns_to_pending(
            intent in arb_intent(),
            decided in arb_status().prop_filter("decided", |s| *s != ApprovalStatus::Pending),
            record in arb_record(),
        ) {
            let mut input = record.clone();
            input.approval_status = decided;
            let mut output = record;
            output.approval_status = ApprovalStatus::Pending;
            prop_assert!(validate(intent, &[&input], &[&output]).is_err());
        }

        #[test]
        fn prop_create_accepts_exactly_valid_issues(record in arb_record()) {
            let expected = record.approver.as_ref() != Some(&record.source)
                && record.approval_status == ApprovalStatus::Pending;
            prop_assert_eq!(validate(Intent::Create, &[], &[&record]).is_ok(), expected);
        }
    }
}
