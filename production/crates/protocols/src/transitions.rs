//! Proposal builders for each intent
//!
//! Each builder derives the produced record from the consumed one (or from
//! caller-supplied fields for a create) and tags the proposal with the parties
//! whose signature it needs.

use chrono::{DateTime, Utc};
use diamondchain_types::{AssetRecord, Intent, NewAsset, PartyName, Proposal, StateAndRef};
use std::collections::BTreeSet;

/// Parties that must sign a transition of this intent.
pub fn required_signers(
    intent: Intent,
    consumed: Option<&AssetRecord>,
    produced: &AssetRecord,
) -> BTreeSet<PartyName> {
    let mut signers = BTreeSet::new();
    match intent {
        Intent::Create | Intent::Approve | Intent::Decline => {
            signers.insert(produced.source.clone());
            if let Some(approver) = &produced.approver {
                signers.insert(approver.clone());
            }
        }
        Intent::Transfer => {
            if let Some(previous) = consumed {
                signers.insert(previous.owner.clone());
            }
            signers.insert(produced.owner.clone());
        }
        Intent::Update => {
            signers.insert(produced.owner.clone());
            if let Some(approver) = &produced.approver {
                signers.insert(approver.clone());
            }
        }
    }
    signers
}

pub fn create_proposal(initiator: PartyName, asset: NewAsset, at: DateTime<Utc>) -> Proposal {
    let record = AssetRecord::issue(initiator.clone(), asset, at);
    let required_signers = required_signers(Intent::Create, None, &record);
    Proposal {
        intent: Intent::Create.into(),
        initiator,
        consumed: Vec::new(),
        produced: vec![record],
        required_signers,
        created_at: at,
    }
}

/// Approve (`approve == true`) or decline the current version.
pub fn decision_proposal(
    initiator: PartyName,
    current: StateAndRef,
    approve: bool,
    at: DateTime<Utc>,
) -> Proposal {
    let intent = if approve { Intent::Approve } else { Intent::Decline };
    let produced = current.record.with_approval_decision(approve, at);
    single_step(intent, initiator, current, produced, at)
}

pub fn transfer_proposal(
    initiator: PartyName,
    current: StateAndRef,
    new_owner: PartyName,
    at: DateTime<Utc>,
) -> Proposal {
    let produced = current.record.with_owner(new_owner);
    single_step(Intent::Transfer, initiator, current, produced, at)
}

/// Replace descriptive attributes of an approved lot. Financial totals are
/// carried as given by the caller.
pub fn update_proposal(
    initiator: PartyName,
    current: StateAndRef,
    produced: AssetRecord,
    at: DateTime<Utc>,
) -> Proposal {
    single_step(Intent::Update, initiator, current, produced, at)
}

fn single_step(
    intent: Intent,
    initiator: PartyName,
    current: StateAndRef,
    produced: AssetRecord,
    at: DateTime<Utc>,
) -> Proposal {
    let required_signers = required_signers(intent, Some(&current.record), &produced);
    Proposal {
        intent: intent.into(),
        initiator,
        consumed: vec![current],
        produced: vec![produced],
        required_signers,
        created_at: at,
    }
}
