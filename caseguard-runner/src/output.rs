//! Correlation between an operation's return value and its run record.

use caseguard_core::ProposalId;
use serde::{Deserialize, Serialize};

/// Values an operation can return from inside `with_lock`.
///
/// The run record stores the proposal id the value reports, if any.
pub trait RunOutput {
    fn proposal_id(&self) -> Option<ProposalId> {
        None
    }
}

impl RunOutput for () {}

impl RunOutput for Option<ProposalId> {
    fn proposal_id(&self) -> Option<ProposalId> {
        *self
    }
}

/// Accepts `proposal_id` or `proposalId` as an integer field.
impl RunOutput for serde_json::Value {
    fn proposal_id(&self) -> Option<ProposalId> {
        self.get("proposal_id")
            .or_else(|| self.get("proposalId"))
            .and_then(serde_json::Value::as_i64)
    }
}

/// Operation result carrying a value plus its proposal correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal<T> {
    pub proposal_id: Option<ProposalId>,
    pub value: T,
}

impl<T> Proposal<T> {
    pub fn new(proposal_id: ProposalId, value: T) -> Self {
        Self {
            proposal_id: Some(proposal_id),
            value,
        }
    }

    pub fn without_proposal(value: T) -> Self {
        Self {
            proposal_id: None,
            value,
        }
    }
}

impl<T> RunOutput for Proposal<T> {
    fn proposal_id(&self) -> Option<ProposalId> {
        self.proposal_id
    }
}
