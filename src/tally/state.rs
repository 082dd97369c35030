//! Public claim state carried through the tally chain.

use ark_ff::Zero;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TallyError;
use crate::encoding::{element_to_uid, hex_element, Element};
use crate::hash::hash_elements;
use crate::signal::Vote;

/// Number of field elements in [`ClaimState::to_elements`].
pub const STATE_WIDTH: usize = 8;

/// Claim resolution; codes match the anchoring account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimResult {
    /// Open for rollup steps.
    #[default]
    Voting,
    /// Quorum and positive threshold met.
    Approved,
    /// Quorum met, positive threshold not met.
    Rejected,
    /// Quorum not met.
    Ignored,
}

impl ClaimResult {
    /// Numeric code.
    pub const fn code(self) -> u64 {
        match self {
            ClaimResult::Voting => 0,
            ClaimResult::Approved => 20,
            ClaimResult::Rejected => 19,
            ClaimResult::Ignored => 18,
        }
    }

    /// Decodes a numeric code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(ClaimResult::Voting),
            20 => Some(ClaimResult::Approved),
            19 => Some(ClaimResult::Rejected),
            18 => Some(ClaimResult::Ignored),
            _ => None,
        }
    }

    /// True for every result other than `Voting`.
    pub fn is_terminal(self) -> bool {
        self != ClaimResult::Voting
    }

    /// Resolution rule applied by the final step.
    pub fn resolve(total: u64, positives: u64, required_votes: u64, required_positives: u64) -> Self {
        match (total >= required_votes, positives >= required_positives) {
            (true, true) => ClaimResult::Approved,
            (true, false) => ClaimResult::Rejected,
            (false, _) => ClaimResult::Ignored,
        }
    }
}

impl fmt::Display for ClaimResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClaimResult::Voting => "VOTING",
            ClaimResult::Approved => "APPROVED",
            ClaimResult::Rejected => "REJECTED",
            ClaimResult::Ignored => "IGNORED",
        };
        f.write_str(name)
    }
}

/// Public tally state of one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimState {
    /// Claim identifier.
    #[serde(with = "hex_element")]
    pub claim_uid: Element,
    /// Count of `+1` votes.
    pub positives: u64,
    /// Count of `-1` votes.
    pub negatives: u64,
    /// Count of `0` votes.
    pub ignored: u64,
    /// `positives + negatives + ignored`.
    pub total: u64,
    /// Current resolution.
    pub result: ClaimResult,
    /// Quorum.
    pub required_votes: u64,
    /// Positive votes needed for approval.
    pub required_positives: u64,
}

impl ClaimState {
    /// Genesis state for a claim.
    pub fn new(claim_uid: Element, required_votes: u64, required_positives: u64) -> Self {
        Self {
            claim_uid,
            positives: 0,
            negatives: 0,
            ignored: 0,
            total: 0,
            result: ClaimResult::Voting,
            required_votes,
            required_positives,
        }
    }

    /// Field layout used as proof public input.
    pub fn to_elements(&self) -> [Element; STATE_WIDTH] {
        [
            self.claim_uid,
            Element::from(self.positives),
            Element::from(self.negatives),
            Element::from(self.ignored),
            Element::from(self.total),
            Element::from(self.result.code()),
            Element::from(self.required_votes),
            Element::from(self.required_positives),
        ]
    }

    /// Hash of the field layout.
    pub fn digest(&self) -> Element {
        hash_elements(&self.to_elements())
    }

    /// Claim uid rendered as hex text.
    pub fn uid(&self) -> String {
        element_to_uid(&self.claim_uid)
    }

    /// Checks the conditions `init` imposes.
    pub fn check_genesis(&self) -> Result<(), TallyError> {
        let reason = if self.positives != 0 || self.negatives != 0 || self.ignored != 0 {
            "counters must start at zero"
        } else if self.total != 0 {
            "total must start at zero"
        } else if self.result != ClaimResult::Voting {
            "result must start as VOTING"
        } else if self.required_positives == 0 {
            "requiredPositives must be positive"
        } else if self.required_votes == 0 {
            "requiredVotes must be positive"
        } else if self.required_positives > self.required_votes {
            "requiredPositives exceeds requiredVotes"
        } else if self.claim_uid.is_zero() {
            "claimUid must be non-zero"
        } else {
            return Ok(());
        };
        Err(TallyError::InvalidGenesis(reason.to_string()))
    }

    /// State after counting `vote`.
    pub fn with_vote(&self, vote: Vote) -> Self {
        let mut next = self.clone();
        match vote {
            Vote::Positive => next.positives += 1,
            Vote::Negative => next.negatives += 1,
            Vote::Abstain => next.ignored += 1,
        }
        next.total = next.positives + next.negatives + next.ignored;
        next
    }

    /// State with the result resolved from the current counters.
    pub fn resolved(&self) -> Self {
        Self {
            result: ClaimResult::resolve(
                self.total,
                self.positives,
                self.required_votes,
                self.required_positives,
            ),
            ..self.clone()
        }
    }
}
