//! Claim anchoring account.
//!
//! Models the account that seals a claim's result: it accepts a final tally
//! log once, recomputes the result from the proven counters against its own
//! thresholds, and stores the counts as a single decimal-legible numeral.
//! The account is created with the group roots the claim is tallied against;
//! a log over any other groups is refused.

use ark_ff::{BigInteger, PrimeField, Zero};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::encoding::{element_to_uid, hex_element, Element};
use crate::tally::{ClaimResult, GroupRoots, ProofBackend, TallyError, TallyMachine, TallyProof};

/// Field elements in a [`ClaimAction`] vote array.
pub const DATA_SIZE: usize = 14;

/// Two-bit marks packed per field element.
pub const MARKS_PER_ELEMENT: usize = 126;

/// Largest count representable in one four-digit slot.
pub const MAX_SLOT: u64 = 9_999;

const TOTAL_FACTOR: u64 = 1_0000_0000_0000;
const POSITIVES_FACTOR: u64 = 1_0000_0000;
const NEGATIVES_FACTOR: u64 = 1_0000;

/// Errors raised by the anchoring account.
#[derive(Debug, Error)]
pub enum AnchorError {
    #[error(transparent)]
    /// Tally log did not verify.
    Tally(#[from] TallyError),
    #[error("tally log is not final")]
    /// Head step is not a final step.
    NotFinal,
    #[error("claim already closed as {0}")]
    /// Result was set before.
    AlreadyClosed(ClaimResult),
    #[error("tally log belongs to another claim")]
    /// Claim uid differs from the account's.
    ClaimMismatch,
    #[error("tally log was proved against other group roots")]
    /// Genesis roots differ from the account's.
    RootMismatch,
    #[error("proven result {proven} differs from recomputed {computed}")]
    /// Proven result disagrees with the account thresholds.
    ResultMismatch {
        /// Result carried by the log.
        proven: ClaimResult,
        /// Result recomputed by the account.
        computed: ClaimResult,
    },
    #[error("count {0} does not fit a four-digit slot")]
    /// A counter exceeds [`MAX_SLOT`].
    CountOverflow(u64),
    #[error("{0} votes exceed action capacity")]
    /// More marks than [`DATA_SIZE`] × [`MARKS_PER_ELEMENT`].
    TooManyVotes(usize),
    #[error("action total {action} differs from tally total {tally}")]
    /// Action total does not match the proven total.
    ActionMismatch {
        /// Total in the action.
        action: u64,
        /// Total proven by the log.
        tally: u64,
    },
}

/// Unpacked vote numeral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    /// Sum of the three counters.
    pub total: u64,
    /// `+1` votes.
    pub positives: u64,
    /// `-1` votes.
    pub negatives: u64,
    /// `0` votes.
    pub ignored: u64,
}

/// `total·10^12 + positives·10^8 + negatives·10^4 + ignored`.
pub fn pack_votes(positives: u64, negatives: u64, ignored: u64) -> Result<u64, AnchorError> {
    for count in [positives, negatives, ignored] {
        if count > MAX_SLOT {
            return Err(AnchorError::CountOverflow(count));
        }
    }
    let total = positives + negatives + ignored;
    Ok(total * TOTAL_FACTOR + positives * POSITIVES_FACTOR + negatives * NEGATIVES_FACTOR + ignored)
}

/// Inverse of [`pack_votes`].
pub fn unpack_votes(packed: u64) -> VoteCounts {
    VoteCounts {
        total: packed / TOTAL_FACTOR,
        positives: (packed / POSITIVES_FACTOR) % 1_0000,
        negatives: (packed / NEGATIVES_FACTOR) % 1_0000,
        ignored: packed % 1_0000,
    }
}

/// Per-vote mark stored in a [`ClaimAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteMark {
    /// Empty slot.
    None = 0,
    /// `+1`.
    Positive = 1,
    /// `-1`.
    Negative = 2,
    /// `0`.
    Ignored = 3,
}

impl VoteMark {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            1 => VoteMark::Positive,
            2 => VoteMark::Negative,
            3 => VoteMark::Ignored,
            _ => VoteMark::None,
        }
    }
}

/// Action appended to the account log when voting closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAction {
    /// Close time, milliseconds since the Unix epoch.
    pub done_utc: u64,
    /// Number of marks recorded.
    pub total: u64,
    /// Packed two-bit marks, little-endian within each element.
    #[serde(with = "votes_hex")]
    pub votes: [Element; DATA_SIZE],
}

impl ClaimAction {
    /// Packs `marks` into a new action.
    pub fn from_marks(done_utc: u64, marks: &[VoteMark]) -> Result<Self, AnchorError> {
        if marks.len() > DATA_SIZE * MARKS_PER_ELEMENT {
            return Err(AnchorError::TooManyVotes(marks.len()));
        }
        let mut votes = [Element::zero(); DATA_SIZE];
        for (slot, chunk) in votes.iter_mut().zip(marks.chunks(MARKS_PER_ELEMENT)) {
            let mut bytes = [0u8; 32];
            for (pos, mark) in chunk.iter().enumerate() {
                bytes[pos / 4] |= (*mark as u8) << ((pos % 4) * 2);
            }
            *slot = Element::from_le_bytes_mod_order(&bytes);
        }
        Ok(Self {
            done_utc,
            total: marks.len() as u64,
            votes,
        })
    }

    /// Unpacks the first `total` marks.
    pub fn marks(&self) -> Vec<VoteMark> {
        let total = self.total as usize;
        let mut marks = Vec::with_capacity(total);
        for element in &self.votes {
            let bytes = element.into_bigint().to_bytes_le();
            for pos in 0..MARKS_PER_ELEMENT {
                if marks.len() == total {
                    return marks;
                }
                marks.push(VoteMark::from_bits(bytes[pos / 4] >> ((pos % 4) * 2)));
            }
        }
        marks
    }
}

mod votes_hex {
    use super::{Element, DATA_SIZE};
    use crate::encoding::{element_from_hex, element_to_hex};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(votes: &[Element; DATA_SIZE], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(votes.iter().map(element_to_hex))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[Element; DATA_SIZE], D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        if texts.len() != DATA_SIZE {
            return Err(D::Error::invalid_length(texts.len(), &"14 vote elements"));
        }
        let mut votes = [Element::from(0u64); DATA_SIZE];
        for (slot, text) in votes.iter_mut().zip(&texts) {
            *slot = element_from_hex(text).map_err(D::Error::custom)?;
        }
        Ok(votes)
    }
}

/// On-chain state of one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAccount {
    /// Claim identifier.
    #[serde(with = "hex_element")]
    pub claim_uid: Element,
    /// Packed vote numeral, zero until closed.
    pub votes: u64,
    /// Quorum.
    pub required_votes: u64,
    /// Positive votes needed for approval.
    pub required_positives: u64,
    /// Groups the claim is tallied against.
    pub roots: GroupRoots,
    /// Sealed result.
    pub result: ClaimResult,
    /// Dispatched actions.
    pub actions: Vec<ClaimAction>,
}

impl ClaimAccount {
    /// Account for an open claim over `roots`.
    pub fn new(claim_uid: Element, required_votes: u64, required_positives: u64, roots: GroupRoots) -> Self {
        Self {
            claim_uid,
            votes: 0,
            required_votes,
            required_positives,
            roots,
            result: ClaimResult::Voting,
            actions: Vec::new(),
        }
    }

    /// Unpacked vote numeral.
    pub fn counts(&self) -> VoteCounts {
        unpack_votes(self.votes)
    }

    /// Seals the result from a final tally log; settable once.
    pub fn close_voting<B: ProofBackend>(
        &mut self,
        machine: &TallyMachine<B>,
        proof: &TallyProof,
        action: ClaimAction,
    ) -> Result<ClaimResult, AnchorError> {
        if proof.groups() != Some(&self.roots) {
            warn!(claim = %element_to_uid(&self.claim_uid), "close rejected: foreign group roots");
            return Err(AnchorError::RootMismatch);
        }
        let state = machine.verify_pinned(proof, &self.roots)?;
        if !proof.is_final() {
            return Err(AnchorError::NotFinal);
        }
        if self.result.is_terminal() {
            warn!(result = %self.result, "close rejected: claim already closed");
            return Err(AnchorError::AlreadyClosed(self.result));
        }
        if state.claim_uid != self.claim_uid {
            return Err(AnchorError::ClaimMismatch);
        }
        let total = state.positives + state.negatives + state.ignored;
        let computed = ClaimResult::resolve(
            total,
            state.positives,
            self.required_votes,
            self.required_positives,
        );
        if computed != state.result {
            return Err(AnchorError::ResultMismatch {
                proven: state.result,
                computed,
            });
        }
        if action.total != total {
            return Err(AnchorError::ActionMismatch {
                action: action.total,
                tally: total,
            });
        }
        self.votes = pack_votes(state.positives, state.negatives, state.ignored)?;
        self.result = computed;
        self.actions.push(action);
        info!(claim = %state.uid(), result = %computed, votes = self.votes, "claim closed");
        Ok(computed)
    }
}
