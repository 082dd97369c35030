//! Proof-carrying tally of claim votes.
//!
//! A claim moves `init → rollup* → final`.  Each transition is proved by a
//! Groth16 circuit over the public [`ClaimState`] and appended to a
//! [`TallyProof`] step log.  `init` fixes the [`GroupRoots`] of the claim.
//! A rollup proof shows, against those roots, that the elector belongs to the
//! validators or auditors and to the claim electors, that its nullifier is
//! absent from the claim nullifiers, and that it signed the recomputed signal.

pub mod backend;
pub mod chain;
pub mod circuit;
pub mod machine;
pub mod session;
pub mod state;

use thiserror::Error;

use crate::identity::IdentityError;
use crate::membership::{MapError, StoreError};
use crate::signal::SignalError;

pub use backend::{Circuit, CircuitShape, Groth16Backend, ProofBackend, DEFAULT_SETUP_SEED};
pub use chain::{step_binding, verify_chain, ChainHead, GroupRoots, StepEvidence, StepKind, StepRecord, TallyProof};
pub use circuit::{RollupEvidence, Transition, TransitionCircuit};
pub use machine::{group_roots, RollupWitness, TallyMachine, VERIFIED_HEADS};
pub use session::{ClaimGroups, TallySession};
pub use state::{ClaimResult, ClaimState};

/// Reasons a tally step is rejected.
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("invalid genesis state: {0}")]
    /// `init` invariants violated.
    InvalidGenesis(String),
    #[error("elector is neither a validator nor an auditor")]
    /// Elector missing from both elector groups.
    NotElector,
    #[error("elector is not assigned to this claim")]
    /// Elector missing from the claim's elector group.
    NotAssigned,
    #[error("nullifier already used")]
    /// Double vote or replayed signal.
    Replay,
    #[error("signal does not match hash(claimUid, elector, vote)")]
    /// Supplied signal differs from the recomputed one.
    SignalMismatch,
    #[error("invalid signal signature")]
    /// Signature does not verify against the elector key.
    BadSignature,
    #[error("vote value outside {{-1, 0, 1}}")]
    /// Vote element not in the ternary domain.
    VoteOutOfDomain,
    #[error("public key and pin do not open the elector commitment")]
    /// Ballot key material belongs to another commitment.
    KeyMismatch,
    #[error("group roots differ from the claim's roots")]
    /// Maps or log disagree with the roots fixed at genesis.
    RootMismatch,
    #[error("paired groups use different tiers")]
    /// Validators and auditors, or claim electors and nullifiers, differ in tier.
    TierMismatch,
    #[error("claim nullifier group already holds entries")]
    /// A claim was opened over a used nullifier group.
    StaleNullifiers,
    #[error("claim already resolved as {0}")]
    /// Transition attempted on a terminal state.
    NotVoting(ClaimResult),
    #[error("chain verification failed: {0}")]
    /// Previous proof or step log does not verify.
    ChainBroken(String),
    #[error("prover error: {0}")]
    /// Backend failed to synthesize, prove or verify.
    Prover(String),
    #[error("serialization error: {0}")]
    /// Proof or log encoding failure.
    Serialization(String),
    #[error(transparent)]
    /// Membership map could not produce a consistent proof.
    Map(#[from] MapError),
    #[error(transparent)]
    /// Group store failure.
    Store(#[from] StoreError),
    #[error(transparent)]
    /// Ballot key material could not be used.
    Signal(SignalError),
    #[error(transparent)]
    /// Identity record could not be used.
    Identity(#[from] IdentityError),
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Groth16Backend, DEFAULT_SETUP_SEED};
    use once_cell::sync::Lazy;

    /// Key generation is the slow part of every proving test; share one set.
    pub(crate) static BACKEND: Lazy<Groth16Backend> =
        Lazy::new(|| Groth16Backend::setup(DEFAULT_SETUP_SEED).expect("setup"));
}
