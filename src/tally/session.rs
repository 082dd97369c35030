//! Aggregation session tying the tally machine to stored groups.

use ark_ff::One;
use tracing::debug;

use super::backend::ProofBackend;
use super::chain::GroupRoots;
use super::machine::{group_roots, RollupWitness, TallyMachine};
use super::state::ClaimState;
use super::{TallyError, TallyProof};
use crate::encoding::{element_to_uid, Element};
use crate::membership::{GroupStore, MapOptions, MembershipMap, MembershipStore};
use crate::signal::Ballot;

/// Group ids a claim's steps read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimGroups {
    /// Validators group.
    pub validators: String,
    /// Auditors group.
    pub auditors: String,
    /// Electors assigned to the claim.
    pub electors: String,
    /// Nullifiers counted for the claim.
    pub nullifiers: String,
}

impl ClaimGroups {
    /// Conventional ids: shared `validators`/`auditors`, per-claim electors and nullifiers.
    pub fn for_claim(claim_uid: &Element) -> Self {
        let uid = element_to_uid(claim_uid);
        Self {
            validators: "validators".to_string(),
            auditors: "auditors".to_string(),
            electors: format!("{uid}.electors"),
            nullifiers: format!("{uid}.nullifiers"),
        }
    }
}

/// Owns the map store and tally machine for a run of aggregation jobs.
///
/// One session per claim at a time: submits against the same claim must not
/// interleave.
pub struct TallySession<S, B> {
    machine: TallyMachine<B>,
    store: MembershipStore<S>,
}

impl<S: GroupStore, B: ProofBackend> TallySession<S, B> {
    /// Creates a session.
    pub fn new(machine: TallyMachine<B>, store: MembershipStore<S>) -> Self {
        Self { machine, store }
    }

    /// Tally machine.
    pub fn machine(&self) -> &TallyMachine<B> {
        &self.machine
    }

    /// Map store.
    pub fn store(&self) -> &MembershipStore<S> {
        &self.store
    }

    fn load(&self, group_id: &str) -> Result<MembershipMap, TallyError> {
        Ok(self.store.get_or_create(group_id, MapOptions::default())?)
    }

    /// Adds `commitment` to `group_id` and persists it; returns the new root.
    pub fn enroll(&self, group_id: &str, commitment: Element) -> Result<Element, TallyError> {
        let mut map = self.load(group_id)?;
        map.insert(commitment, Element::one())?;
        self.store.save(group_id, &map)?;
        Ok(map.root())
    }

    /// Current roots of the claim's groups.
    pub fn roots(&self, groups: &ClaimGroups) -> Result<GroupRoots, TallyError> {
        let validators = self.load(&groups.validators)?;
        let auditors = self.load(&groups.auditors)?;
        let claim_electors = self.load(&groups.electors)?;
        group_roots(&validators, &auditors, &claim_electors)
    }

    /// Starts a claim over the groups as they stand; later enrollments do
    /// not count toward it.
    pub fn open(&self, groups: &ClaimGroups, state: ClaimState) -> Result<TallyProof, TallyError> {
        let nullifiers = self.load(&groups.nullifiers)?;
        if !nullifiers.is_empty() {
            return Err(TallyError::StaleNullifiers);
        }
        let roots = self.roots(groups)?;
        if nullifiers.tier() != roots.claim_tier {
            return Err(TallyError::TierMismatch);
        }
        self.machine.init(state, roots)
    }

    /// Counts `ballot` and records its nullifier.
    pub fn submit(
        &self,
        groups: &ClaimGroups,
        previous: &TallyProof,
        ballot: &Ballot,
    ) -> Result<TallyProof, TallyError> {
        let state = previous
            .state()
            .cloned()
            .ok_or_else(|| TallyError::ChainBroken("empty step log".into()))?;
        let validators = self.load(&groups.validators)?;
        let auditors = self.load(&groups.auditors)?;
        let claim_electors = self.load(&groups.electors)?;
        let mut claim_nullifiers = self.load(&groups.nullifiers)?;

        let next = self.machine.rollup(
            &state,
            previous,
            RollupWitness {
                validators: &validators,
                auditors: &auditors,
                claim_electors: &claim_electors,
                claim_nullifiers: &claim_nullifiers,
                ballot,
            },
        )?;
        claim_nullifiers.insert(ballot.nullifier, Element::one())?;
        self.store.save(&groups.nullifiers, &claim_nullifiers)?;
        debug!(group = %groups.nullifiers, size = claim_nullifiers.len(), "nullifier recorded");
        Ok(next)
    }

    /// Resolves the claim.
    pub fn finalize(&self, previous: &TallyProof) -> Result<TallyProof, TallyError> {
        let state = previous
            .state()
            .cloned()
            .ok_or_else(|| TallyError::ChainBroken("empty step log".into()))?;
        self.machine.finalize(&state, previous)
    }

    /// Evicts the claim's per-claim groups from the pool.
    pub fn close(&self, groups: &ClaimGroups) -> Result<(), TallyError> {
        self.store.release(&groups.electors)?;
        self.store.release(&groups.nullifiers)?;
        Ok(())
    }
}
