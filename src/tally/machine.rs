//! The tally state machine: `init`, `rollup`, `finalize`.
//!
//! Every step first validates its inputs, then proves the transition.  A step
//! that fails any check returns an error and yields no record, so the previous
//! log stays the latest valid tally.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;

use super::backend::ProofBackend;
use super::chain::{step_binding, verify_chain, ChainHead, GroupRoots, StepEvidence, StepRecord, TallyProof};
use super::circuit::{RollupEvidence, Transition, TransitionCircuit};
use super::state::{ClaimResult, ClaimState};
use super::TallyError;
use crate::encoding::Element;
use crate::identity::commitment_from_parts;
use crate::membership::{InclusionProof, MapError, MembershipMap};
use crate::signal::{decode_signature, verify_signal_signature, vote_signal, Ballot, SignalError, Vote};

/// Claims whose last verified head a machine remembers by default.
pub const VERIFIED_HEADS: usize = 1024;

/// Groups and ballot consumed by one rollup step.
#[derive(Debug, Clone, Copy)]
pub struct RollupWitness<'a> {
    /// All validators.
    pub validators: &'a MembershipMap,
    /// All auditors.
    pub auditors: &'a MembershipMap,
    /// Electors assigned to the claim.
    pub claim_electors: &'a MembershipMap,
    /// Nullifiers already counted for the claim.
    pub claim_nullifiers: &'a MembershipMap,
    /// The vote being counted.
    pub ballot: &'a Ballot,
}

impl RollupWitness<'_> {
    /// Roots of the member and claim groups.
    pub fn groups(&self) -> Result<GroupRoots, TallyError> {
        group_roots(self.validators, self.auditors, self.claim_electors)
    }

    /// Runs the membership, replay, signal and signature checks for a vote
    /// on `claim_uid` and collects the rollup circuit witness.
    pub fn evidence(&self, claim_uid: &Element) -> Result<RollupEvidence, TallyError> {
        let groups = self.groups()?;
        if self.claim_nullifiers.tier() != groups.claim_tier {
            return Err(TallyError::TierMismatch);
        }
        let ballot = self.ballot;

        let (is_auditor, membership) = match member_path(self.validators, &ballot.elector)? {
            Some(path) => (false, path),
            None => match member_path(self.auditors, &ballot.elector)? {
                Some(path) => (true, path),
                None => return Err(TallyError::NotElector),
            },
        };
        let assignment = member_path(self.claim_electors, &ballot.elector)?.ok_or(TallyError::NotAssigned)?;
        if let Err(err) = self.claim_nullifiers.assert_not_included(&ballot.nullifier) {
            return Err(match err {
                MapError::Included => TallyError::Replay,
                err => err.into(),
            });
        }
        let exclusion = self.claim_nullifiers.prove_excluded(&ballot.nullifier)?;

        Vote::from_element(&ballot.vote).map_err(|_| TallyError::VoteOutOfDomain)?;
        if vote_signal(claim_uid, &ballot.elector, &ballot.vote) != ballot.signal {
            return Err(TallyError::SignalMismatch);
        }
        let public_key = ballot.public_key().map_err(|_| TallyError::BadSignature)?;
        match verify_signal_signature(&public_key, &ballot.signal, &ballot.nullifier, &ballot.signature) {
            Ok(()) => {}
            Err(SignalError::BadSignature | SignalError::Decode(_) | SignalError::Key(_)) => {
                return Err(TallyError::BadSignature)
            }
            Err(err) => return Err(TallyError::Signal(err)),
        }
        if commitment_from_parts(&public_key, &ballot.pin) != ballot.elector {
            return Err(TallyError::KeyMismatch);
        }
        let signature = decode_signature(&ballot.signature).map_err(|_| TallyError::BadSignature)?;

        Ok(RollupEvidence {
            groups,
            nullifier_root: self.claim_nullifiers.root(),
            nullifier: ballot.nullifier,
            public_key: *public_key.point(),
            pin: ballot.pin,
            is_auditor,
            membership,
            assignment,
            exclusion,
            signature,
            vote: ballot.vote,
        })
    }
}

/// Roots of a claim's groups; each pair of maps must share a tier.
pub fn group_roots(
    validators: &MembershipMap,
    auditors: &MembershipMap,
    claim_electors: &MembershipMap,
) -> Result<GroupRoots, TallyError> {
    if validators.tier() != auditors.tier() {
        return Err(TallyError::TierMismatch);
    }
    Ok(GroupRoots {
        member_tier: validators.tier(),
        claim_tier: claim_electors.tier(),
        validators: validators.root(),
        auditors: auditors.root(),
        claim_electors: claim_electors.root(),
    })
}

fn member_path(map: &MembershipMap, key: &Element) -> Result<Option<InclusionProof>, TallyError> {
    match map.assert_included(key) {
        Ok(()) => Ok(Some(map.prove_included(key)?)),
        Err(MapError::NotIncluded) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Last verified step id per claim, oldest claim evicted first.
struct HeadCache {
    capacity: usize,
    heads: HashMap<Element, String>,
    order: VecDeque<Element>,
}

impl HeadCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heads: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, claim_uid: Element, step_id: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.heads.insert(claim_uid, step_id.to_string()).is_none() {
            self.order.push_back(claim_uid);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.heads.remove(&evicted);
            }
        }
    }

    /// Steps of `proof` already verified: through the cached head, inclusive.
    fn verified_prefix(&self, proof: &TallyProof) -> usize {
        proof
            .steps
            .first()
            .and_then(|genesis| self.heads.get(&genesis.input.claim_uid))
            .and_then(|head| proof.steps.iter().position(|step| step.step_id == *head))
            .map(|position| position + 1)
            .unwrap_or(0)
    }
}

/// Drives claims through the tally transitions using a proof backend.
pub struct TallyMachine<B> {
    backend: B,
    verified: Mutex<HeadCache>,
}

impl<B: ProofBackend> TallyMachine<B> {
    /// Wraps a backend.
    pub fn new(backend: B) -> Self {
        Self::with_head_capacity(backend, VERIFIED_HEADS)
    }

    /// Wraps a backend, remembering verified heads for at most `capacity` claims.
    pub fn with_head_capacity(backend: B, capacity: usize) -> Self {
        Self {
            backend,
            verified: Mutex::new(HeadCache::new(capacity)),
        }
    }

    /// Underlying proof backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of claims with a remembered verified head.
    pub fn cached_heads(&self) -> usize {
        self.verified.lock().map(|cache| cache.heads.len()).unwrap_or(0)
    }

    fn remember(&self, claim_uid: Element, step_id: &str) {
        if let Ok(mut cache) = self.verified.lock() {
            cache.record(claim_uid, step_id);
        }
    }

    fn verified_prefix(&self, proof: &TallyProof) -> usize {
        self.verified
            .lock()
            .map(|cache| cache.verified_prefix(proof))
            .unwrap_or(0)
    }

    fn prove_step(
        &self,
        previous: Option<&TallyProof>,
        transition: Transition,
        input: ClaimState,
        output: ClaimState,
        evidence: StepEvidence,
    ) -> Result<TallyProof, TallyError> {
        let kind = transition.kind();
        let prior_step_id = previous
            .and_then(|proof| proof.head())
            .map(|step| step.step_id.clone());
        let binding = step_binding(prior_step_id.as_deref(), kind, &evidence);
        let circuit = TransitionCircuit {
            transition,
            input: input.to_elements(),
            output: output.to_elements(),
            binding,
        };
        let proof = self.backend.prove(circuit.into())?;
        let claim_uid = input.claim_uid;
        let record = StepRecord::new(prior_step_id, kind, input, output, evidence, &proof);
        self.remember(claim_uid, &record.step_id);
        Ok(match previous {
            Some(previous) => previous.extended(record),
            None => TallyProof { steps: vec![record] },
        })
    }

    fn verify_head(&self, proof: &TallyProof, expected: Option<&GroupRoots>) -> Result<ChainHead, TallyError> {
        let head = verify_chain(proof, &self.backend, expected, self.verified_prefix(proof))?;
        if let Some(step) = proof.head() {
            self.remember(head.state.claim_uid, &step.step_id);
        }
        Ok(head)
    }

    /// Verifies a log back to genesis and returns its head state.
    pub fn verify(&self, proof: &TallyProof) -> Result<ClaimState, TallyError> {
        Ok(self.verify_head(proof, None)?.state)
    }

    /// Like [`TallyMachine::verify`], also requiring genesis roots `groups`.
    pub fn verify_pinned(&self, proof: &TallyProof, groups: &GroupRoots) -> Result<ClaimState, TallyError> {
        Ok(self.verify_head(proof, Some(groups))?.state)
    }

    /// Verifies independent claim logs, in parallel where threads exist.
    pub fn verify_many(&self, proofs: &[TallyProof]) -> Vec<Result<ClaimState, TallyError>> {
        #[cfg(not(target_arch = "wasm32"))]
        {
            proofs.par_iter().map(|proof| self.verify(proof)).collect()
        }
        #[cfg(target_arch = "wasm32")]
        {
            proofs.iter().map(|proof| self.verify(proof)).collect()
        }
    }

    /// Opens a claim at its genesis state over `groups`.
    pub fn init(&self, state: ClaimState, groups: GroupRoots) -> Result<TallyProof, TallyError> {
        if let Err(err) = state.check_genesis() {
            warn!(claim = %state.uid(), error = %err, "init rejected");
            return Err(err);
        }
        let evidence = StepEvidence {
            groups: Some(groups),
            ..StepEvidence::default()
        };
        let proof = self.prove_step(None, Transition::Init, state.clone(), state.clone(), evidence)?;
        info!(
            claim = %state.uid(),
            required_votes = state.required_votes,
            required_positives = state.required_positives,
            members = %groups.member_tier,
            electors = %groups.claim_tier,
            "claim opened"
        );
        Ok(proof)
    }

    /// Counts one ballot on top of `previous`, whose head must be `state`.
    pub fn rollup(
        &self,
        state: &ClaimState,
        previous: &TallyProof,
        witness: RollupWitness<'_>,
    ) -> Result<TallyProof, TallyError> {
        let result = self.rollup_inner(state, previous, &witness);
        match &result {
            Ok(proof) => {
                if let Some(head) = proof.state() {
                    info!(
                        claim = %head.uid(),
                        total = head.total,
                        positives = head.positives,
                        negatives = head.negatives,
                        ignored = head.ignored,
                        "rollup step accepted"
                    );
                }
            }
            Err(err) => warn!(claim = %state.uid(), error = %err, "rollup step rejected"),
        }
        result
    }

    fn rollup_inner(
        &self,
        state: &ClaimState,
        previous: &TallyProof,
        witness: &RollupWitness<'_>,
    ) -> Result<TallyProof, TallyError> {
        let chain = self.verify_head(previous, None)?;
        let head = chain.state;
        if head != *state {
            return Err(TallyError::ChainBroken("state does not match the log head".into()));
        }
        if head.result.is_terminal() {
            return Err(TallyError::NotVoting(head.result));
        }
        if witness.groups()? != chain.groups || witness.claim_nullifiers.root() != chain.nullifier_root {
            return Err(TallyError::RootMismatch);
        }

        let evidence = witness.evidence(&head.claim_uid)?;
        let vote = Vote::from_element(&evidence.vote).map_err(|_| TallyError::VoteOutOfDomain)?;
        debug!(claim = %head.uid(), %vote, auditor = evidence.is_auditor, "counting vote");
        let output = head.with_vote(vote);
        let step = StepEvidence {
            groups: Some(evidence.groups),
            nullifier_root: Some(evidence.nullifier_root),
            nullifier: Some(evidence.nullifier),
        };
        self.prove_step(Some(previous), Transition::Rollup(Box::new(evidence)), head, output, step)
    }

    /// Resolves the claim; refuses a log whose head is already terminal.
    pub fn finalize(&self, state: &ClaimState, previous: &TallyProof) -> Result<TallyProof, TallyError> {
        let head = self.verify(previous)?;
        if head != *state {
            return Err(TallyError::ChainBroken("state does not match the log head".into()));
        }
        if head.result != ClaimResult::Voting {
            warn!(claim = %head.uid(), result = %head.result, "finalize rejected");
            return Err(TallyError::NotVoting(head.result));
        }
        let output = head.resolved();
        let result = output.result;
        let proof = self.prove_step(Some(previous), Transition::Final, head.clone(), output, StepEvidence::default())?;
        info!(claim = %head.uid(), total = head.total, %result, "claim resolved");
        Ok(proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::StepKind;

    fn e(n: u64) -> Element {
        Element::from(n)
    }

    fn log(claim: u64, ids: &[&str]) -> TallyProof {
        let state = ClaimState::new(e(claim), 1, 1);
        let steps = ids
            .iter()
            .map(|id| {
                let mut step =
                    StepRecord::new(None, StepKind::Init, state.clone(), state.clone(), StepEvidence::default(), b"");
                step.step_id = id.to_string();
                step
            })
            .collect();
        TallyProof { steps }
    }

    #[test]
    fn head_cache_covers_the_prefix_through_the_cached_head() {
        let mut cache = HeadCache::new(4);
        let proof = log(1, &["a", "b", "c"]);
        assert_eq!(cache.verified_prefix(&proof), 0);
        cache.record(e(1), "b");
        assert_eq!(cache.verified_prefix(&proof), 2);
        cache.record(e(1), "c");
        assert_eq!(cache.verified_prefix(&proof), 3);
        assert_eq!(cache.verified_prefix(&log(1, &["x", "y"])), 0);
        assert_eq!(cache.heads.len(), 1);
    }

    #[test]
    fn head_cache_is_bounded() {
        let mut cache = HeadCache::new(2);
        for claim in 1..=5 {
            cache.record(e(claim), "head");
        }
        assert_eq!(cache.heads.len(), 2);
        assert_eq!(cache.order.len(), 2);
        assert!(cache.heads.contains_key(&e(4)));
        assert!(cache.heads.contains_key(&e(5)));
        assert_eq!(cache.verified_prefix(&log(1, &["head"])), 0);

        let mut disabled = HeadCache::new(0);
        disabled.record(e(1), "head");
        assert!(disabled.heads.is_empty());
    }
}
