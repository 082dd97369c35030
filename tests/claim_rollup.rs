use ark_ff::Zero;
use claim_tally::anchor::{AnchorError, ClaimAccount, ClaimAction, VoteMark};
use claim_tally::encoding::{new_uid, uid_to_element};
use claim_tally::membership::{MapPool, MembershipMap, MembershipStore, MemoryStore, Tier};
use claim_tally::tally::{
    group_roots, step_binding, ClaimGroups, RollupEvidence, StepEvidence, StepKind, StepRecord, Transition,
    TransitionCircuit, DEFAULT_SETUP_SEED,
};
use claim_tally::{
    Ballot, ClaimResult, ClaimState, Element, GroupRoots, Groth16Backend, Identity, ProofBackend, TallyError,
    TallyMachine, TallyProof, TallySession, Vote,
};
use once_cell::sync::Lazy;
use std::num::NonZeroUsize;

static BACKEND: Lazy<Groth16Backend> =
    Lazy::new(|| Groth16Backend::setup(DEFAULT_SETUP_SEED).expect("setup"));

type Session = TallySession<MemoryStore, &'static Groth16Backend>;

struct Claim {
    session: Session,
    groups: ClaimGroups,
    uid: Element,
    electors: Vec<Identity>,
}

/// Unopened claim `uid` with `validators` validators and `auditors` auditors, all assigned.
fn enrolled(uid: Element, validators: usize, auditors: usize) -> Claim {
    let machine = TallyMachine::new(&*BACKEND);
    let store = MembershipStore::new(MemoryStore::new(), MapPool::new(NonZeroUsize::new(16).unwrap()));
    let session = TallySession::new(machine, store);
    let groups = ClaimGroups::for_claim(&uid);

    let mut electors = Vec::new();
    for i in 0..validators + auditors {
        let identity = Identity::create(&format!("elector-{i}"), "605435").unwrap();
        let group = if i < validators {
            &groups.validators
        } else {
            &groups.auditors
        };
        session.enroll(group, identity.commitment).unwrap();
        session.enroll(&groups.electors, identity.commitment).unwrap();
        electors.push(identity);
    }
    Claim {
        session,
        groups,
        uid,
        electors,
    }
}

fn claim(validators: usize, auditors: usize, required_votes: u64, required_positives: u64) -> (Claim, TallyProof) {
    let claim = enrolled(uid_to_element(&new_uid()).unwrap(), validators, auditors);
    let proof = claim.open(required_votes, required_positives);
    (claim, proof)
}

impl Claim {
    fn open(&self, required_votes: u64, required_positives: u64) -> TallyProof {
        self.session
            .open(&self.groups, ClaimState::new(self.uid, required_votes, required_positives))
            .unwrap()
    }

    fn roots(&self) -> GroupRoots {
        self.session.roots(&self.groups).unwrap()
    }

    fn ballot(&self, elector: usize, vote: Vote) -> Ballot {
        Ballot::cast(&self.electors[elector], self.uid, vote).unwrap()
    }

    fn submit(&self, proof: &TallyProof, ballot: &Ballot) -> Result<TallyProof, TallyError> {
        self.session.submit(&self.groups, proof, ballot)
    }
}

fn marks(votes: &[Vote]) -> Vec<VoteMark> {
    votes
        .iter()
        .map(|vote| match vote {
            Vote::Positive => VoteMark::Positive,
            Vote::Negative => VoteMark::Negative,
            Vote::Abstain => VoteMark::Ignored,
        })
        .collect()
}

#[test]
fn n_steps_count_n_votes() {
    let (claim, mut proof) = claim(3, 1, 4, 3);
    let votes = [Vote::Positive, Vote::Negative, Vote::Abstain, Vote::Positive];
    for (i, vote) in votes.iter().enumerate() {
        proof = claim.submit(&proof, &claim.ballot(i, *vote)).unwrap();
        let state = claim.session.machine().verify(&proof).unwrap();
        assert_eq!(state.total, (i + 1) as u64);
        assert_eq!(state.total, state.positives + state.negatives + state.ignored);
    }
    let state = proof.state().unwrap();
    assert_eq!((state.positives, state.negatives, state.ignored), (2, 1, 1));
    assert_eq!(proof.len(), 5);
}

#[test]
fn replayed_nullifier_is_rejected() {
    let (claim, genesis) = claim(2, 0, 2, 1);
    let ballot = claim.ballot(0, Vote::Positive);
    let first = claim.submit(&genesis, &ballot).unwrap();

    assert!(matches!(
        claim.submit(&first, &ballot),
        Err(TallyError::Replay)
    ));
    // Same elector, different vote: same nullifier.
    assert!(matches!(
        claim.submit(&first, &claim.ballot(0, Vote::Negative)),
        Err(TallyError::Replay)
    ));
    let state = claim.session.machine().verify(&first).unwrap();
    assert_eq!((state.total, state.positives), (1, 1));
}

#[test]
fn thresholds_resolve_claim() {
    let cases = [
        (
            vec![Vote::Positive, Vote::Positive, Vote::Positive, Vote::Negative],
            ClaimResult::Approved,
        ),
        (
            vec![Vote::Positive, Vote::Positive, Vote::Negative, Vote::Negative],
            ClaimResult::Rejected,
        ),
        (vec![Vote::Positive, Vote::Negative], ClaimResult::Ignored),
    ];
    for (votes, expected) in cases {
        let (claim, mut proof) = claim(4, 0, 4, 3);
        for (i, vote) in votes.iter().enumerate() {
            proof = claim.submit(&proof, &claim.ballot(i, *vote)).unwrap();
        }
        let closed = claim.session.finalize(&proof).unwrap();
        assert_eq!(closed.state().unwrap().result, expected);

        let mut account = ClaimAccount::new(claim.uid, 4, 3, claim.roots());
        let action = ClaimAction::from_marks(1_700_000_000_000, &marks(&votes)).unwrap();
        assert_eq!(
            account
                .close_voting(claim.session.machine(), &closed, action.clone())
                .unwrap(),
            expected
        );
        assert_eq!(account.result, expected);
        assert_eq!(account.counts().total, votes.len() as u64);
        assert!(matches!(
            account.close_voting(claim.session.machine(), &closed, action),
            Err(AnchorError::AlreadyClosed(_))
        ));
    }
}

#[test]
fn auditors_vote_too() {
    let (claim, genesis) = claim(1, 1, 1, 1);
    let proof = claim.submit(&genesis, &claim.ballot(1, Vote::Positive)).unwrap();
    assert_eq!(proof.state().unwrap().positives, 1);
}

#[test]
fn outsider_fails_membership() {
    let claim = enrolled(uid_to_element(&new_uid()).unwrap(), 1, 0);
    let outsider = Identity::create("outsider", "1").unwrap();
    let unassigned = Identity::create("unassigned", "2").unwrap();
    claim
        .session
        .enroll(&claim.groups.electors, outsider.commitment)
        .unwrap();
    claim
        .session
        .enroll(&claim.groups.validators, unassigned.commitment)
        .unwrap();
    let genesis = claim.open(1, 1);

    let ballot = Ballot::cast(&outsider, claim.uid, Vote::Positive).unwrap();
    assert!(matches!(
        claim.submit(&genesis, &ballot),
        Err(TallyError::NotElector)
    ));
    let ballot = Ballot::cast(&unassigned, claim.uid, Vote::Positive).unwrap();
    assert!(matches!(
        claim.submit(&genesis, &ballot),
        Err(TallyError::NotAssigned)
    ));
}

#[test]
fn enrollment_after_open_does_not_count() {
    let (claim, genesis) = claim(1, 0, 1, 1);
    let late = Identity::create("late", "3").unwrap();
    claim.session.enroll(&claim.groups.validators, late.commitment).unwrap();
    claim.session.enroll(&claim.groups.electors, late.commitment).unwrap();
    let ballot = Ballot::cast(&late, claim.uid, Vote::Positive).unwrap();
    assert!(matches!(
        claim.submit(&genesis, &ballot),
        Err(TallyError::RootMismatch)
    ));
}

#[test]
fn ballot_pin_must_open_the_elector() {
    let (claim, genesis) = claim(1, 0, 1, 1);
    let mut ballot = claim.ballot(0, Vote::Positive);
    ballot.pin = Element::from(1u64);
    assert!(matches!(
        claim.submit(&genesis, &ballot),
        Err(TallyError::KeyMismatch)
    ));
}

#[test]
fn hand_built_rollup_without_evidence_is_refused() {
    let (claim, genesis) = claim(1, 0, 1, 1);
    let machine = claim.session.machine();
    let roots = claim.roots();
    let state = genesis.state().unwrap().clone();
    let counted = state.with_vote(Vote::Positive);
    let prior = genesis.head().unwrap().step_id.clone();
    let evidence = StepEvidence {
        groups: Some(roots),
        nullifier_root: Some(MembershipMap::new(Tier::Small).root()),
        nullifier: Some(Element::from(4242u64)),
    };

    // The prover refuses a rollup whose evidence opens nothing.
    let mut blank = RollupEvidence::blank(roots.member_tier, roots.claim_tier);
    blank.groups = roots;
    blank.nullifier_root = evidence.nullifier_root.unwrap();
    blank.nullifier = evidence.nullifier.unwrap();
    blank.vote = Vote::Positive.to_element();
    let circuit = TransitionCircuit {
        transition: Transition::Rollup(Box::new(blank)),
        input: state.to_elements(),
        output: counted.to_elements(),
        binding: step_binding(Some(&prior), StepKind::Rollup, &evidence),
    };
    assert!(!circuit.is_satisfied().unwrap());
    assert!(matches!(BACKEND.prove(circuit.into()), Err(TallyError::Prover(_))));

    // A record reusing another step's proof does not verify either.
    let reused = genesis.head().unwrap().proof_bytes().unwrap();
    let forged = genesis.extended(StepRecord::new(
        Some(prior),
        StepKind::Rollup,
        state,
        counted,
        evidence,
        &reused,
    ));
    assert!(matches!(machine.verify(&forged), Err(TallyError::ChainBroken(_))));
    assert!(matches!(
        claim.session.finalize(&forged),
        Err(TallyError::ChainBroken(_))
    ));
}

#[test]
fn account_refuses_tallies_over_foreign_groups() {
    let (claim, genesis) = claim(2, 0, 1, 1);
    let honest_roots = claim.roots();

    // Same claim uid, groups filled with the aggregator's own identities.
    let rogue = enrolled(claim.uid, 1, 0);
    let rogue_genesis = rogue.open(1, 1);
    let counted = rogue.submit(&rogue_genesis, &rogue.ballot(0, Vote::Positive)).unwrap();
    let closed = rogue.session.finalize(&counted).unwrap();
    assert_eq!(closed.state().unwrap().result, ClaimResult::Approved);

    let machine = claim.session.machine();
    assert!(machine.verify(&closed).is_ok());
    assert!(matches!(
        machine.verify_pinned(&closed, &honest_roots),
        Err(TallyError::RootMismatch)
    ));
    let mut account = ClaimAccount::new(claim.uid, 1, 1, honest_roots);
    let action = ClaimAction::from_marks(0, &[VoteMark::Positive]).unwrap();
    assert!(matches!(
        account.close_voting(machine, &closed, action.clone()),
        Err(AnchorError::RootMismatch)
    ));
    assert_eq!(account.result, ClaimResult::Voting);

    // The honest log still closes the account.
    let counted = claim.submit(&genesis, &claim.ballot(1, Vote::Positive)).unwrap();
    let closed = claim.session.finalize(&counted).unwrap();
    assert_eq!(account.close_voting(machine, &closed, action).unwrap(), ClaimResult::Approved);
}

#[test]
fn verified_heads_are_bounded() {
    let machine = TallyMachine::with_head_capacity(&*BACKEND, 2);
    let empty = MembershipMap::new(Tier::Small);
    let roots = group_roots(&empty, &empty, &empty).unwrap();
    let proofs: Vec<TallyProof> = (0..4)
        .map(|_| {
            let uid = uid_to_element(&new_uid()).unwrap();
            machine.init(ClaimState::new(uid, 1, 1), roots).unwrap()
        })
        .collect();
    assert_eq!(machine.cached_heads(), 2);
    for result in machine.verify_many(&proofs) {
        assert!(result.is_ok());
    }
    assert_eq!(machine.cached_heads(), 2);
}

#[test]
fn tampered_ballots_fail_crypto_checks() {
    let (claim, genesis) = claim(2, 0, 2, 1);

    let mut mutated = claim.ballot(0, Vote::Positive);
    mutated.vote = Vote::Negative.to_element();
    assert!(matches!(
        claim.submit(&genesis, &mutated),
        Err(TallyError::SignalMismatch)
    ));

    let mut forged = claim.ballot(0, Vote::Positive);
    forged.signature = claim.ballot(1, Vote::Positive).signature;
    assert!(matches!(
        claim.submit(&genesis, &forged),
        Err(TallyError::BadSignature)
    ));

    let mut out_of_domain = claim.ballot(0, Vote::Positive);
    out_of_domain.vote = Element::from(2u64);
    assert!(matches!(
        claim.submit(&genesis, &out_of_domain),
        Err(TallyError::VoteOutOfDomain)
    ));

    // Nothing was recorded by the failed steps.
    assert!(claim.submit(&genesis, &claim.ballot(0, Vote::Positive)).is_ok());
}

#[test]
fn final_runs_once_and_closes_the_chain() {
    let (claim, genesis) = claim(2, 0, 1, 1);
    let proof = claim.submit(&genesis, &claim.ballot(0, Vote::Positive)).unwrap();
    let closed = claim.session.finalize(&proof).unwrap();
    assert_eq!(closed.state().unwrap().result, ClaimResult::Approved);

    assert!(matches!(
        claim.session.finalize(&closed),
        Err(TallyError::NotVoting(ClaimResult::Approved))
    ));
    assert!(matches!(
        claim.submit(&closed, &claim.ballot(1, Vote::Negative)),
        Err(TallyError::NotVoting(_))
    ));

    let mut account = ClaimAccount::new(claim.uid, 1, 1, claim.roots());
    let action = ClaimAction::from_marks(0, &[VoteMark::Positive]).unwrap();
    assert!(matches!(
        account.close_voting(claim.session.machine(), &proof, action),
        Err(AnchorError::NotFinal)
    ));
}

#[test]
fn tampered_logs_do_not_verify() {
    let (claim, genesis) = claim(2, 0, 2, 1);
    let proof = claim.submit(&genesis, &claim.ballot(0, Vote::Negative)).unwrap();
    let machine = claim.session.machine();

    let mut inflated = proof.clone();
    inflated.steps[1].output.positives = 1;
    inflated.steps[1].output.negatives = 0;

    let mut truncated = proof.clone();
    truncated.steps.remove(0);

    let restored = TallyProof::from_json(&proof.to_json().unwrap()).unwrap();
    let results = machine.verify_many(&[restored, inflated, truncated]);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(TallyError::ChainBroken(_))));
    assert!(matches!(results[2], Err(TallyError::ChainBroken(_))));

    // A log verified by a machine that never saw it.
    let fresh = TallyMachine::new(&*BACKEND);
    assert_eq!(fresh.verify(&proof).unwrap().negatives, 1);
}

#[test]
fn invalid_genesis_is_rejected() {
    let machine = TallyMachine::new(&*BACKEND);
    let uid = uid_to_element(&new_uid()).unwrap();
    let empty = MembershipMap::new(Tier::Small);
    let roots = group_roots(&empty, &empty, &empty).unwrap();
    assert!(matches!(
        machine.init(ClaimState::new(uid, 2, 3), roots),
        Err(TallyError::InvalidGenesis(_))
    ));
    assert!(matches!(
        machine.init(ClaimState::new(Element::zero(), 2, 1), roots),
        Err(TallyError::InvalidGenesis(_))
    ));
}

#[test]
fn claim_opens_over_an_unused_nullifier_group() {
    let (claim, genesis) = claim(1, 0, 1, 1);
    claim.submit(&genesis, &claim.ballot(0, Vote::Positive)).unwrap();
    assert!(matches!(
        claim.session.open(&claim.groups, ClaimState::new(claim.uid, 1, 1)),
        Err(TallyError::StaleNullifiers)
    ));
}
