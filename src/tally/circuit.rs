//! R1CS constraints for the three tally transitions.
//!
//! Public inputs, in allocation order: the eight input state elements, the
//! eight output state elements, then the step binding.  A rollup step appends
//! the validators, auditors and claim electors roots, the claim nullifiers
//! root before the step and the nullifier it consumes.  Its vote, the
//! elector's key, pin and signature, and the three map paths are private
//! witnesses.

use ark_bn254::Fr;
use ark_ec::AffineRepr;
use ark_ed_on_bn254::{EdwardsAffine, Fr as Scalar};
use ark_ff::Zero;
use ark_r1cs_std::{
    alloc::AllocVar,
    boolean::Boolean,
    eq::EqGadget,
    fields::{fp::FpVar, FieldVar},
};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystem, ConstraintSystemRef, SynthesisError};
use std::cmp::Ordering;

use super::backend::CircuitShape;
use super::chain::{GroupRoots, StepKind};
use super::state::{ClaimResult, STATE_WIDTH};
use crate::encoding::Element;
use crate::gadgets::{enforce_signature, HashGadget, LeafPathVar, PointVar};
use crate::keys::{Purpose, Signature};
use crate::membership::{ExclusionProof, InclusionProof, Leaf, Tier};

const UID: usize = 0;
const POSITIVES: usize = 1;
const NEGATIVES: usize = 2;
const IGNORED: usize = 3;
const TOTAL: usize = 4;
const RESULT: usize = 5;
const REQUIRED_VOTES: usize = 6;
const REQUIRED_POSITIVES: usize = 7;

/// Synthesizes `circuit` locally and reports whether it is satisfied.
pub fn satisfied<C: ConstraintSynthesizer<Fr>>(circuit: C) -> Result<bool, SynthesisError> {
    let cs = ConstraintSystem::<Fr>::new_ref();
    circuit.generate_constraints(cs.clone())?;
    cs.is_satisfied()
}

/// Everything a rollup proof shows about the counted ballot.
#[derive(Debug, Clone)]
pub struct RollupEvidence {
    /// Group roots the elector is checked against.
    pub groups: GroupRoots,
    /// Claim nullifiers root before the step.
    pub nullifier_root: Element,
    /// Nullifier consumed by the step.
    pub nullifier: Element,
    /// Elector public key.
    pub public_key: EdwardsAffine,
    /// Pin opening the elector commitment.
    pub pin: Element,
    /// Whether `membership` is a path into the auditors map.
    pub is_auditor: bool,
    /// Elector commitment in the validators or auditors map.
    pub membership: InclusionProof,
    /// Elector commitment in the claim electors map.
    pub assignment: InclusionProof,
    /// Low leaf bracketing the nullifier in the claim nullifiers map.
    pub exclusion: ExclusionProof,
    /// Signature over `(signal, nullifier)`.
    pub signature: Signature,
    /// Vote element.
    pub vote: Element,
}

impl RollupEvidence {
    /// Placeholder assignment of the right shape, for key generation.
    pub fn blank(members: Tier, claim: Tier) -> Self {
        let zero = Element::zero();
        let generator = EdwardsAffine::generator();
        let path = |tier: Tier| InclusionProof {
            leaf: Leaf::default(),
            siblings: vec![zero; tier.depth()],
        };
        Self {
            groups: GroupRoots {
                member_tier: members,
                claim_tier: claim,
                validators: zero,
                auditors: zero,
                claim_electors: zero,
            },
            nullifier_root: zero,
            nullifier: zero,
            public_key: generator,
            pin: zero,
            is_auditor: false,
            membership: path(members),
            assignment: path(claim),
            exclusion: ExclusionProof {
                low_leaf: Leaf::default(),
                siblings: vec![zero; claim.depth()],
            },
            signature: Signature {
                nonce_point: generator,
                response: Scalar::zero(),
            },
            vote: zero,
        }
    }

    /// Public inputs appended after the binding.
    pub fn public_inputs(&self) -> [Element; 5] {
        [
            self.groups.validators,
            self.groups.auditors,
            self.groups.claim_electors,
            self.nullifier_root,
            self.nullifier,
        ]
    }
}

/// Which transition is proved, with its private witness.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Genesis.
    Init,
    /// One counted ballot.
    Rollup(Box<RollupEvidence>),
    /// Result resolution.
    Final,
}

impl Transition {
    /// Step kind this transition proves.
    pub fn kind(&self) -> StepKind {
        match self {
            Transition::Init => StepKind::Init,
            Transition::Rollup(_) => StepKind::Rollup,
            Transition::Final => StepKind::Final,
        }
    }
}

/// Assignment for one transition proof.
#[derive(Debug, Clone)]
pub struct TransitionCircuit {
    /// Transition and witness.
    pub transition: Transition,
    /// Input state elements.
    pub input: [Element; STATE_WIDTH],
    /// Output state elements.
    pub output: [Element; STATE_WIDTH],
    /// Hash binding the step to its chain position.
    pub binding: Element,
}

impl TransitionCircuit {
    /// All-zero assignment used for key generation.
    pub fn blank(transition: Transition) -> Self {
        Self {
            transition,
            input: [Element::zero(); STATE_WIDTH],
            output: [Element::zero(); STATE_WIDTH],
            binding: Element::zero(),
        }
    }

    /// Step kind proved by this circuit.
    pub fn kind(&self) -> StepKind {
        self.transition.kind()
    }

    /// Key set this circuit is proved under.
    pub fn shape(&self) -> CircuitShape {
        match &self.transition {
            Transition::Init => CircuitShape::Init,
            Transition::Rollup(evidence) => evidence.groups.shape(),
            Transition::Final => CircuitShape::Final,
        }
    }

    /// Public inputs in the order the verifier expects them.
    pub fn public_inputs(&self) -> Vec<Element> {
        let mut inputs = Vec::with_capacity(2 * STATE_WIDTH + 6);
        inputs.extend_from_slice(&self.input);
        inputs.extend_from_slice(&self.output);
        inputs.push(self.binding);
        if let Transition::Rollup(evidence) = &self.transition {
            inputs.extend(evidence.public_inputs());
        }
        inputs
    }

    /// Synthesizes the circuit locally and reports whether it is satisfied.
    pub fn is_satisfied(&self) -> Result<bool, SynthesisError> {
        satisfied(self.clone())
    }
}

fn alloc_state(
    cs: &ConstraintSystemRef<Fr>,
    values: &[Element; STATE_WIDTH],
) -> Result<Vec<FpVar<Fr>>, SynthesisError> {
    values
        .iter()
        .map(|value| FpVar::new_input(cs.clone(), || Ok(*value)))
        .collect()
}

fn constant(value: u64) -> FpVar<Fr> {
    FpVar::constant(Fr::from(value))
}

fn enforce_carried(
    input: &[FpVar<Fr>],
    output: &[FpVar<Fr>],
    fields: &[usize],
) -> Result<(), SynthesisError> {
    for field in fields {
        input[*field].enforce_equal(&output[*field])?;
    }
    Ok(())
}

fn enforce_init(input: &[FpVar<Fr>], output: &[FpVar<Fr>]) -> Result<(), SynthesisError> {
    enforce_carried(input, output, &(0..STATE_WIDTH).collect::<Vec<_>>())?;
    let zero = FpVar::<Fr>::zero();
    for field in [POSITIVES, NEGATIVES, IGNORED, TOTAL] {
        input[field].enforce_equal(&zero)?;
    }
    input[RESULT].enforce_equal(&constant(ClaimResult::Voting.code()))?;
    input[UID].enforce_not_equal(&zero)?;
    input[REQUIRED_VOTES].enforce_not_equal(&zero)?;
    input[REQUIRED_POSITIVES].enforce_not_equal(&zero)?;
    input[REQUIRED_VOTES].enforce_cmp(&input[REQUIRED_POSITIVES], Ordering::Greater, true)
}

fn enforce_count(input: &[FpVar<Fr>], output: &[FpVar<Fr>], vote: &FpVar<Fr>) -> Result<(), SynthesisError> {
    enforce_carried(input, output, &[UID, REQUIRED_VOTES, REQUIRED_POSITIVES, RESULT])?;
    input[RESULT].enforce_equal(&constant(ClaimResult::Voting.code()))?;

    let is_positive = vote.is_eq(&constant(1))?;
    let is_negative = vote.is_eq(&FpVar::constant(-Fr::from(1u64)))?;
    let is_abstain = vote.is_eq(&FpVar::zero())?;
    is_positive
        .or(&is_negative)?
        .or(&is_abstain)?
        .enforce_equal(&Boolean::TRUE)?;

    output[POSITIVES].enforce_equal(&(&input[POSITIVES] + FpVar::from(is_positive)))?;
    output[NEGATIVES].enforce_equal(&(&input[NEGATIVES] + FpVar::from(is_negative)))?;
    output[IGNORED].enforce_equal(&(&input[IGNORED] + FpVar::from(is_abstain)))?;
    let sum = &output[POSITIVES] + &output[NEGATIVES] + &output[IGNORED];
    output[TOTAL].enforce_equal(&sum)
}

fn enforce_rollup(
    cs: &ConstraintSystemRef<Fr>,
    input: &[FpVar<Fr>],
    output: &[FpVar<Fr>],
    evidence: &RollupEvidence,
) -> Result<(), SynthesisError> {
    let public = |value: Element| FpVar::<Fr>::new_input(cs.clone(), || Ok(value));
    let validators = public(evidence.groups.validators)?;
    let auditors = public(evidence.groups.auditors)?;
    let claim_electors = public(evidence.groups.claim_electors)?;
    let nullifier_root = public(evidence.nullifier_root)?;
    let nullifier = public(evidence.nullifier)?;

    let vote = FpVar::new_witness(cs.clone(), || Ok(evidence.vote))?;
    enforce_count(input, output, &vote)?;

    // The elector is whatever commitment the witnessed key and pin open.
    let hasher = HashGadget::new();
    let public_key = PointVar::new_witness(cs.clone(), || Ok(evidence.public_key))?;
    let pin = FpVar::new_witness(cs.clone(), || Ok(evidence.pin))?;
    let elector = hasher.hash_elements(&[public_key.x.clone(), public_key.y.clone(), pin])?;

    let is_auditor = Boolean::new_witness(cs.clone(), || Ok(evidence.is_auditor))?;
    let member_root = is_auditor.select(&auditors, &validators)?;
    let members = evidence.groups.member_tier.depth();
    let claim = evidence.groups.claim_tier.depth();
    LeafPathVar::new_witness(cs.clone(), &evidence.membership.leaf, &evidence.membership.siblings, members)?
        .enforce_includes(&hasher, &elector, &member_root)?;
    LeafPathVar::new_witness(cs.clone(), &evidence.assignment.leaf, &evidence.assignment.siblings, claim)?
        .enforce_includes(&hasher, &elector, &claim_electors)?;
    LeafPathVar::new_witness(cs.clone(), &evidence.exclusion.low_leaf, &evidence.exclusion.siblings, claim)?
        .enforce_excludes(&hasher, &nullifier, &nullifier_root)?;

    let signal = hasher.hash_elements(&[input[UID].clone(), elector, vote])?;
    let nonce_point = PointVar::new_witness(cs.clone(), || Ok(evidence.signature.nonce_point))?;
    let response = FpVar::new_witness(cs.clone(), || Ok(evidence.signature.response_element()))?;
    let message = [FpVar::constant(Purpose::Signal.tag()), signal, nullifier];
    enforce_signature(&hasher, &public_key, &nonce_point, &response, &message)
}

fn enforce_final(input: &[FpVar<Fr>], output: &[FpVar<Fr>]) -> Result<(), SynthesisError> {
    enforce_carried(
        input,
        output,
        &[UID, POSITIVES, NEGATIVES, IGNORED, TOTAL, REQUIRED_VOTES, REQUIRED_POSITIVES],
    )?;
    input[RESULT].enforce_equal(&constant(ClaimResult::Voting.code()))?;

    let quorum = input[TOTAL].is_cmp(&input[REQUIRED_VOTES], Ordering::Greater, true)?;
    let positives = input[POSITIVES].is_cmp(&input[REQUIRED_POSITIVES], Ordering::Greater, true)?;
    // IGNORED + quorum * (1 + positives) yields IGNORED, REJECTED or APPROVED.
    let result = constant(ClaimResult::Ignored.code())
        + FpVar::from(quorum) * (constant(1) + FpVar::from(positives));
    output[RESULT].enforce_equal(&result)
}

impl ConstraintSynthesizer<Fr> for TransitionCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let input = alloc_state(&cs, &self.input)?;
        let output = alloc_state(&cs, &self.output)?;
        let binding = FpVar::new_input(cs.clone(), || Ok(self.binding))?;
        // Put the binding into a constraint so the proof commits to it.
        let _ = binding.square()?;

        match &self.transition {
            Transition::Init => enforce_init(&input, &output),
            Transition::Rollup(evidence) => enforce_rollup(&cs, &input, &output, evidence),
            Transition::Final => enforce_final(&input, &output),
        }
    }
}
