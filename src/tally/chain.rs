//! Step log standing in for a recursive proof.
//!
//! A [`TallyProof`] is the ordered list of [`StepRecord`]s from `init` to the
//! current head.  Each record names its predecessor by id, carries the input
//! and output states as public data, and holds a transition proof over
//! `(input, output, binding)` plus, for a rollup, the group roots and
//! nullifiers root it was proved against.  Verifying the head means walking
//! the log back to genesis.

use ark_ff::{One, Zero};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use blake2::digest::{consts::U32, Digest};
use blake2::Blake2b;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::backend::{CircuitShape, ProofBackend};
use super::state::{ClaimResult, ClaimState};
use super::TallyError;
use crate::encoding::{element_to_le_bytes, hex_element, hex_element_opt, Element};
use crate::hash::{hash_bytes, hash_elements};
use crate::membership::{MapError, MembershipMap, Tier};

const STEP_DOMAIN: &[u8] = b"CLAIM_TALLY_STEP";

/// Transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Genesis.
    Init,
    /// One counted vote.
    Rollup,
    /// Result resolution.
    Final,
}

impl StepKind {
    /// Lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            StepKind::Init => "init",
            StepKind::Rollup => "rollup",
            StepKind::Final => "final",
        }
    }

    const fn tag(self) -> u64 {
        match self {
            StepKind::Init => 1,
            StepKind::Rollup => 2,
            StepKind::Final => 3,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Group roots a claim is tallied against, fixed by its `init` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRoots {
    /// Tier of the validators and auditors maps.
    pub member_tier: Tier,
    /// Tier of the claim electors and nullifiers maps.
    pub claim_tier: Tier,
    /// Validators group root.
    #[serde(with = "hex_element")]
    pub validators: Element,
    /// Auditors group root.
    #[serde(with = "hex_element")]
    pub auditors: Element,
    /// Claim electors root.
    #[serde(with = "hex_element")]
    pub claim_electors: Element,
}

impl GroupRoots {
    /// Rollup circuit shape for these tiers.
    pub fn shape(&self) -> CircuitShape {
        CircuitShape::Rollup {
            members: self.member_tier,
            claim: self.claim_tier,
        }
    }

    fn elements(&self) -> [Element; 5] {
        [
            Element::from(self.member_tier.depth() as u64),
            Element::from(self.claim_tier.depth() as u64),
            self.validators,
            self.auditors,
            self.claim_electors,
        ]
    }
}

/// One proved transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Hex digest identifying this step.
    pub step_id: String,
    /// Id of the preceding step; `None` only for `init`.
    pub prior_step_id: Option<String>,
    /// Transition kind.
    pub kind: StepKind,
    /// State consumed.
    pub input: ClaimState,
    /// State produced.
    pub output: ClaimState,
    /// Public binding of chain position and evidence.
    #[serde(with = "hex_element")]
    pub binding: Element,
    /// Group roots, set by `init` and repeated by every rollup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<GroupRoots>,
    /// Claim nullifiers root before a rollup step.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_element_opt")]
    pub nullifier_root: Option<Element>,
    /// Nullifier consumed by a rollup step.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_element_opt")]
    pub nullifier: Option<Element>,
    /// Base64 transition proof.
    pub proof: String,
}

/// Evidence a step carries beside its states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepEvidence {
    /// Group roots; `init` and rollup steps.
    pub groups: Option<GroupRoots>,
    /// Nullifiers root before the step; rollup steps.
    pub nullifier_root: Option<Element>,
    /// Consumed nullifier; rollup steps.
    pub nullifier: Option<Element>,
}

/// `hash(hash(priorStepId), kindTag, groups..., nullifierRoot, nullifier)`.
pub fn step_binding(prior_step_id: Option<&str>, kind: StepKind, evidence: &StepEvidence) -> Element {
    let prior = prior_step_id
        .map(|id| hash_bytes(id.as_bytes()))
        .unwrap_or_else(Element::zero);
    let mut inputs = vec![prior, Element::from(kind.tag())];
    if let Some(groups) = &evidence.groups {
        inputs.extend(groups.elements());
    }
    inputs.push(evidence.nullifier_root.unwrap_or_else(Element::zero));
    inputs.push(evidence.nullifier.unwrap_or_else(Element::zero));
    hash_elements(&inputs)
}

impl StepRecord {
    /// Assembles a record and derives its binding and id.
    pub fn new(
        prior_step_id: Option<String>,
        kind: StepKind,
        input: ClaimState,
        output: ClaimState,
        evidence: StepEvidence,
        proof: &[u8],
    ) -> Self {
        let binding = step_binding(prior_step_id.as_deref(), kind, &evidence);
        let mut record = Self {
            step_id: String::new(),
            prior_step_id,
            kind,
            input,
            output,
            binding,
            groups: evidence.groups,
            nullifier_root: evidence.nullifier_root,
            nullifier: evidence.nullifier,
            proof: BASE64.encode(proof),
        };
        record.step_id = record.compute_id();
        record
    }

    /// Evidence fields of the record.
    pub fn evidence(&self) -> StepEvidence {
        StepEvidence {
            groups: self.groups,
            nullifier_root: self.nullifier_root,
            nullifier: self.nullifier,
        }
    }

    /// Proof public inputs: input state, output state, binding, then for a
    /// rollup the group roots, nullifiers root and nullifier.
    pub fn public_inputs(&self) -> Vec<Element> {
        let mut inputs = Vec::with_capacity(22);
        inputs.extend(self.input.to_elements());
        inputs.extend(self.output.to_elements());
        inputs.push(self.binding);
        if self.kind == StepKind::Rollup {
            if let Some(groups) = &self.groups {
                inputs.extend([groups.validators, groups.auditors, groups.claim_electors]);
            }
            inputs.extend(self.nullifier_root);
            inputs.extend(self.nullifier);
        }
        inputs
    }

    /// Key set the step's proof verifies under.
    pub fn shape(&self) -> Result<CircuitShape, TallyError> {
        match (self.kind, &self.groups) {
            (StepKind::Init, _) => Ok(CircuitShape::Init),
            (StepKind::Final, _) => Ok(CircuitShape::Final),
            (StepKind::Rollup, Some(groups)) => Ok(groups.shape()),
            (StepKind::Rollup, None) => Err(TallyError::ChainBroken(format!(
                "rollup step {} carries no group roots",
                self.step_id
            ))),
        }
    }

    /// Decoded proof bytes.
    pub fn proof_bytes(&self) -> Result<Vec<u8>, TallyError> {
        BASE64
            .decode(&self.proof)
            .map_err(|e| TallyError::Serialization(format!("step proof: {e}")))
    }

    fn compute_id(&self) -> String {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(STEP_DOMAIN);
        hasher.update(self.prior_step_id.as_deref().unwrap_or("").as_bytes());
        hasher.update([self.kind.tag() as u8]);
        for element in self.public_inputs() {
            hasher.update(element_to_le_bytes(&element));
        }
        hasher.update(self.proof.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Checks everything about the record that does not need the backend.
    fn check_shape(&self) -> Result<(), TallyError> {
        let broken = |reason: &str| Err(TallyError::ChainBroken(format!("step {}: {reason}", self.step_id)));
        if step_binding(self.prior_step_id.as_deref(), self.kind, &self.evidence()) != self.binding {
            return broken("binding mismatch");
        }
        if self.compute_id() != self.step_id {
            return broken("id mismatch");
        }
        let is_rollup = self.kind == StepKind::Rollup;
        let has_groups = self.kind != StepKind::Final;
        if has_groups != self.groups.is_some()
            || is_rollup != self.nullifier_root.is_some()
            || is_rollup != self.nullifier.is_some()
        {
            return broken("evidence does not match step kind");
        }
        Ok(())
    }
}

/// Ordered step log from `init` to the head.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyProof {
    /// Steps, genesis first.
    pub steps: Vec<StepRecord>,
}

impl TallyProof {
    /// Head step.
    pub fn head(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    /// Claimed head state; trusted only after [`verify_chain`].
    pub fn state(&self) -> Option<&ClaimState> {
        self.head().map(|step| &step.output)
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True for an empty log.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when the head is a final step.
    pub fn is_final(&self) -> bool {
        self.head().map(|step| step.kind == StepKind::Final).unwrap_or(false)
    }

    /// Group roots named by the genesis step.
    pub fn groups(&self) -> Option<&GroupRoots> {
        self.steps.first().and_then(|step| step.groups.as_ref())
    }

    /// Nullifiers consumed so far.
    pub fn nullifiers(&self) -> impl Iterator<Item = &Element> {
        self.steps.iter().filter_map(|step| step.nullifier.as_ref())
    }

    /// Returns a new log with `step` appended.
    pub fn extended(&self, step: StepRecord) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step);
        Self { steps }
    }

    /// JSON text of the log.
    pub fn to_json(&self) -> Result<String, TallyError> {
        serde_json::to_string_pretty(self).map_err(|e| TallyError::Serialization(e.to_string()))
    }

    /// Parses JSON produced by [`TallyProof::to_json`].
    pub fn from_json(input: &str) -> Result<Self, TallyError> {
        serde_json::from_str(input).map_err(|e| TallyError::Serialization(e.to_string()))
    }
}

/// What a verified log establishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    /// Head state.
    pub state: ClaimState,
    /// Group roots fixed at genesis.
    pub groups: GroupRoots,
    /// Claim nullifiers root after every counted nullifier.
    pub nullifier_root: Element,
}

/// Walks the log from genesis and returns the verified head.
///
/// With `expected` set, the genesis group roots must equal it.  Backend
/// verification is skipped for the first `verified_prefix` steps, which the
/// caller has verified before; structural checks always run.
pub fn verify_chain<B>(
    proof: &TallyProof,
    backend: &B,
    expected: Option<&GroupRoots>,
    verified_prefix: usize,
) -> Result<ChainHead, TallyError>
where
    B: ProofBackend + ?Sized,
{
    let genesis = proof
        .steps
        .first()
        .ok_or_else(|| TallyError::ChainBroken("empty step log".into()))?;
    if genesis.kind != StepKind::Init || genesis.prior_step_id.is_some() {
        return Err(TallyError::ChainBroken("log does not start with init".into()));
    }
    genesis.input.check_genesis()?;
    genesis.check_shape()?;
    let groups = genesis
        .groups
        .ok_or_else(|| TallyError::ChainBroken("init carries no group roots".into()))?;
    if expected.is_some_and(|expected| *expected != groups) {
        return Err(TallyError::RootMismatch);
    }

    // Nullifier roots are replayed from an empty map; each rollup must name
    // the root left by the steps before it.
    let mut spent = MembershipMap::new(groups.claim_tier);
    let mut previous: Option<&StepRecord> = None;
    for (position, step) in proof.steps.iter().enumerate() {
        step.check_shape()?;
        if let Some(prev) = previous {
            if prev.kind == StepKind::Final {
                return Err(TallyError::ChainBroken("step follows a final step".into()));
            }
            if step.kind == StepKind::Init {
                return Err(TallyError::ChainBroken("init after genesis".into()));
            }
            if step.prior_step_id.as_deref() != Some(prev.step_id.as_str()) {
                return Err(TallyError::ChainBroken(format!("step {} is not linked to its predecessor", step.step_id)));
            }
            if step.input != prev.output {
                return Err(TallyError::ChainBroken(format!("step {} input differs from prior output", step.step_id)));
            }
        }
        if step.kind == StepKind::Rollup {
            if step.groups != Some(groups) {
                return Err(TallyError::ChainBroken(format!("step {} changes the group roots", step.step_id)));
            }
            if step.nullifier_root != Some(spent.root()) {
                return Err(TallyError::ChainBroken(format!(
                    "step {} nullifiers root does not follow from earlier steps",
                    step.step_id
                )));
            }
            if let Some(nullifier) = step.nullifier {
                match spent.insert(nullifier, Element::one()) {
                    Ok(()) => {}
                    Err(MapError::KeyExists) => return Err(TallyError::Replay),
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if position >= verified_prefix
            && !backend.verify(step.shape()?, &step.public_inputs(), &step.proof_bytes()?)?
        {
            return Err(TallyError::ChainBroken(format!("{} proof for step {} does not verify", step.kind, step.step_id)));
        }
        previous = Some(step);
    }
    let head = previous.ok_or_else(|| TallyError::ChainBroken("empty step log".into()))?;
    if head.kind == StepKind::Final && head.output.result == ClaimResult::Voting {
        return Err(TallyError::ChainBroken("final step left claim open".into()));
    }
    Ok(ChainHead {
        state: head.output.clone(),
        groups,
        nullifier_root: spent.root(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(seed: u64) -> GroupRoots {
        GroupRoots {
            member_tier: Tier::Small,
            claim_tier: Tier::Small,
            validators: Element::from(seed),
            auditors: Element::from(seed + 1),
            claim_electors: Element::from(seed + 2),
        }
    }

    fn rollup_evidence(seed: u64, nullifier: u64) -> StepEvidence {
        StepEvidence {
            groups: Some(groups(seed)),
            nullifier_root: Some(Element::from(40u64)),
            nullifier: Some(Element::from(nullifier)),
        }
    }

    #[test]
    fn binding_depends_on_every_component() {
        let base = step_binding(Some("aa"), StepKind::Rollup, &rollup_evidence(1, 9));
        assert_ne!(base, step_binding(Some("ab"), StepKind::Rollup, &rollup_evidence(1, 9)));
        assert_ne!(base, step_binding(Some("aa"), StepKind::Rollup, &rollup_evidence(2, 9)));
        assert_ne!(base, step_binding(Some("aa"), StepKind::Rollup, &rollup_evidence(1, 8)));
        let mut bigger = rollup_evidence(1, 9);
        if let Some(groups) = bigger.groups.as_mut() {
            groups.claim_tier = Tier::Medium;
        }
        assert_ne!(base, step_binding(Some("aa"), StepKind::Rollup, &bigger));
        let mut other_root = rollup_evidence(1, 9);
        other_root.nullifier_root = Some(Element::from(41u64));
        assert_ne!(base, step_binding(Some("aa"), StepKind::Rollup, &other_root));
        assert_ne!(
            step_binding(None, StepKind::Init, &StepEvidence::default()),
            step_binding(None, StepKind::Final, &StepEvidence::default())
        );
    }

    #[test]
    fn record_id_commits_to_contents() {
        let state = ClaimState::new(Element::from(1u64), 1, 1);
        let evidence = StepEvidence {
            groups: Some(groups(1)),
            ..StepEvidence::default()
        };
        let record = StepRecord::new(None, StepKind::Init, state.clone(), state, evidence, b"proof");
        assert!(record.check_shape().is_ok());
        assert_eq!(record.shape().unwrap(), CircuitShape::Init);

        let mut tampered = record.clone();
        tampered.output.total = 1;
        assert!(matches!(tampered.check_shape(), Err(TallyError::ChainBroken(_))));

        let json = TallyProof { steps: vec![record.clone()] }.to_json().unwrap();
        let parsed = TallyProof::from_json(&json).unwrap();
        assert_eq!(parsed.steps[0], record);
        assert!(!json.contains("nullifier"));
        assert!(json.contains("claimElectors"));
    }

    #[test]
    fn evidence_must_match_kind() {
        let state = ClaimState::new(Element::from(1u64), 1, 1);
        let bare_init = StepRecord::new(None, StepKind::Init, state.clone(), state.clone(), StepEvidence::default(), b"p");
        assert!(matches!(bare_init.check_shape(), Err(TallyError::ChainBroken(_))));

        let init_with_nullifier =
            StepRecord::new(None, StepKind::Init, state.clone(), state.clone(), rollup_evidence(1, 9), b"p");
        assert!(matches!(init_with_nullifier.check_shape(), Err(TallyError::ChainBroken(_))));

        let rollup = StepRecord::new(Some("aa".into()), StepKind::Rollup, state.clone(), state, rollup_evidence(1, 9), b"p");
        assert!(rollup.check_shape().is_ok());
        assert_eq!(rollup.public_inputs().len(), 22);
        assert_eq!(
            rollup.shape().unwrap(),
            CircuitShape::Rollup {
                members: Tier::Small,
                claim: Tier::Small
            }
        );
    }
}
